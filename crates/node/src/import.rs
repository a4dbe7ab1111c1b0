//! Bulk import of length-framed raw blocks.
//!
//! Each frame is the network magic, a little-endian u32 payload length and
//! the serialized block. Zero padding after the last frame is tolerated.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Context};
use log::{info, warn};
use utxod_chainstate::ValidationEngine;
use utxod_consensus::constants::MAX_BLOCK_SIZE;
use utxod_consensus::hash256_to_hex;
use utxod_primitives::block::Block;
use utxod_script::verify::ScriptVerifier;
use utxod_storage::KeyValueStore;

const PROGRESS_INTERVAL: u64 = 1_000;

pub struct FrameReader<R> {
    reader: R,
    magic: [u8; 4],
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, magic: [u8; 4]) -> Self {
        Self {
            reader,
            magic,
            offset: 0,
        }
    }

    /// The next payload, or `None` at end of input.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 8];
        let filled = read_full(&mut self.reader, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if header[..filled].iter().all(|byte| *byte == 0) {
            return Ok(None);
        }
        if filled < header.len() {
            bail!("truncated frame header at offset {}", self.offset);
        }
        if header[..4] != self.magic {
            bail!(
                "bad magic {} at offset {}",
                hex::encode(&header[..4]),
                self.offset
            );
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len == 0 || len > MAX_BLOCK_SIZE {
            bail!("frame length {len} out of range at offset {}", self.offset);
        }
        let mut payload = vec![0u8; len];
        if read_full(&mut self.reader, &mut payload)? < len {
            bail!("truncated frame payload at offset {}", self.offset);
        }
        self.offset += (header.len() + len) as u64;
        Ok(Some(payload))
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

pub fn encode_frame(magic: [u8; 4], block: &Block) -> Vec<u8> {
    let payload = block.encode();
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub cancelled: bool,
}

/// Feeds every framed block to the engine. Rejections are logged and
/// counted, anything else aborts the import. `cancel` is polled between
/// blocks, so the block in flight always finishes.
pub fn import_blocks<S, V, R>(
    engine: &mut ValidationEngine<S, V>,
    frames: &mut FrameReader<R>,
    cancel: &AtomicBool,
) -> anyhow::Result<ImportSummary>
where
    S: KeyValueStore,
    V: ScriptVerifier,
    R: Read,
{
    let started = Instant::now();
    let mut summary = ImportSummary::default();
    loop {
        if cancel.load(Ordering::SeqCst) {
            summary.cancelled = true;
            warn!("import interrupted after {} blocks", summary.read);
            break;
        }
        let Some(payload) = frames.next_frame()? else {
            break;
        };
        summary.read += 1;
        let block = Block::decode(&payload)
            .with_context(|| format!("undecodable block #{}", summary.read))?;
        let hash = block.hash();
        if engine
            .process_block(&block, false, None)
            .with_context(|| format!("import failed at {}", hash256_to_hex(&hash)))?
        {
            summary.accepted += 1;
        } else {
            summary.rejected += 1;
        }
        if summary.read % PROGRESS_INTERVAL == 0 {
            info!(
                "imported {} blocks ({} rejected) in {:.1}s",
                summary.read,
                summary.rejected,
                started.elapsed().as_secs_f64()
            );
        }
    }
    info!(
        "import done: {} read, {} accepted, {} rejected",
        summary.read, summary.accepted, summary.rejected
    );
    Ok(summary)
}

pub fn import_file<S, V>(
    engine: &mut ValidationEngine<S, V>,
    path: &Path,
    cancel: &AtomicBool,
) -> anyhow::Result<ImportSummary>
where
    S: KeyValueStore,
    V: ScriptVerifier,
{
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let magic = engine.params().message_start;
    let mut frames = FrameReader::new(BufReader::new(file), magic);
    import_blocks(engine, &mut frames, cancel)
}
