//! Block header and block types.

use utxod_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const BLOCK_HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(BLOCK_HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(BLOCK_HEADER_SIZE + 256);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let count = decoder.read_length()?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn size(&self) -> usize {
        self.encode().len()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }

    /// Height committed in the coinbase scriptSig's first push (BIP34).
    pub fn bip34_height(&self) -> Option<i64> {
        let coinbase = self.transactions.first()?;
        let script = &coinbase.vin.first()?.script_sig;
        let opcode = *script.first()?;
        match opcode {
            0x00 => Some(0),
            0x01..=0x08 => {
                let len = opcode as usize;
                let data = script.get(1..1 + len)?;
                Some(script_num(data))
            }
            0x51..=0x60 => Some((opcode - 0x50) as i64),
            _ => None,
        }
    }
}

fn script_num(data: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (idx, byte) in data.iter().enumerate() {
        value |= (*byte as i64) << (8 * idx);
    }
    if let Some(last) = data.last() {
        if last & 0x80 != 0 {
            let mask = !(0x80i64 << (8 * (data.len() - 1)));
            return -(value & mask);
        }
    }
    value
}

/// Bitcoin merkle root: pairwise sha256d, odd levels duplicate their last node.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level = txids.to_vec();
    let mut buf = [0u8; 64];
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(right);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    level[0]
}
