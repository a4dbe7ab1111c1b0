use utxod_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub const fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub const fn null() -> Self {
        Self {
            hash: ZERO_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == u32::MAX
    }

    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }

    /// 36-byte storage key: hash followed by little-endian index.
    pub fn key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.hash);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() < 36 {
            return None;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&key[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&key[32..36]);
        Some(Self {
            hash,
            index: u32::from_le_bytes(index),
        })
    }
}
