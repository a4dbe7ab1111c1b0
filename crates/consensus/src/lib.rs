//! Consensus constants, money rules and network parameters.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use params::{chain_params, ChainParams, Checkpoint, ConsensusParams, Network};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    InvalidLength(usize),
    InvalidDigit,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength(len) => write!(f, "expected 64 hex characters, got {len}"),
            HexError::InvalidDigit => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a hash from its display form (byte-reversed hex).
pub fn hash256_from_hex(value: &str) -> Result<Hash256, HexError> {
    if value.len() != 64 {
        return Err(HexError::InvalidLength(value.len()));
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(value, &mut bytes).map_err(|_| HexError::InvalidDigit)?;
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hex_is_byte_reversed() {
        let hash = hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("genesis hash");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(
            hash256_to_hex(&hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn rejects_short_hex() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError::InvalidLength(4)));
    }
}
