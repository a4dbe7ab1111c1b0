//! Transaction types and serialization.

use utxod_consensus::constants::LOCKTIME_THRESHOLD;
use utxod_consensus::money::Amount;
use utxod_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: OutPoint::consensus_decode(decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }

    pub fn serialized_size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_len = decoder.read_length()?;
        let mut vin = Vec::with_capacity(vin_len.min(1024));
        for _ in 0..vin_len {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_len = decoder.read_length()?;
        let mut vout = Vec::with_capacity(vout_len.min(1024));
        for _ in 0..vout_len {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::consensus_decode(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode())
    }

    pub fn size(&self) -> usize {
        self.encode().len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Sum of output values; `None` when the sum overflows.
    pub fn value_out(&self) -> Option<Amount> {
        self.vout
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }

    pub fn is_final(&self, height: u32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(lock_time: u32, sequence: u32) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 0),
                script_sig: vec![0x51],
                sequence,
            }],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time,
        }
    }

    #[test]
    fn lock_time_by_height_and_time() {
        assert!(spend(0, 0).is_final(0, 0));
        assert!(spend(100, 0).is_final(101, 0));
        assert!(!spend(100, 0).is_final(100, 0));
        assert!(spend(100, SEQUENCE_FINAL).is_final(100, 0));
        assert!(!spend(LOCKTIME_THRESHOLD + 10, 0).is_final(1_000_000, LOCKTIME_THRESHOLD as i64));
        assert!(spend(LOCKTIME_THRESHOLD + 10, 0).is_final(0, LOCKTIME_THRESHOLD as i64 + 11));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = spend(0, 0).encode();
        assert_eq!(Transaction::decode(&bytes), Ok(spend(0, 0)));
        bytes.push(0);
        assert_eq!(Transaction::decode(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = spend(0, 0);
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn value_out_detects_overflow() {
        let mut tx = spend(0, 0);
        tx.vout.push(TxOut {
            value: i64::MAX,
            script_pubkey: Vec::new(),
        });
        assert_eq!(tx.value_out(), None);
    }
}
