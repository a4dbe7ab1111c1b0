//! Bitcoin consensus serialization helpers.

use utxod_consensus::Hash256;

/// Largest length prefix accepted when decoding.
pub const MAX_SIZE: u64 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    TrailingBytes,
    SizeTooLarge,
    NonCanonicalVarInt,
    InvalidData(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of data"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after value"),
            DecodeError::SizeTooLarge => write!(f, "length prefix too large"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical compact size"),
            DecodeError::InvalidData(message) => write!(f, "invalid data: {message}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let prefix = self.read_u8()?;
        let (value, min) = match prefix {
            0xfd => (self.read_u16_le()? as u64, 0xfd),
            0xfe => (self.read_u32_le()? as u64, 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            value => return Ok(value as u64),
        };
        if value < min {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        Ok(value)
    }

    pub fn read_length(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_varint()?;
        if len > MAX_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidData("string is not utf-8"))
    }

    pub fn finish(self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_widths() {
        let mut encoder = Encoder::new();
        encoder.write_varint(0xfc);
        encoder.write_varint(0xfd);
        encoder.write_varint(0x1_0000);
        assert_eq!(
            encoder.into_inner(),
            vec![0xfc, 0xfd, 0xfd, 0x00, 0xfe, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn rejects_non_canonical_varint() {
        let mut decoder = Decoder::new(&[0xfd, 0x10, 0x00]);
        assert_eq!(decoder.read_varint(), Err(DecodeError::NonCanonicalVarInt));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut decoder = Decoder::new(&[0xfe, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(decoder.read_var_bytes(), Err(DecodeError::SizeTooLarge));
    }

    #[test]
    fn finish_reports_trailing_bytes() {
        let mut decoder = Decoder::new(&[1, 2]);
        assert_eq!(decoder.read_u8(), Ok(1));
        assert_eq!(decoder.finish(), Err(DecodeError::TrailingBytes));
    }
}
