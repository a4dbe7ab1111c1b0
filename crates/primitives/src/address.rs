//! Base58Check pay-to-pubkey-hash and pay-to-script-hash addresses.

use crate::hash::sha256d;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidCharacter(char),
    InvalidChecksum,
    InvalidLength(usize),
    UnknownPrefix(u8),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidCharacter(c) => write!(f, "invalid base58 character {c:?}"),
            AddressError::InvalidChecksum => write!(f, "address checksum mismatch"),
            AddressError::InvalidLength(len) => write!(f, "invalid address payload length {len}"),
            AddressError::UnknownPrefix(prefix) => write!(f, "unknown address prefix {prefix}"),
        }
    }
}

impl std::error::Error for AddressError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    KeyHash,
    ScriptHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    pub fn encode(&self, pubkey_prefix: u8, script_prefix: u8) -> String {
        let prefix = match self.kind {
            AddressKind::KeyHash => pubkey_prefix,
            AddressKind::ScriptHash => script_prefix,
        };
        let mut payload = Vec::with_capacity(21);
        payload.push(prefix);
        payload.extend_from_slice(&self.hash);
        base58check_encode(&payload)
    }

    pub fn decode(value: &str, pubkey_prefix: u8, script_prefix: u8) -> Result<Self, AddressError> {
        let payload = base58check_decode(value)?;
        if payload.len() != 21 {
            return Err(AddressError::InvalidLength(payload.len()));
        }
        let kind = if payload[0] == pubkey_prefix {
            AddressKind::KeyHash
        } else if payload[0] == script_prefix {
            AddressKind::ScriptHash
        } else {
            return Err(AddressError::UnknownPrefix(payload[0]));
        };
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self { kind, hash })
    }
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = sha256d(payload);
    let mut data = payload.to_vec();
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

pub fn base58check_decode(value: &str) -> Result<Vec<u8>, AddressError> {
    let data = base58_decode(value)?;
    if data.len() < 4 {
        return Err(AddressError::InvalidLength(data.len()));
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if sha256d(payload)[..4] != *checksum {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|byte| **byte == 0).count();
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for byte in &data[zeros..] {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('1').take(zeros));
    out.extend(digits.iter().rev().map(|digit| ALPHABET[*digit as usize] as char));
    out
}

fn base58_decode(value: &str) -> Result<Vec<u8>, AddressError> {
    let zeros = value.chars().take_while(|c| *c == '1').count();
    let mut bytes: Vec<u8> = Vec::with_capacity(value.len());
    for c in value.chars().skip(zeros) {
        let digit = ALPHABET
            .iter()
            .position(|symbol| *symbol as char == c)
            .ok_or(AddressError::InvalidCharacter(c))? as u32;
        let mut carry = digit;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}
