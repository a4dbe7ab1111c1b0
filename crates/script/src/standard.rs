//! Standard output templates.

use utxod_consensus::constants::MAX_OP_RETURN_RELAY;
use utxod_primitives::address::{Address, AddressKind};

use crate::opcodes::*;
use crate::{instructions, Instruction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
}

impl ScriptType {
    pub fn as_u8(self) -> u8 {
        match self {
            ScriptType::NonStandard => 0,
            ScriptType::PubKey => 1,
            ScriptType::PubKeyHash => 2,
            ScriptType::ScriptHash => 3,
            ScriptType::Multisig => 4,
            ScriptType::NullData => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ScriptType::NonStandard),
            1 => Some(ScriptType::PubKey),
            2 => Some(ScriptType::PubKeyHash),
            3 => Some(ScriptType::ScriptHash),
            4 => Some(ScriptType::Multisig),
            5 => Some(ScriptType::NullData),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::NonStandard => "nonstandard",
            ScriptType::PubKey => "pubkey",
            ScriptType::PubKeyHash => "pubkeyhash",
            ScriptType::ScriptHash => "scripthash",
            ScriptType::Multisig => "multisig",
            ScriptType::NullData => "nulldata",
        }
    }
}

pub fn classify(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2sh(script) {
        ScriptType::ScriptHash
    } else if pubkey_of(script).is_some() {
        ScriptType::PubKey
    } else if multisig_keys(script).is_some() {
        ScriptType::Multisig
    } else if is_null_data(script) {
        ScriptType::NullData
    } else {
        ScriptType::NonStandard
    }
}

pub fn is_standard(script: &[u8]) -> bool {
    classify(script) != ScriptType::NonStandard
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

pub(crate) fn pubkey_of(script: &[u8]) -> Option<&[u8]> {
    let (last, body) = script.split_last()?;
    if *last != OP_CHECKSIG {
        return None;
    }
    let len = *body.first()? as usize;
    if body.len() != len + 1 || !is_pubkey(&body[1..]) {
        return None;
    }
    Some(&body[1..])
}

/// Required signature count and public keys of a bare `m-of-n` multisig.
pub fn multisig_keys(script: &[u8]) -> Option<(usize, Vec<&[u8]>)> {
    let parsed: Vec<Instruction<'_>> = instructions(script).collect::<Result<_, _>>().ok()?;
    let (first, rest) = parsed.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, keys) = rest.split_last()?;
    if last.opcode() != OP_CHECKMULTISIG {
        return None;
    }
    let required = small_int(first.opcode())?;
    let total = small_int(count.opcode())?;
    if required == 0 || required > total || total != keys.len() || total > 3 {
        return None;
    }
    let mut pubkeys = Vec::with_capacity(keys.len());
    for key in keys {
        match key {
            Instruction::Push { data, .. } if is_pubkey(data) => pubkeys.push(*data),
            _ => return None,
        }
    }
    Some((required, pubkeys))
}

fn small_int(opcode: u8) -> Option<usize> {
    (OP_1..=OP_16)
        .contains(&opcode)
        .then(|| (opcode - OP_1 + 1) as usize)
}

fn is_null_data(script: &[u8]) -> bool {
    if script.first() != Some(&OP_RETURN) {
        return false;
    }
    let mut rest = instructions(&script[1..]);
    match rest.next() {
        None => true,
        Some(Ok(Instruction::Push { data, .. })) => {
            data.len() <= MAX_OP_RETURN_RELAY && rest.next().is_none()
        }
        _ => false,
    }
}

pub fn script_hash(script: &[u8]) -> Option<[u8; 20]> {
    if !is_p2sh(script) {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    Some(hash)
}

pub fn pubkey_hash(script: &[u8]) -> Option<[u8; 20]> {
    if !is_p2pkh(script) {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}

/// Number of scriptSig items a standard spend of `script` pushes, excluding
/// any P2SH redeem script contents.
pub fn args_expected(script_type: ScriptType, script: &[u8]) -> Option<usize> {
    match script_type {
        ScriptType::PubKey => Some(1),
        ScriptType::PubKeyHash => Some(2),
        ScriptType::ScriptHash => Some(1),
        ScriptType::Multisig => multisig_keys(script).map(|(required, _)| required + 1),
        ScriptType::NullData | ScriptType::NonStandard => None,
    }
}

/// Addresses an output pays to. Bare pubkey and multisig outputs are
/// reported under the hash160 of each key.
pub fn extract_addresses(script: &[u8]) -> Vec<Address> {
    use utxod_primitives::hash::hash160;

    let key_hash = |hash| Address {
        kind: AddressKind::KeyHash,
        hash,
    };
    match classify(script) {
        ScriptType::PubKeyHash => pubkey_hash(script).map(key_hash).into_iter().collect(),
        ScriptType::ScriptHash => script_hash(script)
            .map(|hash| Address {
                kind: AddressKind::ScriptHash,
                hash,
            })
            .into_iter()
            .collect(),
        ScriptType::PubKey => pubkey_of(script)
            .map(|key| key_hash(hash160(key)))
            .into_iter()
            .collect(),
        ScriptType::Multisig => {
            let mut out: Vec<Address> = Vec::new();
            if let Some((_, keys)) = multisig_keys(script) {
                for key in keys {
                    let address = key_hash(hash160(key));
                    if !out.contains(&address) {
                        out.push(address);
                    }
                }
            }
            out
        }
        ScriptType::NullData | ScriptType::NonStandard => Vec::new(),
    }
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}
