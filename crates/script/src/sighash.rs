//! Legacy (pre-segwit) signature hash.

use utxod_consensus::Hash256;
use utxod_primitives::encoding::Encoder;
use utxod_primitives::hash::sha256d;
use utxod_primitives::transaction::{Transaction, TxOut};

use crate::opcodes::OP_CODESEPARATOR;
use crate::{instructions, Instruction};

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// The value 1, returned for out-of-range inputs and unmatched SIGHASH_SINGLE.
const ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return ONE;
    }
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        return ONE;
    }

    let script_code = strip_codeseparators(script_code);
    let mut copy = tx.clone();
    for (idx, input) in copy.vin.iter_mut().enumerate() {
        input.script_sig = if idx == input_index {
            script_code.clone()
        } else {
            Vec::new()
        };
    }

    match base_type {
        SIGHASH_NONE => {
            copy.vout.clear();
            zero_other_sequences(&mut copy, input_index);
        }
        SIGHASH_SINGLE => {
            copy.vout.truncate(input_index + 1);
            for output in copy.vout.iter_mut().take(input_index) {
                *output = TxOut {
                    value: -1,
                    script_pubkey: Vec::new(),
                };
            }
            zero_other_sequences(&mut copy, input_index);
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let input = copy.vin.swap_remove(input_index);
        copy.vin = vec![input];
    }

    let mut encoder = Encoder::with_capacity(256);
    copy.consensus_encode(&mut encoder);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (idx, input) in tx.vin.iter_mut().enumerate() {
        if idx != input_index {
            input.sequence = 0;
        }
    }
}

fn strip_codeseparators(script: &[u8]) -> Vec<u8> {
    if !script.contains(&OP_CODESEPARATOR) {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0;
    for instruction in instructions(script) {
        let Ok(instruction) = instruction else {
            out.extend_from_slice(&script[pos..]);
            break;
        };
        let len = match instruction {
            Instruction::Push { opcode, data } => push_header_len(opcode) + data.len(),
            Instruction::Op(_) => 1,
        };
        if instruction != Instruction::Op(OP_CODESEPARATOR) {
            out.extend_from_slice(&script[pos..pos + len]);
        }
        pos += len;
    }
    out
}

fn push_header_len(opcode: u8) -> usize {
    match opcode {
        crate::opcodes::OP_PUSHDATA1 => 2,
        crate::opcodes::OP_PUSHDATA2 => 3,
        crate::opcodes::OP_PUSHDATA4 => 5,
        _ => 1,
    }
}
