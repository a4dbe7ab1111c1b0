//! Script parsing, templates, sighash and signature verification.

pub mod opcodes;
pub mod sighash;
pub mod standard;
pub mod verify;

use opcodes::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    TruncatedPush,
    NonPushScriptSig,
    StackSize,
    UnsupportedTemplate,
    HashMismatch,
    SignatureFailed,
    Unspendable,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::TruncatedPush => write!(f, "push extends past end of script"),
            ScriptError::NonPushScriptSig => write!(f, "scriptSig is not push-only"),
            ScriptError::StackSize => write!(f, "unexpected number of scriptSig items"),
            ScriptError::UnsupportedTemplate => write!(f, "scriptPubKey template not supported"),
            ScriptError::HashMismatch => write!(f, "pushed data does not match committed hash"),
            ScriptError::SignatureFailed => write!(f, "signature check failed"),
            ScriptError::Unspendable => write!(f, "output is provably unspendable"),
        }
    }
}

impl std::error::Error for ScriptError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// Data push, including `OP_0` (empty data).
    Push { opcode: u8, data: &'a [u8] },
    Op(u8),
}

impl Instruction<'_> {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Push { opcode, .. } => *opcode,
            Instruction::Op(opcode) => *opcode,
        }
    }
}

pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, pos: 0 }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        let end = self.pos.checked_add(len).ok_or(ScriptError::TruncatedPush)?;
        let data = self
            .script
            .get(self.pos..end)
            .ok_or(ScriptError::TruncatedPush)?;
        self.pos = end;
        Ok(data)
    }

    fn take_len(&mut self, width: usize) -> Result<usize, ScriptError> {
        let bytes = self.take(width)?;
        let mut len = 0usize;
        for (idx, byte) in bytes.iter().enumerate() {
            len |= (*byte as usize) << (8 * idx);
        }
        Ok(len)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.pos)?;
        self.pos += 1;
        let len = match opcode {
            OP_0 => Ok(0),
            0x01..=0x4b => Ok(opcode as usize),
            OP_PUSHDATA1 => self.take_len(1),
            OP_PUSHDATA2 => self.take_len(2),
            OP_PUSHDATA4 => self.take_len(4),
            _ => return Some(Ok(Instruction::Op(opcode))),
        };
        let item = len
            .and_then(|len| self.take(len))
            .map(|data| Instruction::Push { opcode, data });
        if item.is_err() {
            self.pos = self.script.len();
        }
        Some(item)
    }
}

/// Pushed data of a push-only script, or `None` if it contains other opcodes
/// or fails to parse. Small-integer opcodes are returned as their number.
pub fn push_data(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    for instruction in instructions(script) {
        match instruction.ok()? {
            Instruction::Push { data, .. } => items.push(data.to_vec()),
            Instruction::Op(opcode) if (OP_1..=OP_16).contains(&opcode) => {
                items.push(vec![opcode - OP_1 + 1]);
            }
            Instruction::Op(OP_1NEGATE) => items.push(vec![0x81]),
            Instruction::Op(_) => return None,
        }
    }
    Some(items)
}

pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|instruction| match instruction {
        Ok(instruction) => instruction.opcode() <= OP_16,
        Err(_) => false,
    })
}

/// True if every push in `script` uses the shortest available encoding.
pub fn has_canonical_pushes(script: &[u8]) -> bool {
    for instruction in instructions(script) {
        let Ok(instruction) = instruction else {
            return false;
        };
        let Instruction::Push { opcode, data } = instruction else {
            continue;
        };
        let canonical = match opcode {
            0x01 => data[0] > 16,
            OP_PUSHDATA1 => data.len() >= OP_PUSHDATA1 as usize,
            OP_PUSHDATA2 => data.len() > 0xff,
            OP_PUSHDATA4 => data.len() > 0xffff,
            _ => true,
        };
        if !canonical {
            return false;
        }
    }
    true
}

/// Signature operations counted the pre-P2SH way: every multisig costs 20.
pub fn legacy_sigop_count(script: &[u8]) -> u32 {
    sigop_count(script, false)
}

/// Signature operations with multisig counted by its declared key count.
pub fn accurate_sigop_count(script: &[u8]) -> u32 {
    sigop_count(script, true)
}

fn sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last = None;
    for instruction in instructions(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        let opcode = instruction.opcode();
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last {
                    Some(prev) if accurate && (OP_1..=OP_16).contains(&prev) => {
                        (prev - OP_1 + 1) as u32
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last = Some(opcode);
    }
    count
}

/// Sigops of the redeem script carried by a scriptSig that spends P2SH.
pub fn p2sh_sigop_count(script_sig: &[u8]) -> u32 {
    if !is_push_only(script_sig) {
        return 0;
    }
    let mut redeem: &[u8] = &[];
    for instruction in instructions(script_sig).flatten() {
        if let Instruction::Push { data, .. } = instruction {
            redeem = data;
        }
    }
    accurate_sigop_count(redeem)
}
