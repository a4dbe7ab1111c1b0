//! Typed rows persisted by the chain store, and their keys.

use primitive_types::U256;
use utxod_consensus::money::Amount;
use utxod_consensus::Hash256;
use utxod_primitives::block::BlockHeader;
use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_script::standard::{classify, ScriptType};

use crate::address_index::address_prefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Branch {
    Main,
    Side,
    Orphan,
}

impl Branch {
    pub fn as_u8(self) -> u8 {
        match self {
            Branch::Main => 0,
            Branch::Side => 1,
            Branch::Orphan => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Branch::Main),
            1 => Ok(Branch::Side),
            2 => Ok(Branch::Orphan),
            _ => Err(DecodeError::InvalidData("unknown branch")),
        }
    }
}

/// Where a confirmed transaction currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxPool {
    /// Included in a main-branch block.
    Tip,
    /// Only included in side or orphan blocks.
    Block,
    Conflict,
}

impl TxPool {
    pub fn as_u8(self) -> u8 {
        match self {
            TxPool::Tip => 1,
            TxPool::Block => 2,
            TxPool::Conflict => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(TxPool::Tip),
            2 => Ok(TxPool::Block),
            3 => Ok(TxPool::Conflict),
            _ => Err(DecodeError::InvalidData("unknown tx pool")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnconfirmedPool {
    Memory,
    Orphan,
    Conflict,
}

impl UnconfirmedPool {
    pub fn as_u8(self) -> u8 {
        match self {
            UnconfirmedPool::Memory => 1,
            UnconfirmedPool::Orphan => 2,
            UnconfirmedPool::Conflict => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(UnconfirmedPool::Memory),
            2 => Ok(UnconfirmedPool::Orphan),
            3 => Ok(UnconfirmedPool::Conflict),
            _ => Err(DecodeError::InvalidData("unknown unconfirmed pool")),
        }
    }
}

/// Fee accounting computed while checking a transaction's inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxSummary {
    pub fee: Amount,
    pub total_in: Amount,
    pub total_out: Amount,
}

impl TxSummary {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.fee);
        encoder.write_i64_le(self.total_in);
        encoder.write_i64_le(self.total_out);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            fee: decoder.read_i64_le()?,
            total_in: decoder.read_i64_le()?,
            total_out: decoder.read_i64_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub branch: Branch,
    /// Cumulative chain work up to and including this block.
    pub work: U256,
    pub size: u32,
    pub tx_count: u32,
    pub summary: TxSummary,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        self.header.consensus_encode(&mut encoder);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.branch.as_u8());
        encoder.write_bytes(&self.work.to_little_endian());
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.tx_count);
        self.summary.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let height = decoder.read_u32_le()?;
        let branch = Branch::from_u8(decoder.read_u8()?)?;
        let work = U256::from_little_endian(&decoder.read_fixed::<32>()?);
        let size = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let summary = TxSummary::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(Self {
            header,
            height,
            branch,
            work,
            size,
            tx_count,
            summary,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub version: i32,
    pub lock_time: u32,
    pub size: u32,
    pub pool: TxPool,
    /// Main-branch height, 0 while the transaction is not on the main branch.
    pub height: u32,
    pub is_coinbase: bool,
    pub input_count: u32,
    pub output_count: u32,
    pub summary: TxSummary,
}

impl TxRecord {
    pub fn new(tx: &Transaction, pool: TxPool, height: u32, summary: TxSummary) -> Self {
        Self {
            version: tx.version,
            lock_time: tx.lock_time,
            size: tx.size() as u32,
            pool,
            height,
            is_coinbase: tx.is_coinbase(),
            input_count: tx.vin.len() as u32,
            output_count: tx.vout.len() as u32,
            summary,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(64);
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.lock_time);
        encoder.write_u32_le(self.size);
        encoder.write_u8(self.pool.as_u8());
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.write_u32_le(self.input_count);
        encoder.write_u32_le(self.output_count);
        self.summary.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self {
            version: decoder.read_i32_le()?,
            lock_time: decoder.read_u32_le()?,
            size: decoder.read_u32_le()?,
            pool: TxPool::from_u8(decoder.read_u8()?)?,
            height: decoder.read_u32_le()?,
            is_coinbase: decoder.read_u8()? != 0,
            input_count: decoder.read_u32_le()?,
            output_count: decoder.read_u32_le()?,
            summary: TxSummary::decode_from(&mut decoder)?,
        };
        decoder.finish()?;
        Ok(record)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnconfirmedTxRecord {
    pub pool: UnconfirmedPool,
    pub size: u32,
    pub input_count: u32,
    pub output_count: u32,
    pub summary: TxSummary,
}

impl UnconfirmedTxRecord {
    pub fn new(tx: &Transaction, pool: UnconfirmedPool, summary: TxSummary) -> Self {
        Self {
            pool,
            size: tx.size() as u32,
            input_count: tx.vin.len() as u32,
            output_count: tx.vout.len() as u32,
            summary,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(40);
        encoder.write_u8(self.pool.as_u8());
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.input_count);
        encoder.write_u32_le(self.output_count);
        self.summary.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self {
            pool: UnconfirmedPool::from_u8(decoder.read_u8()?)?,
            size: decoder.read_u32_le()?,
            input_count: decoder.read_u32_le()?,
            output_count: decoder.read_u32_le()?,
            summary: TxSummary::decode_from(&mut decoder)?,
        };
        decoder.finish()?;
        Ok(record)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRecord {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl InputRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.prevout.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self {
            prevout: OutPoint::consensus_decode(&mut decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        };
        decoder.finish()?;
        Ok(record)
    }
}

/// A transaction output with its spend state. Unconfirmed outputs are kept
/// with `branch` set to `Main`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
    pub amount: Amount,
    pub script_pubkey: Vec<u8>,
    pub script_type: ScriptType,
    pub spent: bool,
    pub branch: Branch,
    pub addresses: Vec<String>,
}

impl OutputRecord {
    pub fn new(output: &TxOut, addresses: Vec<String>, spent: bool, branch: Branch) -> Self {
        Self {
            amount: output.value,
            script_pubkey: output.script_pubkey.clone(),
            script_type: classify(&output.script_pubkey),
            spent,
            branch,
            addresses,
        }
    }

    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.amount,
            script_pubkey: self.script_pubkey.clone(),
        }
    }

    /// Unspent and on the main branch.
    pub fn is_spendable(&self) -> bool {
        !self.spent && self.branch == Branch::Main
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.amount);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u8(self.script_type.as_u8());
        encoder.write_u8(u8::from(self.spent));
        encoder.write_u8(self.branch.as_u8());
        encoder.write_varint(self.addresses.len() as u64);
        for address in &self.addresses {
            encoder.write_var_str(address);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let amount = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let script_type = ScriptType::from_u8(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown script type"))?;
        let spent = decoder.read_u8()? != 0;
        let branch = Branch::from_u8(decoder.read_u8()?)?;
        let count = decoder.read_length()?;
        let mut addresses = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            addresses.push(decoder.read_var_str()?);
        }
        decoder.finish()?;
        Ok(Self {
            amount,
            script_pubkey,
            script_type,
            spent,
            branch,
            addresses,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LedgerKind {
    Input,
    Output,
}

impl LedgerKind {
    fn as_u8(self) -> u8 {
        match self {
            LedgerKind::Input => 0,
            LedgerKind::Output => 1,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LedgerKind::Input),
            1 => Some(LedgerKind::Output),
            _ => None,
        }
    }
}

/// A signed balance change of one address caused by one input or output.
/// An empty address stands for "unknown".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub txid: Hash256,
    pub kind: LedgerKind,
    pub position: u32,
    pub address: String,
    pub amount: Amount,
}

impl LedgerEntry {
    /// Key in the per-transaction ledger: txid, kind, position, address.
    pub fn key(&self) -> Vec<u8> {
        let mut key = ledger_prefix(&self.txid, Some(self.kind));
        key.extend_from_slice(&self.position.to_be_bytes());
        key.extend_from_slice(self.address.as_bytes());
        key
    }

    /// Key in the per-address ledger: address, txid, kind, position.
    pub fn address_key(&self) -> Vec<u8> {
        let mut key = address_prefix(&self.address);
        key.extend_from_slice(&self.txid);
        key.push(self.kind.as_u8());
        key.extend_from_slice(&self.position.to_be_bytes());
        key
    }

    pub fn from_row(key: &[u8], value: &[u8]) -> Result<Self, DecodeError> {
        if key.len() < 37 || value.len() != 8 {
            return Err(DecodeError::InvalidData("ledger row"));
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let kind = LedgerKind::from_u8(key[32]).ok_or(DecodeError::InvalidData("ledger kind"))?;
        let position = u32::from_be_bytes([key[33], key[34], key[35], key[36]]);
        let address = String::from_utf8(key[37..].to_vec())
            .map_err(|_| DecodeError::InvalidData("ledger address"))?;
        let mut amount = [0u8; 8];
        amount.copy_from_slice(value);
        Ok(Self {
            txid,
            kind,
            position,
            address,
            amount: i64::from_le_bytes(amount),
        })
    }
}

pub fn ledger_prefix(txid: &Hash256, kind: Option<LedgerKind>) -> Vec<u8> {
    let mut key = Vec::with_capacity(80);
    key.extend_from_slice(txid);
    if let Some(kind) = kind {
        key.push(kind.as_u8());
    }
    key
}

/// `hash || position`, with a big-endian position so rows sort in order.
pub fn position_key(hash: &Hash256, position: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(hash);
    key.extend_from_slice(&position.to_be_bytes());
    key
}

pub fn pair_key(first: &Hash256, second: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(first);
    key.extend_from_slice(second);
    key
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub fn hash_from_bytes(bytes: &[u8]) -> Result<Hash256, DecodeError> {
    let mut hash = [0u8; 32];
    if bytes.len() != 32 {
        return Err(DecodeError::InvalidData("hash length"));
    }
    hash.copy_from_slice(bytes);
    Ok(hash)
}

pub fn amount_from_bytes(bytes: &[u8]) -> Result<Amount, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let amount = decoder.read_i64_le()?;
    decoder.finish()?;
    Ok(amount)
}

pub const TIP_KEY: &[u8] = b"tip";
