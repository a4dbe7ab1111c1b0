//! Column-oriented key-value storage backends.

use std::fmt;
use std::sync::Arc;

pub mod memory;
pub mod staged;

#[cfg(feature = "fjall")]
pub mod fjall;

pub use staged::StagedStore;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    RawBlock,
    Block,
    BlockByParent,
    HeightIndex,
    BlockTx,
    TxBlock,
    RawTx,
    Tx,
    Input,
    Spend,
    Output,
    AddressOutput,
    Ledger,
    AddressLedger,
    Utxo,
    AddressUtxo,
    UnconfirmedRawTx,
    UnconfirmedTx,
    UnconfirmedInput,
    UnconfirmedSpend,
    UnconfirmedOutput,
    UnconfirmedLedger,
    Meta,
}

impl Column {
    pub const ALL: [Column; 23] = [
        Column::RawBlock,
        Column::Block,
        Column::BlockByParent,
        Column::HeightIndex,
        Column::BlockTx,
        Column::TxBlock,
        Column::RawTx,
        Column::Tx,
        Column::Input,
        Column::Spend,
        Column::Output,
        Column::AddressOutput,
        Column::Ledger,
        Column::AddressLedger,
        Column::Utxo,
        Column::AddressUtxo,
        Column::UnconfirmedRawTx,
        Column::UnconfirmedTx,
        Column::UnconfirmedInput,
        Column::UnconfirmedSpend,
        Column::UnconfirmedOutput,
        Column::UnconfirmedLedger,
        Column::Meta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::RawBlock => "raw_block",
            Column::Block => "block",
            Column::BlockByParent => "block_by_parent",
            Column::HeightIndex => "height_index",
            Column::BlockTx => "block_tx",
            Column::TxBlock => "tx_block",
            Column::RawTx => "raw_tx",
            Column::Tx => "tx",
            Column::Input => "input",
            Column::Spend => "spend",
            Column::Output => "output",
            Column::AddressOutput => "address_output",
            Column::Ledger => "ledger",
            Column::AddressLedger => "address_ledger",
            Column::Utxo => "utxo",
            Column::AddressUtxo => "address_utxo",
            Column::UnconfirmedRawTx => "unconfirmed_raw_tx",
            Column::UnconfirmedTx => "unconfirmed_tx",
            Column::UnconfirmedInput => "unconfirmed_input",
            Column::UnconfirmedSpend => "unconfirmed_spend",
            Column::UnconfirmedOutput => "unconfirmed_output",
            Column::UnconfirmedLedger => "unconfirmed_ledger",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    /// Entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    /// Applies every operation or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
