//! Per-pass cache of output state.
//!
//! Answers come from memory only. An outpoint the overlay has not seen is
//! reported as unknown, and callers fall through to storage.

use std::collections::HashMap;

use utxod_consensus::Hash256;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::TxOut;

use crate::records::OutputRecord;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedOutput {
    /// Loaded from the output column.
    Stored(OutputRecord),
    /// Created by a transaction that has not been persisted yet.
    Pending(TxOut),
}

impl CachedOutput {
    pub fn txout(&self) -> TxOut {
        match self {
            CachedOutput::Stored(record) => record.txout(),
            CachedOutput::Pending(output) => output.clone(),
        }
    }

    pub fn record(&self) -> Option<&OutputRecord> {
        match self {
            CachedOutput::Stored(record) => Some(record),
            CachedOutput::Pending(_) => None,
        }
    }
}

#[derive(Default)]
struct Entry {
    output: Option<CachedOutput>,
    spent: Option<bool>,
}

#[derive(Default)]
pub struct UtxoOverlay {
    entries: HashMap<OutPoint, Entry>,
    coinbase: HashMap<Hash256, bool>,
}

impl UtxoOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.coinbase.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.coinbase.is_empty()
    }

    /// `Some(true)` spent, `Some(false)` unspent, `None` unknown.
    pub fn spent_state(&self, outpoint: &OutPoint) -> Option<bool> {
        self.entries.get(outpoint).and_then(|entry| entry.spent)
    }

    pub fn mark_spent(&mut self, outpoint: &OutPoint, spent: bool) {
        self.entries.entry(outpoint.clone()).or_default().spent = Some(spent);
    }

    /// Outputs of a disconnected block: their state is unknown again.
    pub fn mark_unavailable(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.entries.get_mut(outpoint) {
            entry.spent = None;
        }
    }

    pub fn all_unspent(&self, outpoints: &[OutPoint]) -> bool {
        outpoints
            .iter()
            .all(|outpoint| self.spent_state(outpoint) == Some(false))
    }

    pub fn output(&self, outpoint: &OutPoint) -> Option<&CachedOutput> {
        self.entries.get(outpoint).and_then(|entry| entry.output.as_ref())
    }

    pub fn cache_output(&mut self, outpoint: &OutPoint, output: CachedOutput) {
        self.entries.entry(outpoint.clone()).or_default().output = Some(output);
    }

    /// Replaces a cached stored record after its row was rewritten.
    pub fn refresh_record(&mut self, outpoint: &OutPoint, record: &OutputRecord) {
        if let Some(entry) = self.entries.get_mut(outpoint) {
            if matches!(entry.output, Some(CachedOutput::Stored(_))) {
                entry.output = Some(CachedOutput::Stored(record.clone()));
            }
        }
    }

    pub fn coinbase(&self, txid: &Hash256) -> Option<bool> {
        self.coinbase.get(txid).copied()
    }

    pub fn cache_coinbase(&mut self, txid: Hash256, is_coinbase: bool) {
        self.coinbase.insert(txid, is_coinbase);
    }
}
