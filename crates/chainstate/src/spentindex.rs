//! Spending-input join: maps an outpoint to the inputs that reference it.
//!
//! Rows are keyed `prevout || spender txid || input position` with an empty
//! value, in either the confirmed or the unconfirmed spend column.

use utxod_consensus::Hash256;
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::{Column, KeyValueStore, StagedStore, StoreError};

const OUTPOINT_KEY_LEN: usize = 36;
const SPEND_KEY_LEN: usize = OUTPOINT_KEY_LEN + 32 + 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Spender {
    pub prevout_index: u32,
    pub txid: Hash256,
    pub input_index: u32,
}

pub fn spend_key(prevout: &OutPoint, spender: &Hash256, input_index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(SPEND_KEY_LEN);
    key.extend_from_slice(&prevout.key());
    key.extend_from_slice(spender);
    key.extend_from_slice(&input_index.to_be_bytes());
    key
}

fn decode_spend_key(key: &[u8]) -> Option<Spender> {
    if key.len() != SPEND_KEY_LEN {
        return None;
    }
    let prevout = OutPoint::from_key(&key[..OUTPOINT_KEY_LEN])?;
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[OUTPOINT_KEY_LEN..OUTPOINT_KEY_LEN + 32]);
    let input_index = u32::from_be_bytes(key[OUTPOINT_KEY_LEN + 32..].try_into().ok()?);
    Some(Spender {
        prevout_index: prevout.index,
        txid,
        input_index,
    })
}

/// Inputs spending `prevout`.
pub(crate) fn spenders_of<S: KeyValueStore>(
    db: &StagedStore<S>,
    column: Column,
    prevout: &OutPoint,
) -> Result<Vec<Spender>, StoreError> {
    scan(db, column, &prevout.key())
}

/// Inputs spending any output of `txid`.
pub(crate) fn spenders_of_tx<S: KeyValueStore>(
    db: &StagedStore<S>,
    column: Column,
    txid: &Hash256,
) -> Result<Vec<Spender>, StoreError> {
    scan(db, column, txid)
}

fn scan<S: KeyValueStore>(
    db: &StagedStore<S>,
    column: Column,
    prefix: &[u8],
) -> Result<Vec<Spender>, StoreError> {
    let entries = db.scan_prefix(column, prefix)?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| decode_spend_key(key))
        .collect())
}
