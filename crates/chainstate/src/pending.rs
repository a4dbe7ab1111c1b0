//! Unconfirmed transactions: the memory pool, staged orphans and conflicts.
//!
//! Pool state lives in the unconfirmed columns of the chain store, so the
//! pool itself only carries policy.

use std::collections::{HashSet, VecDeque};

use utxod_consensus::constants::MAX_ORPHAN_TX_SIZE;
use utxod_consensus::{hash256_to_hex, Hash256};
use utxod_primitives::block::Block;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_storage::{Column, KeyValueStore};

use crate::address_index::ledger_addresses;
use crate::error::EngineError;
use crate::records::{
    ledger_prefix, position_key, Branch, InputRecord, LedgerEntry, LedgerKind, OutputRecord,
    TxPool, TxSummary, UnconfirmedPool, UnconfirmedTxRecord,
};
use crate::spentindex::{spend_key, spenders_of, spenders_of_tx};
use crate::store::ChainStore;

#[derive(Clone, Copy, Debug)]
pub struct PendingPool {
    max_orphan_tx_size: usize,
}

impl Default for PendingPool {
    fn default() -> Self {
        Self {
            max_orphan_tx_size: MAX_ORPHAN_TX_SIZE,
        }
    }
}

impl PendingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<Option<UnconfirmedTxRecord>, EngineError> {
        match store.db().get(Column::UnconfirmedTx, txid)? {
            Some(bytes) => Ok(Some(UnconfirmedTxRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn transaction<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<Option<Transaction>, EngineError> {
        match store.db().get(Column::UnconfirmedRawTx, txid)? {
            Some(bytes) => Ok(Some(Transaction::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn pool_of<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<Option<UnconfirmedPool>, EngineError> {
        Ok(self.record(store, txid)?.map(|record| record.pool))
    }

    /// In the memory pool proper; orphans and conflicts do not count.
    pub fn exists<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<bool, EngineError> {
        Ok(self.pool_of(store, txid)? == Some(UnconfirmedPool::Memory))
    }

    pub fn exists_including_main_branch<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<bool, EngineError> {
        if self.exists(store, txid)? {
            return Ok(true);
        }
        Ok(store
            .tx_record(txid)?
            .is_some_and(|record| record.pool == TxPool::Tip))
    }

    fn output_record<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        outpoint: &OutPoint,
    ) -> Result<Option<OutputRecord>, EngineError> {
        match store.db().get(Column::UnconfirmedOutput, &outpoint.key())? {
            Some(bytes) => Ok(Some(OutputRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// An unspent output of a memory-pool transaction.
    pub fn is_output_available<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        outpoint: &OutPoint,
    ) -> Result<bool, EngineError> {
        let Some(record) = self.output_record(store, outpoint)? else {
            return Ok(false);
        };
        Ok(!record.spent && self.exists(store, &outpoint.hash)?)
    }

    pub fn output<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        outpoint: &OutPoint,
    ) -> Result<Option<TxOut>, EngineError> {
        Ok(self
            .output_record(store, outpoint)?
            .map(|record| record.txout()))
    }

    /// Whether another memory-pool transaction already spends one of the
    /// outputs `tx` spends.
    pub fn any_inputs_spent<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        tx: &Transaction,
    ) -> Result<bool, EngineError> {
        if tx.is_coinbase() {
            return Ok(false);
        }
        let txid = tx.txid();
        for input in &tx.vin {
            for spender in spenders_of(store.db(), Column::UnconfirmedSpend, &input.prevout)? {
                if spender.txid != txid && self.exists(store, &spender.txid)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Inserts a transaction the engine has already validated.
    pub fn add_unchecked<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        tx: &Transaction,
        summary: TxSummary,
        on_disconnect: bool,
    ) -> Result<(), EngineError> {
        let txid = tx.txid();
        if on_disconnect {
            store.set_tx_pool(&txid, TxPool::Block)?;
        }

        match self.record(store, &txid)? {
            Some(record) if record.pool == UnconfirmedPool::Memory => {
                return Err(EngineError::invariant(format!(
                    "{} is already in the memory pool",
                    hash256_to_hex(&txid)
                )));
            }
            Some(mut record) => {
                record.pool = UnconfirmedPool::Memory;
                record.summary = summary;
                store
                    .db_mut()
                    .put(Column::UnconfirmedTx, txid.to_vec(), record.encode())?;
            }
            None => self.create_rows(store, tx, UnconfirmedPool::Memory, summary)?,
        }

        for input in &tx.vin {
            if let Some(mut parent) = self.output_record(store, &input.prevout)? {
                if !parent.spent {
                    parent.spent = true;
                    store.db_mut().put(
                        Column::UnconfirmedOutput,
                        input.prevout.key().to_vec(),
                        parent.encode(),
                    )?;
                }
            }
        }

        let prefix = ledger_prefix(&txid, Some(LedgerKind::Input));
        if store
            .db()
            .scan_prefix(Column::UnconfirmedLedger, &prefix)?
            .is_empty()
        {
            self.put_input_ledger(store, tx, &txid)?;
        }
        Ok(())
    }

    fn put_input_ledger<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        tx: &Transaction,
        txid: &Hash256,
    ) -> Result<(), EngineError> {
        for (position, input) in tx.vin.iter().enumerate() {
            let prev = match store.output_for_outpoint(None, &input.prevout)? {
                Some(output) => Some(output),
                None => self.output(store, &input.prevout)?,
            };
            let Some(prev) = prev else {
                return Err(EngineError::invariant(format!(
                    "pool transaction {} spends unknown output {}:{}",
                    hash256_to_hex(txid),
                    hash256_to_hex(&input.prevout.hash),
                    input.prevout.index
                )));
            };
            let addresses = store.encoder().addresses(&prev.script_pubkey);
            for address in ledger_addresses(&addresses) {
                let entry = LedgerEntry {
                    txid: *txid,
                    kind: LedgerKind::Input,
                    position: position as u32,
                    address: address.to_string(),
                    amount: -prev.value,
                };
                store.db_mut().put(
                    Column::UnconfirmedLedger,
                    entry.key(),
                    entry.amount.to_le_bytes().to_vec(),
                )?;
            }
        }
        Ok(())
    }

    /// Parks a transaction whose inputs are unknown. Returns false when the
    /// hash is already tracked or the payload is too large to keep.
    pub fn add_orphan_tx<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        tx: &Transaction,
    ) -> Result<bool, EngineError> {
        let txid = tx.txid();
        if self.record(store, &txid)?.is_some() {
            return Ok(false);
        }
        if tx.size() > self.max_orphan_tx_size {
            log::debug!("{} too large to keep as an orphan", hash256_to_hex(&txid));
            return Ok(false);
        }
        self.create_rows(store, tx, UnconfirmedPool::Orphan, TxSummary::default())?;
        Ok(true)
    }

    fn create_rows<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        tx: &Transaction,
        pool: UnconfirmedPool,
        summary: TxSummary,
    ) -> Result<(), EngineError> {
        let txid = tx.txid();
        let record = UnconfirmedTxRecord::new(tx, pool, summary);
        store
            .db_mut()
            .put(Column::UnconfirmedRawTx, txid.to_vec(), tx.encode())?;
        store
            .db_mut()
            .put(Column::UnconfirmedTx, txid.to_vec(), record.encode())?;

        for (index, input) in tx.vin.iter().enumerate() {
            let row = InputRecord {
                prevout: input.prevout.clone(),
                script_sig: input.script_sig.clone(),
                sequence: input.sequence,
            };
            store.db_mut().put(
                Column::UnconfirmedInput,
                position_key(&txid, index as u32),
                row.encode(),
            )?;
            store.db_mut().put(
                Column::UnconfirmedSpend,
                spend_key(&input.prevout, &txid, index as u32),
                Vec::new(),
            )?;
        }

        for (index, output) in tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            let mut spent = false;
            for spender in spenders_of(store.db(), Column::UnconfirmedSpend, &outpoint)? {
                if self.exists(store, &spender.txid)? {
                    spent = true;
                    break;
                }
            }
            let addresses = store.encoder().addresses(&output.script_pubkey);
            let row = OutputRecord::new(output, addresses, spent, Branch::Main);
            store.db_mut().put(
                Column::UnconfirmedOutput,
                outpoint.key().to_vec(),
                row.encode(),
            )?;
            for address in ledger_addresses(&row.addresses) {
                let entry = LedgerEntry {
                    txid,
                    kind: LedgerKind::Output,
                    position: index as u32,
                    address: address.to_string(),
                    amount: output.value,
                };
                store.db_mut().put(
                    Column::UnconfirmedLedger,
                    entry.key(),
                    entry.amount.to_le_bytes().to_vec(),
                )?;
            }
        }
        Ok(())
    }

    /// Orphans spending any output of `txid`, in key order.
    pub fn orphan_txs_by_prev_hash<S: KeyValueStore>(
        &self,
        store: &ChainStore<S>,
        txid: &Hash256,
    ) -> Result<Vec<Transaction>, EngineError> {
        let mut seen = HashSet::new();
        let mut orphans = Vec::new();
        for spender in spenders_of_tx(store.db(), Column::UnconfirmedSpend, txid)? {
            if !seen.insert(spender.txid) {
                continue;
            }
            if self.pool_of(store, &spender.txid)? != Some(UnconfirmedPool::Orphan) {
                continue;
            }
            if let Some(tx) = self.transaction(store, &spender.txid)? {
                orphans.push(tx);
            }
        }
        Ok(orphans)
    }

    /// Marks `txid` and every unconfirmed descendant as conflicted, in both
    /// the unconfirmed and the confirmed universe. Returns the hashes marked.
    pub fn remove<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        txid: &Hash256,
    ) -> Result<Vec<Hash256>, EngineError> {
        let mut queue = VecDeque::from([*txid]);
        let mut seen = HashSet::new();
        let mut removed = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for spender in spenders_of_tx(store.db(), Column::UnconfirmedSpend, &current)? {
                queue.push_back(spender.txid);
            }
            if self.mark_conflicted(store, &current)? {
                removed.push(current);
            }
        }
        Ok(removed)
    }

    fn mark_conflicted<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        txid: &Hash256,
    ) -> Result<bool, EngineError> {
        let mut marked = false;
        if let Some(mut record) = self.record(store, txid)? {
            if record.pool != UnconfirmedPool::Conflict {
                let was_memory = record.pool == UnconfirmedPool::Memory;
                record.pool = UnconfirmedPool::Conflict;
                store
                    .db_mut()
                    .put(Column::UnconfirmedTx, txid.to_vec(), record.encode())?;
                if was_memory {
                    self.release_parents(store, txid)?;
                }
                marked = true;
            }
        }
        if let Some(record) = store.tx_record(txid)? {
            if record.pool != TxPool::Conflict {
                store.set_tx_pool(txid, TxPool::Conflict)?;
                marked = true;
            }
        }
        Ok(marked)
    }

    /// Clears the spent flag on unconfirmed outputs `txid` was spending.
    fn release_parents<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        txid: &Hash256,
    ) -> Result<(), EngineError> {
        let Some(tx) = self.transaction(store, txid)? else {
            return Ok(());
        };
        for input in &tx.vin {
            if let Some(mut parent) = self.output_record(store, &input.prevout)? {
                if parent.spent {
                    parent.spent = false;
                    store.db_mut().put(
                        Column::UnconfirmedOutput,
                        input.prevout.key().to_vec(),
                        parent.encode(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Conflicts every unconfirmed transaction, other than `tx` itself,
    /// spending an output `tx` spends.
    pub fn remove_conflicts<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        tx: &Transaction,
    ) -> Result<Vec<Hash256>, EngineError> {
        if tx.is_coinbase() {
            return Ok(Vec::new());
        }
        let txid = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            for spender in spenders_of(store.db(), Column::UnconfirmedSpend, &input.prevout)? {
                if spender.txid != txid {
                    removed.extend(self.remove(store, &spender.txid)?);
                }
            }
        }
        Ok(removed)
    }

    /// Drops the block's transactions from the pool and conflicts their
    /// double spends. Returns the conflicted hashes.
    pub fn remove_for_block<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        block: &Block,
    ) -> Result<Vec<Hash256>, EngineError> {
        let mut conflicts = Vec::new();
        for tx in &block.transactions {
            conflicts.extend(self.remove_conflicts(store, tx)?);
        }
        for tx in &block.transactions {
            let txid = tx.txid();
            self.delete_unconfirmed(store, &txid)?;
            store.set_tx_pool(&txid, TxPool::Tip)?;
        }
        Ok(conflicts)
    }

    /// Forgets a staged orphan that failed validation.
    pub fn remove_orphan<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        txid: &Hash256,
    ) -> Result<(), EngineError> {
        if self.pool_of(store, txid)? == Some(UnconfirmedPool::Orphan) {
            self.delete_unconfirmed(store, txid)?;
        }
        Ok(())
    }

    fn delete_unconfirmed<S: KeyValueStore>(
        &self,
        store: &mut ChainStore<S>,
        txid: &Hash256,
    ) -> Result<(), EngineError> {
        let Some(tx) = self.transaction(store, txid)? else {
            return Ok(());
        };
        let db = store.db_mut();
        db.delete(Column::UnconfirmedRawTx, txid.to_vec())?;
        db.delete(Column::UnconfirmedTx, txid.to_vec())?;
        for (index, input) in tx.vin.iter().enumerate() {
            db.delete(Column::UnconfirmedInput, position_key(txid, index as u32))?;
            db.delete(
                Column::UnconfirmedSpend,
                spend_key(&input.prevout, txid, index as u32),
            )?;
        }
        for index in 0..tx.vout.len() as u32 {
            db.delete(
                Column::UnconfirmedOutput,
                OutPoint::new(*txid, index).key().to_vec(),
            )?;
        }
        for (key, _) in db.scan_prefix(Column::UnconfirmedLedger, &ledger_prefix(txid, None))? {
            db.delete(Column::UnconfirmedLedger, key)?;
        }
        Ok(())
    }
}
