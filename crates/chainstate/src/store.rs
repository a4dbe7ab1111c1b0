//! Durable chain state: blocks, transactions, outputs and their projections.
//!
//! Every mutation goes through a [`StagedStore`] frame opened with
//! [`ChainStore::begin`]. Rolling a frame back also forgets the header index
//! entries it added and flushes the output overlay.

use std::collections::HashMap;

use primitive_types::U256;
use utxod_consensus::money::Amount;
use utxod_consensus::{hash256_to_hex, ChainParams, Hash256};
use utxod_pow::difficulty::block_proof;
use utxod_primitives::block::Block;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_storage::{Column, KeyValueStore, StagedStore};

use crate::address_index::{
    address_outpoints, address_prefix, delete_ledger_entry, ledger_addresses, put_address_outputs,
    put_ledger_entry, sync_utxo, utxo_balance, AddressEncoder, UNKNOWN_ADDRESS,
};
use crate::context::BlockContext;
use crate::error::EngineError;
use crate::index::{ChainIndex, HeaderSource, IndexedHeader};
use crate::overlay::{CachedOutput, UtxoOverlay};
use crate::pending::PendingPool;
use crate::records::{
    amount_from_bytes, hash_from_bytes, height_key, ledger_prefix, pair_key, position_key,
    BlockRecord, Branch, InputRecord, LedgerEntry, LedgerKind, OutputRecord, TxPool, TxRecord,
    TxSummary, TIP_KEY,
};
use crate::spentindex::spend_key;

/// Row counts, for status output and consistency checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub blocks: usize,
    pub txs: usize,
    pub outputs: usize,
    pub utxos: usize,
    pub unconfirmed_txs: usize,
}

/// Loads main and side headers from block records. Orphans are never
/// indexed.
struct DbHeaders<'a, S>(&'a StagedStore<S>);

impl<S: KeyValueStore> HeaderSource for DbHeaders<'_, S> {
    fn load_header(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, EngineError> {
        let Some(bytes) = self.0.get(Column::Block, hash)? else {
            return Ok(None);
        };
        let record = BlockRecord::decode(&bytes)?;
        if record.branch == Branch::Orphan {
            return Ok(None);
        }
        Ok(Some(IndexedHeader {
            hash: *hash,
            header: record.header,
            height: record.height,
            total_work: record.work,
        }))
    }
}

pub struct ChainStore<S> {
    db: StagedStore<S>,
    index: ChainIndex,
    overlay: UtxoOverlay,
    encoder: AddressEncoder,
}

impl<S: KeyValueStore> ChainStore<S> {
    pub fn new(base: S, params: &ChainParams, header_cache_capacity: usize) -> Self {
        Self {
            db: StagedStore::new(base),
            index: ChainIndex::new(header_cache_capacity),
            overlay: UtxoOverlay::new(),
            encoder: AddressEncoder::new(params),
        }
    }

    pub fn begin(&mut self) {
        self.db.begin();
        self.index.begin();
    }

    pub fn commit(&mut self) -> Result<(), EngineError> {
        match self.db.commit() {
            Ok(()) => {
                self.index.commit();
                Ok(())
            }
            Err(err) => {
                self.index.rollback();
                self.overlay.flush();
                Err(err.into())
            }
        }
    }

    pub fn rollback(&mut self) {
        self.db.rollback();
        self.index.rollback();
        self.overlay.flush();
    }

    pub fn flush_overlay(&mut self) {
        self.overlay.flush();
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub(crate) fn db(&self) -> &StagedStore<S> {
        &self.db
    }

    pub(crate) fn db_mut(&mut self) -> &mut StagedStore<S> {
        &mut self.db
    }

    pub(crate) fn overlay_mut(&mut self) -> &mut UtxoOverlay {
        &mut self.overlay
    }

    pub(crate) fn encoder(&self) -> &AddressEncoder {
        &self.encoder
    }

    // Blocks.

    pub fn block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, EngineError> {
        match self.db.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(BlockRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Already linked into the main or a side branch.
    pub fn is_block_processed(&self, hash: &Hash256) -> Result<bool, EngineError> {
        Ok(self
            .block_record(hash)?
            .is_some_and(|record| record.branch != Branch::Orphan))
    }

    pub fn is_block_valid(&self, hash: &Hash256) -> Result<bool, EngineError> {
        if self.index.contains(hash) {
            return Ok(true);
        }
        self.is_block_processed(hash)
    }

    pub fn is_block_orphan(&self, hash: &Hash256) -> Result<bool, EngineError> {
        Ok(self
            .block_record(hash)?
            .is_some_and(|record| record.branch == Branch::Orphan))
    }

    pub fn block_header(&mut self, hash: &Hash256) -> Result<Option<IndexedHeader>, EngineError> {
        self.index.get(hash, &DbHeaders(&self.db))
    }

    pub fn previous_header(
        &mut self,
        header: &IndexedHeader,
    ) -> Result<Option<IndexedHeader>, EngineError> {
        self.index.previous(header, &DbHeaders(&self.db))
    }

    pub fn height_for_block(&mut self, hash: &Hash256) -> Result<Option<u32>, EngineError> {
        Ok(self.block_header(hash)?.map(|header| header.height))
    }

    /// Cumulative work of a valid block, zero when it is unknown.
    pub fn total_work_up_to(&mut self, hash: &Hash256) -> Result<U256, EngineError> {
        Ok(self
            .block_header(hash)?
            .map(|header| header.total_work)
            .unwrap_or_default())
    }

    pub fn store_raw_block(&mut self, block: &Block) -> Result<(), EngineError> {
        let hash = block.hash();
        if !self.db.contains(Column::RawBlock, &hash)? {
            self.db.put(Column::RawBlock, hash.to_vec(), block.encode())?;
        }
        Ok(())
    }

    pub fn raw_block(&self, hash: &Hash256) -> Result<Option<Block>, EngineError> {
        match self.db.get(Column::RawBlock, hash)? {
            Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The block body, provided it sits on the main or a side branch.
    pub fn valid_block(&mut self, hash: &Hash256) -> Result<Option<Block>, EngineError> {
        if !self.is_block_valid(hash)? {
            return Ok(None);
        }
        self.raw_block(hash)
    }

    pub fn mainchain_tip_hash(&self) -> Result<Option<Hash256>, EngineError> {
        match self.db.get(Column::Meta, TIP_KEY)? {
            Some(bytes) => Ok(Some(hash_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn main_hash_at_height(&self, height: u32) -> Result<Option<Hash256>, EngineError> {
        match self.db.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => Ok(Some(hash_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn orphan_blocks_with_parent(&self, parent: &Hash256) -> Result<Vec<Block>, EngineError> {
        let mut blocks = Vec::new();
        for (key, _) in self.db.scan_prefix(Column::BlockByParent, parent)? {
            let child = hash_from_bytes(&key[parent.len()..])?;
            if !self.is_block_orphan(&child)? {
                continue;
            }
            if let Some(block) = self.raw_block(&child)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    pub fn save_block_on_main_branch(
        &mut self,
        block: &Block,
        height: u32,
        prev_work: U256,
        summaries: &HashMap<Hash256, TxSummary>,
    ) -> Result<(), EngineError> {
        self.save_block(block, height, prev_work, Branch::Main, summaries)
    }

    pub fn save_block_on_side_branch(
        &mut self,
        block: &Block,
        height: u32,
        prev_work: U256,
    ) -> Result<(), EngineError> {
        self.save_block(block, height, prev_work, Branch::Side, &HashMap::new())
    }

    pub fn save_orphan_block(&mut self, block: &Block, height: u32) -> Result<(), EngineError> {
        self.save_block(block, height, U256::zero(), Branch::Orphan, &HashMap::new())
    }

    fn save_block(
        &mut self,
        block: &Block,
        height: u32,
        prev_work: U256,
        branch: Branch,
        summaries: &HashMap<Hash256, TxSummary>,
    ) -> Result<(), EngineError> {
        let hash = block.hash();
        self.store_raw_block(block)?;
        let work = prev_work + block_proof(block.header.bits)?;

        let mut tx_summaries = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let summary = if tx.is_coinbase() {
                TxSummary {
                    fee: 0,
                    total_in: 0,
                    total_out: tx.value_out().unwrap_or_default(),
                }
            } else {
                summaries.get(&tx.txid()).copied().unwrap_or_default()
            };
            tx_summaries.push(summary);
        }
        let block_fees: Amount = tx_summaries.iter().map(|summary| summary.fee).sum();
        let block_summary = if branch == Branch::Main {
            TxSummary {
                fee: block_fees,
                total_in: tx_summaries.iter().map(|summary| summary.total_in).sum(),
                total_out: tx_summaries.iter().map(|summary| summary.total_out).sum(),
            }
        } else {
            TxSummary::default()
        };

        let previous = self.block_record(&hash)?;
        let previous_branch = previous.as_ref().map(|record| record.branch);
        match previous {
            None => {
                let record = BlockRecord {
                    header: block.header.clone(),
                    height,
                    branch,
                    work,
                    size: block.size() as u32,
                    tx_count: block.transactions.len() as u32,
                    summary: block_summary,
                };
                self.db.put(Column::Block, hash.to_vec(), record.encode())?;
                self.db.put(
                    Column::BlockByParent,
                    pair_key(&block.header.prev_block, &hash),
                    Vec::new(),
                )?;
            }
            Some(mut record) if record.branch != branch => {
                if record.branch == Branch::Main {
                    if self.main_hash_at_height(record.height)? == Some(hash) {
                        self.db.delete(Column::HeightIndex, height_key(record.height).to_vec())?;
                    }
                    if self.mainchain_tip_hash()? == Some(hash) {
                        self.db.put(Column::Meta, TIP_KEY, block.header.prev_block.to_vec())?;
                    }
                }
                record.work = work;
                record.branch = branch;
                record.height = height;
                record.summary = block_summary;
                self.db.put(Column::Block, hash.to_vec(), record.encode())?;
            }
            Some(_) => {}
        }

        if branch == Branch::Main {
            self.db.put(Column::HeightIndex, height_key(height).to_vec(), hash.to_vec())?;
            self.db.put(Column::Meta, TIP_KEY, hash.to_vec())?;
        }
        if branch != Branch::Orphan {
            self.index.insert(&block.header, height, prev_work)?;
        }

        for (position, (tx, summary)) in block.transactions.iter().zip(&tx_summaries).enumerate() {
            let txid = tx.txid();
            self.db.put(Column::BlockTx, position_key(&hash, position as u32), txid.to_vec())?;
            self.db.put(Column::TxBlock, pair_key(&txid, &hash), Vec::new())?;

            match self.tx_record(&txid)? {
                Some(mut record) => {
                    if branch == Branch::Main {
                        record.pool = TxPool::Tip;
                        record.height = height;
                        record.summary = *summary;
                    } else if record.pool != TxPool::Tip {
                        record.height = 0;
                    }
                    self.db.put(Column::Tx, txid.to_vec(), record.encode())?;
                    if branch == Branch::Main && tx.is_coinbase() {
                        self.put_coinbase_ledger(&txid, summary, block_fees)?;
                    }
                }
                None => self.create_tx(tx, &txid, branch, height, summary, block_fees)?,
            }
        }

        if matches!(
            (previous_branch, branch),
            (Some(Branch::Orphan), Branch::Main | Branch::Side)
                | (Some(Branch::Side), Branch::Main)
        ) {
            self.complete_ledger(block, branch)?;
        }
        if previous_branch == Some(Branch::Orphan) && branch == Branch::Side {
            for tx in &block.transactions {
                let txid = tx.txid();
                for index in 0..tx.vout.len() as u32 {
                    let outpoint = OutPoint::new(txid, index);
                    if self
                        .stored_output(&outpoint)?
                        .is_some_and(|record| record.branch == Branch::Orphan)
                    {
                        self.set_output_state(&outpoint, false, Branch::Side)?;
                    }
                }
            }
        }

        self.overlay.flush();
        Ok(())
    }

    fn create_tx(
        &mut self,
        tx: &Transaction,
        txid: &Hash256,
        branch: Branch,
        height: u32,
        summary: &TxSummary,
        block_fees: Amount,
    ) -> Result<(), EngineError> {
        let (pool, height) = if branch == Branch::Main {
            (TxPool::Tip, height)
        } else {
            (TxPool::Block, 0)
        };
        let record = TxRecord::new(tx, pool, height, *summary);
        self.db.put(Column::Tx, txid.to_vec(), record.encode())?;
        self.db.put(Column::RawTx, txid.to_vec(), tx.encode())?;

        for (index, output) in tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(*txid, index as u32);
            let spent = self.overlay.spent_state(&outpoint) == Some(true);
            let record = OutputRecord::new(
                output,
                self.encoder.addresses(&output.script_pubkey),
                spent,
                branch,
            );
            self.db.put(Column::Output, outpoint.key().to_vec(), record.encode())?;
            put_address_outputs(&mut self.db, &outpoint, &record)?;
            sync_utxo(&mut self.db, &outpoint, &record)?;
            for address in ledger_addresses(&record.addresses) {
                put_ledger_entry(
                    &mut self.db,
                    &LedgerEntry {
                        txid: *txid,
                        kind: LedgerKind::Output,
                        position: index as u32,
                        address: address.to_string(),
                        amount: output.value,
                    },
                )?;
            }
        }

        for (index, input) in tx.vin.iter().enumerate() {
            let record = InputRecord {
                prevout: input.prevout.clone(),
                script_sig: input.script_sig.clone(),
                sequence: input.sequence,
            };
            self.db.put(Column::Input, position_key(txid, index as u32), record.encode())?;
            if !tx.is_coinbase() {
                self.db.put(
                    Column::Spend,
                    spend_key(&input.prevout, txid, index as u32),
                    Vec::new(),
                )?;
            }
        }

        if tx.is_coinbase() {
            return self.put_coinbase_ledger(txid, summary, block_fees);
        }
        for (index, input) in tx.vin.iter().enumerate() {
            match self.prev_output_owners(&input.prevout)? {
                Some((amount, addresses)) => {
                    self.put_input_ledger(txid, index as u32, amount, &addresses)?
                }
                // Side blocks are stored unvalidated and may spend outputs
                // that never existed.
                None if branch != Branch::Main => {
                    self.put_input_ledger(txid, index as u32, 0, &[])?
                }
                None => {
                    return Err(EngineError::invariant(format!(
                        "previous output {}:{} of a valid block is unknown",
                        hash256_to_hex(&input.prevout.hash),
                        input.prevout.index
                    )))
                }
            }
        }
        Ok(())
    }

    /// The coinbase spends the subsidy: its input is debited the newly
    /// created value under the unknown address.
    fn put_coinbase_ledger(
        &mut self,
        txid: &Hash256,
        summary: &TxSummary,
        block_fees: Amount,
    ) -> Result<(), EngineError> {
        put_ledger_entry(
            &mut self.db,
            &LedgerEntry {
                txid: *txid,
                kind: LedgerKind::Input,
                position: 0,
                address: UNKNOWN_ADDRESS.to_string(),
                amount: -(summary.total_out - block_fees),
            },
        )?;
        Ok(())
    }

    fn put_input_ledger(
        &mut self,
        txid: &Hash256,
        position: u32,
        amount: Amount,
        addresses: &[String],
    ) -> Result<(), EngineError> {
        for address in ledger_addresses(addresses) {
            put_ledger_entry(
                &mut self.db,
                &LedgerEntry {
                    txid: *txid,
                    kind: LedgerKind::Input,
                    position,
                    address: address.to_string(),
                    amount: -amount,
                },
            )?;
        }
        Ok(())
    }

    /// Replaces the placeholder debits written while the block was an orphan
    /// or on a side branch. Only a main-branch block must resolve every one.
    fn complete_ledger(&mut self, block: &Block, branch: Branch) -> Result<(), EngineError> {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.txid();
            let prefix = ledger_prefix(&txid, Some(LedgerKind::Input));
            let rows = self.db.scan_prefix(Column::Ledger, &prefix)?;
            for (key, value) in rows {
                let entry = LedgerEntry::from_row(&key, &value)?;
                if entry.address != UNKNOWN_ADDRESS || entry.amount != 0 {
                    continue;
                }
                let Some(input) = tx.vin.get(entry.position as usize) else {
                    continue;
                };
                let Some((amount, addresses)) = self.prev_output_owners(&input.prevout)? else {
                    if branch != Branch::Main {
                        continue;
                    }
                    return Err(EngineError::invariant(format!(
                        "previous output of {} input {} is still unknown",
                        hash256_to_hex(&txid),
                        entry.position
                    )));
                };
                delete_ledger_entry(&mut self.db, &entry)?;
                self.put_input_ledger(&txid, entry.position, amount, &addresses)?;
            }
        }
        Ok(())
    }

    /// Amount and addresses of a previous output, from the overlay or the
    /// output column.
    fn prev_output_owners(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<(Amount, Vec<String>)>, EngineError> {
        match self.overlay.output(outpoint) {
            Some(CachedOutput::Stored(record)) => {
                return Ok(Some((record.amount, record.addresses.clone())))
            }
            Some(CachedOutput::Pending(output)) => {
                return Ok(Some((output.value, self.encoder.addresses(&output.script_pubkey))))
            }
            None => {}
        }
        Ok(self
            .stored_output(outpoint)?
            .map(|record| (record.amount, record.addresses)))
    }

    // Outputs.

    pub fn stored_output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, EngineError> {
        match self.db.get(Column::Output, &outpoint.key())? {
            Some(bytes) => Ok(Some(OutputRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stored record through the overlay, caching it on a miss.
    fn cached_record(&mut self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, EngineError> {
        if let Some(CachedOutput::Stored(record)) = self.overlay.output(outpoint) {
            return Ok(Some(record.clone()));
        }
        let record = self.stored_output(outpoint)?;
        if let Some(record) = &record {
            self.overlay
                .cache_output(outpoint, CachedOutput::Stored(record.clone()));
        }
        Ok(record)
    }

    /// Resolves an output from the overlay, storage, then the block being
    /// connected.
    pub fn output_for_outpoint(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        outpoint: &OutPoint,
    ) -> Result<Option<TxOut>, EngineError> {
        if let Some(output) = self.overlay.output(outpoint) {
            return Ok(Some(output.txout()));
        }
        if let Some(record) = self.cached_record(outpoint)? {
            return Ok(Some(record.txout()));
        }
        let Some(output) = ctx.and_then(|ctx| ctx.txout(outpoint)) else {
            return Ok(None);
        };
        self.overlay
            .cache_output(outpoint, CachedOutput::Pending(output.clone()));
        Ok(Some(output.clone()))
    }

    /// Caches the stored outputs of `txs` and the outputs they spend.
    pub fn load_output_cache(&mut self, txs: &[Transaction]) -> Result<(), EngineError> {
        for tx in txs {
            let txid = tx.txid();
            for index in 0..tx.vout.len() as u32 {
                self.cached_record(&OutPoint::new(txid, index))?;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                self.cached_record(&input.prevout)?;
            }
        }
        Ok(())
    }

    fn set_output_state(
        &mut self,
        outpoint: &OutPoint,
        spent: bool,
        branch: Branch,
    ) -> Result<(), EngineError> {
        let Some(mut record) = self.stored_output(outpoint)? else {
            return Ok(());
        };
        if record.spent == spent && record.branch == branch {
            return Ok(());
        }
        record.spent = spent;
        record.branch = branch;
        self.db.put(Column::Output, outpoint.key().to_vec(), record.encode())?;
        sync_utxo(&mut self.db, outpoint, &record)?;
        self.overlay.refresh_record(outpoint, &record);
        Ok(())
    }

    pub fn mark_outputs_as_spent(&mut self, outpoints: &[OutPoint]) -> Result<(), EngineError> {
        for outpoint in outpoints {
            self.set_output_state(outpoint, true, Branch::Main)?;
        }
        Ok(())
    }

    pub fn mark_outputs_as_unspent(&mut self, outpoints: &[OutPoint]) -> Result<(), EngineError> {
        for outpoint in outpoints {
            self.set_output_state(outpoint, false, Branch::Main)?;
        }
        Ok(())
    }

    /// Outputs of a block that left the main branch.
    pub fn mark_outputs_as_unavailable(
        &mut self,
        outpoints: &[OutPoint],
    ) -> Result<(), EngineError> {
        for outpoint in outpoints {
            self.set_output_state(outpoint, false, Branch::Side)?;
        }
        Ok(())
    }

    pub fn update_outputs_on_connect_block(&mut self, block: &Block) -> Result<(), EngineError> {
        self.mark_outputs_as_unspent(&created_outpoints(block))?;
        self.mark_outputs_as_spent(&spent_outpoints(block))
    }

    pub fn update_outputs_on_disconnect_block(
        &mut self,
        block: &Block,
    ) -> Result<(), EngineError> {
        self.mark_outputs_as_unspent(&spent_outpoints(block))?;
        self.mark_outputs_as_unavailable(&created_outpoints(block))
    }

    /// Whether any transaction of `block` would overwrite an output that is
    /// still spendable on the main branch.
    pub fn has_previously_unspent_outputs_for_any_tx(
        &mut self,
        block: &Block,
    ) -> Result<bool, EngineError> {
        for outpoint in created_outpoints(block) {
            if self
                .cached_record(&outpoint)?
                .is_some_and(|record| record.is_spendable())
            {
                log::debug!(
                    "{}:{} is still unspent on the main branch",
                    hash256_to_hex(&outpoint.hash),
                    outpoint.index
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `spending_txid` may spend every outpoint. Consults the
    /// overlay, the block being connected, storage, and finally `pool`.
    pub fn all_outpoints_are_available(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        spending_txid: &Hash256,
        outpoints: &[OutPoint],
        pool: Option<&PendingPool>,
    ) -> Result<bool, EngineError> {
        if self.overlay.all_unspent(outpoints) {
            return Ok(true);
        }
        for outpoint in outpoints {
            match self.overlay.spent_state(outpoint) {
                Some(true) => return Ok(false),
                Some(false) => continue,
                None => {}
            }

            if let Some(ctx) = ctx {
                if ctx.is_spent(outpoint) == Some(true) {
                    return Ok(false);
                }
                if let (Some(spender), Some(_)) =
                    (ctx.position(spending_txid), ctx.txout(outpoint))
                {
                    let funding = ctx.position(&outpoint.hash).unwrap_or(usize::MAX);
                    if spender <= funding {
                        return Ok(false);
                    }
                }
            }

            let in_pool = |store: &Self| -> Result<bool, EngineError> {
                match pool {
                    Some(pool) => pool.is_output_available(store, outpoint),
                    None => Ok(false),
                }
            };
            let Some(record) = self.cached_record(outpoint)? else {
                if !in_pool(&*self)? {
                    return Ok(false);
                }
                continue;
            };
            if !record.is_spendable() && !in_pool(&*self)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // Transactions.

    pub fn tx_record(&self, txid: &Hash256) -> Result<Option<TxRecord>, EngineError> {
        match self.db.get(Column::Tx, txid)? {
            Some(bytes) => Ok(Some(TxRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn raw_tx(&self, txid: &Hash256) -> Result<Option<Transaction>, EngineError> {
        match self.db.get(Column::RawTx, txid)? {
            Some(bytes) => Ok(Some(Transaction::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_tx_pool(&mut self, txid: &Hash256, pool: TxPool) -> Result<(), EngineError> {
        if let Some(mut record) = self.tx_record(txid)? {
            if record.pool != pool {
                record.pool = pool;
                self.db.put(Column::Tx, txid.to_vec(), record.encode())?;
            }
        }
        Ok(())
    }

    pub fn move_coinbase_tx_to_block_pool(&mut self, txid: &Hash256) -> Result<(), EngineError> {
        if let Some(mut record) = self.tx_record(txid)? {
            record.pool = TxPool::Block;
            record.height = 0;
            self.db.put(Column::Tx, txid.to_vec(), record.encode())?;
        }
        Ok(())
    }

    pub fn is_tx_coinbase(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        txid: &Hash256,
    ) -> Result<bool, EngineError> {
        if let Some(cached) = self.overlay.coinbase(txid) {
            return Ok(cached);
        }
        let result = match self.tx_record(txid)? {
            Some(record) => record.is_coinbase,
            None => ctx
                .and_then(|ctx| ctx.tx(txid))
                .is_some_and(Transaction::is_coinbase),
        };
        self.overlay.cache_coinbase(*txid, result);
        Ok(result)
    }

    /// Height of the main-branch block including `txid`, or of the block
    /// being connected. `u32::MAX` when neither applies.
    pub fn height_for_tx(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        txid: &Hash256,
    ) -> Result<u32, EngineError> {
        for (key, _) in self.db.scan_prefix(Column::TxBlock, txid)? {
            let hash = hash_from_bytes(&key[txid.len()..])?;
            if let Some(record) = self.block_record(&hash)? {
                if record.branch == Branch::Main {
                    return Ok(record.height);
                }
            }
        }
        if let Some(ctx) = ctx {
            if ctx.tx(txid).is_some() {
                let prev = *ctx.prev_hash();
                if let Some(height) = self.height_for_block(&prev)? {
                    return Ok(height + 1);
                }
            }
        }
        Ok(u32::MAX)
    }

    // Addresses.

    /// Sum of the address's unspent main-branch outputs.
    pub fn address_balance(&self, address: &str) -> Result<Amount, EngineError> {
        Ok(utxo_balance(&self.db, address)?)
    }

    /// Sum of the address's ledger entries from transactions on the main
    /// branch.
    pub fn address_ledger_balance(&self, address: &str) -> Result<Amount, EngineError> {
        let prefix = address_prefix(address);
        let mut pools: HashMap<Hash256, bool> = HashMap::new();
        let mut total: Amount = 0;
        for (key, value) in self.db.scan_prefix(Column::AddressLedger, &prefix)? {
            let txid = hash_from_bytes(&key[prefix.len()..prefix.len() + 32])?;
            let confirmed = match pools.get(&txid) {
                Some(confirmed) => *confirmed,
                None => {
                    let confirmed = self
                        .tx_record(&txid)?
                        .is_some_and(|record| record.pool == TxPool::Tip);
                    pools.insert(txid, confirmed);
                    confirmed
                }
            };
            if confirmed {
                total += amount_from_bytes(&value)?;
            }
        }
        Ok(total)
    }

    pub fn address_outputs(
        &self,
        address: &str,
    ) -> Result<Vec<(OutPoint, OutputRecord)>, EngineError> {
        let mut outputs = Vec::new();
        for outpoint in address_outpoints(&self.db, address)? {
            if let Some(record) = self.stored_output(&outpoint)? {
                outputs.push((outpoint, record));
            }
        }
        Ok(outputs)
    }

    /// Every stored output row, in key order.
    pub fn outputs(&self) -> Result<Vec<(OutPoint, OutputRecord)>, EngineError> {
        self.db
            .scan_prefix(Column::Output, &[])?
            .into_iter()
            .map(|(key, value)| Ok((outpoint_from_key(&key)?, OutputRecord::decode(&value)?)))
            .collect()
    }

    /// Outpoints in the UTXO set with their amounts.
    pub fn utxos(&self) -> Result<Vec<(OutPoint, Amount)>, EngineError> {
        self.db
            .scan_prefix(Column::Utxo, &[])?
            .into_iter()
            .map(|(key, value)| Ok((outpoint_from_key(&key)?, amount_from_bytes(&value)?)))
            .collect()
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        Ok(StoreStats {
            blocks: self.db.scan_prefix(Column::Block, &[])?.len(),
            txs: self.db.scan_prefix(Column::Tx, &[])?.len(),
            outputs: self.db.scan_prefix(Column::Output, &[])?.len(),
            utxos: self.db.scan_prefix(Column::Utxo, &[])?.len(),
            unconfirmed_txs: self.db.scan_prefix(Column::UnconfirmedTx, &[])?.len(),
        })
    }
}

fn outpoint_from_key(key: &[u8]) -> Result<OutPoint, EngineError> {
    OutPoint::from_key(key).ok_or_else(|| {
        EngineError::invariant(format!("malformed outpoint key of {} bytes", key.len()))
    })
}

fn created_outpoints(block: &Block) -> Vec<OutPoint> {
    block
        .transactions
        .iter()
        .flat_map(|tx| {
            let txid = tx.txid();
            (0..tx.vout.len() as u32).map(move |index| OutPoint::new(txid, index))
        })
        .collect()
}

fn spent_outpoints(block: &Block) -> Vec<OutPoint> {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.vin.iter().map(|input| input.prevout.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::{chain_params, Network};
    use utxod_primitives::block::BlockHeader;
    use utxod_primitives::transaction::TxIn;
    use utxod_storage::memory::MemoryStore;

    fn coinbase(tag: u8, value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(prev: Hash256, transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 2,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_300_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    fn store() -> ChainStore<MemoryStore> {
        ChainStore::new(MemoryStore::new(), &chain_params(Network::Regtest), 0)
    }

    #[test]
    fn main_block_moves_tip_and_feeds_utxo_set() {
        let mut store = store();
        let first = block([0u8; 32], vec![coinbase(1, 50)]);
        store.begin();
        store
            .save_block_on_main_branch(&first, 0, U256::zero(), &HashMap::new())
            .expect("save");
        store.commit().expect("commit");

        let hash = first.hash();
        assert_eq!(store.mainchain_tip_hash().expect("tip"), Some(hash));
        assert_eq!(store.main_hash_at_height(0).expect("height"), Some(hash));
        assert!(store.is_block_valid(&hash).expect("valid"));
        let outpoint = OutPoint::new(first.transactions[0].txid(), 0);
        assert!(store.stored_output(&outpoint).expect("output").expect("row").is_spendable());
        assert_eq!(store.stats().expect("stats").utxos, 1);
        assert_eq!(store.height_for_tx(None, &outpoint.hash).expect("height"), 0);
    }

    #[test]
    fn demoting_to_side_restores_parent_tip() {
        let mut store = store();
        let first = block([0u8; 32], vec![coinbase(1, 50)]);
        let second = block(first.hash(), vec![coinbase(2, 50)]);
        store.begin();
        store
            .save_block_on_main_branch(&first, 0, U256::zero(), &HashMap::new())
            .expect("save");
        let work = store.total_work_up_to(&first.hash()).expect("work");
        store
            .save_block_on_main_branch(&second, 1, work, &HashMap::new())
            .expect("save");
        store.update_outputs_on_disconnect_block(&second).expect("disconnect");
        store.save_block_on_side_branch(&second, 1, work).expect("side");
        store.commit().expect("commit");

        assert_eq!(store.mainchain_tip_hash().expect("tip"), Some(first.hash()));
        assert_eq!(store.main_hash_at_height(1).expect("height"), None);
        let record = store.block_record(&second.hash()).expect("record").expect("row");
        assert_eq!(record.branch, Branch::Side);
        assert_eq!(store.stats().expect("stats").utxos, 1);
    }

    #[test]
    fn rollback_discards_rows_and_index_entries() {
        let mut store = store();
        let first = block([0u8; 32], vec![coinbase(1, 50)]);
        store.begin();
        store
            .save_block_on_main_branch(&first, 0, U256::zero(), &HashMap::new())
            .expect("save");
        store.rollback();

        assert!(!store.index().contains(&first.hash()));
        assert!(store.block_record(&first.hash()).expect("record").is_none());
        assert_eq!(store.stats().expect("stats"), StoreStats::default());
    }

    #[test]
    fn orphans_are_found_by_parent_but_not_indexed() {
        let mut store = store();
        let orphan = block([7u8; 32], vec![coinbase(3, 50)]);
        store.begin();
        store.save_orphan_block(&orphan, 0).expect("orphan");
        store.commit().expect("commit");

        assert!(store.is_block_orphan(&orphan.hash()).expect("orphan"));
        assert!(!store.is_block_valid(&orphan.hash()).expect("valid"));
        let children = store.orphan_blocks_with_parent(&[7u8; 32]).expect("children");
        assert_eq!(children, vec![orphan]);
    }
}
