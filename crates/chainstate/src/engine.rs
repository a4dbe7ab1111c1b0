//! Block and transaction acceptance, chain selection and reorganization.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use primitive_types::U256;
use rayon::prelude::*;
use utxod_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN};
use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::rewards::block_subsidy;
use utxod_consensus::{hash256_to_hex, ChainParams, Checkpoint, Hash256, ZERO_HASH};
use utxod_pow::difficulty::{
    block_proof, compact_to_u256, compute_min_work, get_next_work_required, median_time_past,
    pow_limit_bits, HeaderInfo,
};
use utxod_primitives::block::Block;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_script::verify::{ScriptVerifier, SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH};
use utxod_storage::KeyValueStore;

use crate::context::BlockContext;
use crate::error::EngineError;
use crate::events::{ChainEvent, EventBuffer};
use crate::index::{IndexedHeader, DEFAULT_HEADER_CACHE_CAPACITY};
use crate::metrics::ConnectMetrics;
use crate::pending::PendingPool;
use crate::records::TxSummary;
use crate::store::ChainStore;
use crate::validation::{
    are_inputs_standard, check_block, check_transaction, is_standard_tx, legacy_sigops,
    p2sh_sigops, value_out, ValidationError,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineOptions {
    /// Accept any header bits that pass the proof-of-work check.
    pub skip_pow_target_check: bool,
    /// Evaluate scripts below the last checkpoint too.
    pub execute_all_scripts: bool,
    pub checkpoints_disabled: bool,
    pub allow_nonstandard_tx: bool,
}

fn block_rejected(reason: impl Into<String>) -> EngineError {
    EngineError::Validation(ValidationError::Block(reason.into()))
}

fn tx_rejected(reason: impl Into<String>) -> EngineError {
    EngineError::Validation(ValidationError::Tx(reason.into()))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn header_info(header: &IndexedHeader) -> HeaderInfo {
    HeaderInfo {
        height: header.height as i64,
        time: header.header.time as i64,
        bits: header.header.bits,
    }
}

fn prevouts(tx: &Transaction) -> Vec<OutPoint> {
    tx.vin.iter().map(|input| input.prevout.clone()).collect()
}

pub struct ValidationEngine<S, V> {
    params: ChainParams,
    options: EngineOptions,
    store: ChainStore<S>,
    pool: PendingPool,
    verifier: V,
    events: EventBuffer,
    metrics: Arc<ConnectMetrics>,
    current_time: Option<i64>,
}

impl<S: KeyValueStore, V: ScriptVerifier> ValidationEngine<S, V> {
    pub fn new(base: S, params: ChainParams, options: EngineOptions, verifier: V) -> Self {
        Self::with_header_cache_capacity(
            base,
            params,
            options,
            verifier,
            DEFAULT_HEADER_CACHE_CAPACITY,
        )
    }

    pub fn with_header_cache_capacity(
        base: S,
        params: ChainParams,
        options: EngineOptions,
        verifier: V,
        header_cache_capacity: usize,
    ) -> Self {
        let store = ChainStore::new(base, &params, header_cache_capacity);
        Self {
            params,
            options,
            store,
            pool: PendingPool::new(),
            verifier,
            events: EventBuffer::new(),
            metrics: Arc::new(ConnectMetrics::default()),
            current_time: None,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &ChainStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChainStore<S> {
        &mut self.store
    }

    pub fn pool(&self) -> &PendingPool {
        &self.pool
    }

    pub fn metrics(&self) -> Arc<ConnectMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn subscribe(&mut self) -> Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Runs `f` inside one store transaction. Events raised by `f` are only
    /// published once the outermost transaction commits.
    fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.store.begin();
        self.events.begin();
        match f(self) {
            Ok(value) => match self.store.commit() {
                Ok(()) => {
                    self.events.commit();
                    Ok(value)
                }
                Err(err) => {
                    self.events.rollback();
                    Err(err)
                }
            },
            Err(err) => {
                self.store.rollback();
                self.events.rollback();
                Err(err)
            }
        }
    }

    /// Validates a block and integrates it into the chain, then retries any
    /// orphans it unlocks. With `raise_errors` unset, a rejection is logged
    /// and reported as `Ok(false)`.
    pub fn process_block(
        &mut self,
        block: &Block,
        raise_errors: bool,
        current_time: Option<i64>,
    ) -> Result<bool, EngineError> {
        self.store.flush_overlay();
        self.current_time = current_time;
        let hash = block.hash();

        let accepted = match self.atomically(|engine| engine.process_block_internal(block, &hash)) {
            Ok(accepted) => accepted,
            Err(EngineError::Validation(err)) => {
                log::debug!("{} rejected: {err}", hash256_to_hex(&hash));
                self.store.flush_overlay();
                if raise_errors {
                    return Err(EngineError::Validation(err));
                }
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        if accepted && self.store.is_block_valid(&hash)? {
            self.process_orphan_blocks(hash)?;
        }
        self.store.flush_overlay();
        Ok(accepted)
    }

    fn process_orphan_blocks(&mut self, parent: Hash256) -> Result<(), EngineError> {
        let mut parents = VecDeque::from([parent]);
        while let Some(parent) = parents.pop_front() {
            for orphan in self.store.orphan_blocks_with_parent(&parent)? {
                let hash = orphan.hash();
                self.store.flush_overlay();
                match self.atomically(|engine| engine.accept_block(&orphan)) {
                    Ok(()) => {
                        log::debug!("{} accepted from the orphan set", hash256_to_hex(&hash));
                        parents.push_back(hash);
                    }
                    Err(EngineError::Validation(err)) => {
                        log::warn!("{} orphan block rejected: {err}", hash256_to_hex(&hash));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn process_block_internal(&mut self, block: &Block, hash: &Hash256) -> Result<bool, EngineError> {
        if self.store.is_block_processed(hash)? {
            log::debug!("{} already processed", hash256_to_hex(hash));
            return Ok(true);
        }
        self.store.store_raw_block(block)?;

        let started = Instant::now();
        check_block(block, &self.params.consensus, self.max_block_time(), true)?;
        self.metrics.record_check_block(started.elapsed());

        self.check_against_latest_checkpoint(block)?;

        let prev = block.header.prev_block;
        if !self.store.is_block_valid(&prev)? {
            if *hash == self.params.consensus.hash_genesis_block {
                log::info!("{} stored as genesis", hash256_to_hex(hash));
                self.store
                    .save_block_on_main_branch(block, 0, U256::zero(), &HashMap::new())?;
                self.events.push(ChainEvent::BlockConnected {
                    hash: *hash,
                    height: 0,
                });
                return Ok(true);
            }
            let height = self
                .store
                .block_record(&prev)?
                .map_or(0, |parent| parent.height + 1);
            log::debug!("{} stored as orphan at height {height}", hash256_to_hex(hash));
            self.store.save_orphan_block(block, height)?;
            return Ok(true);
        }

        self.accept_block(block)?;
        Ok(true)
    }

    fn max_block_time(&self) -> i64 {
        self.current_time
            .unwrap_or_else(|| unix_now() + MAX_FUTURE_BLOCK_TIME)
    }

    /// Highest checkpoint that is already part of a valid branch.
    fn latest_checkpoint(&mut self) -> Result<Option<Checkpoint>, EngineError> {
        let mut checkpoints = self.params.consensus.checkpoints.clone();
        checkpoints.sort_by(|a, b| b.height.cmp(&a.height));
        for checkpoint in checkpoints {
            if self.store.is_block_valid(&checkpoint.hash)? {
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    pub fn latest_checkpoint_hash(&mut self) -> Result<Option<Hash256>, EngineError> {
        Ok(self.latest_checkpoint()?.map(|checkpoint| checkpoint.hash))
    }

    pub fn height_of_checkpoint(&self, hash: &Hash256) -> Option<u32> {
        self.params
            .consensus
            .checkpoints
            .iter()
            .find(|checkpoint| &checkpoint.hash == hash)
            .map(|checkpoint| checkpoint.height)
    }

    /// A block not extending the tip must carry plausible work relative to
    /// the last checkpoint.
    fn check_against_latest_checkpoint(&mut self, block: &Block) -> Result<(), EngineError> {
        if self.options.checkpoints_disabled {
            return Ok(());
        }
        let Some(checkpoint) = self.latest_checkpoint()? else {
            return Ok(());
        };
        let tip = self.store.mainchain_tip_hash()?.unwrap_or(ZERO_HASH);
        if block.header.prev_block == tip {
            return Ok(());
        }
        let Some(anchor) = self.store.block_header(&checkpoint.hash)? else {
            return Ok(());
        };
        let time_delta = block.header.time as i64 - anchor.header.time as i64;
        if time_delta < 0 {
            return Err(block_rejected(
                "ProcessBlock() : block with timestamp before last checkpoint",
            ));
        }
        let max_target = compute_min_work(anchor.header.bits, time_delta, &self.params.consensus)?;
        if compact_to_u256(block.header.bits)? > max_target {
            return Err(block_rejected(
                "ProcessBlock() : block with too little proof-of-work",
            ));
        }
        Ok(())
    }

    fn accept_block(&mut self, block: &Block) -> Result<(), EngineError> {
        let hash = block.hash();
        if hash == self.params.consensus.hash_genesis_block {
            return Ok(());
        }
        let prev = self
            .store
            .block_header(&block.header.prev_block)?
            .ok_or_else(|| EngineError::invariant("accepting a block whose parent is not valid"))?;
        let height = prev.height + 1;

        if self.store.is_block_valid(&hash)? {
            return Err(block_rejected("AcceptBlock() : block already validated"));
        }

        if !self.options.skip_pow_target_check {
            let required = self.next_bits_required(&prev, block.header.time as i64)?;
            if required != block.header.bits {
                log::debug!(
                    "{} has bits {:08x}, expected {required:08x}",
                    hash256_to_hex(&hash),
                    block.header.bits
                );
                return Err(block_rejected("AcceptBlock() : incorrect proof of work"));
            }
        }

        if block.header.time as i64 <= self.median_time_past(&prev)? {
            return Err(block_rejected("AcceptBlock() : block's timestamp is too early"));
        }

        let time = block.header.time as i64;
        if !block.transactions.iter().all(|tx| tx.is_final(height, time)) {
            return Err(block_rejected("AcceptBlock() : contains a non-final transaction"));
        }

        if !self.options.checkpoints_disabled {
            if let Some(pinned) = self.params.consensus.checkpoint_at(height) {
                if *pinned != hash {
                    return Err(block_rejected(format!(
                        "AcceptBlock() : rejected by checkpoint lock-in at {height}"
                    )));
                }
            }
            if let Some(checkpoint) = self.latest_checkpoint()? {
                if height < checkpoint.height {
                    return Err(block_rejected(format!(
                        "AcceptBlock() : forked chain older than last checkpoint (height {height})"
                    )));
                }
            }
        }

        let consensus = &self.params.consensus;
        let (reject_outdated, enforce_upgrade) = (
            consensus.majority_reject_block_outdated,
            consensus.majority_enforce_block_upgrade,
        );
        if block.header.version < 2 {
            if self.is_super_majority(2, &prev, reject_outdated)? {
                return Err(block_rejected(format!(
                    "AcceptBlock() : rejected nVersion=1 block {}",
                    hash256_to_hex(&hash)
                )));
            }
        } else if self.is_super_majority(2, &prev, enforce_upgrade)?
            && block.bip34_height() != Some(height as i64)
        {
            return Err(block_rejected("AcceptBlock() : block height mismatch in coinbase"));
        }

        self.add_block(block, &prev)?;
        self.events.push(ChainEvent::RelayBlock(hash));
        Ok(())
    }

    /// Whether at least `required` of the last `majority_window` blocks up to
    /// `start` have a version of `min_version` or more.
    fn is_super_majority(
        &mut self,
        min_version: i32,
        start: &IndexedHeader,
        required: u32,
    ) -> Result<bool, EngineError> {
        let window = self.params.consensus.majority_window;
        let mut found = 0u32;
        let mut checked = 0u32;
        let mut cursor = Some(start.clone());
        while let Some(header) = cursor {
            if checked >= window || found >= required {
                break;
            }
            if header.header.version >= min_version {
                found += 1;
            }
            checked += 1;
            cursor = self.store.previous_header(&header)?;
        }
        Ok(found >= required)
    }

    fn median_time_past(&mut self, prev: &IndexedHeader) -> Result<i64, EngineError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(prev.clone());
        while let Some(header) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(header.header.time as i64);
            cursor = self.store.previous_header(&header)?;
        }
        times.reverse();
        Ok(median_time_past(&times).unwrap_or(0))
    }

    /// Bits the child of `prev` must carry, gathering as many ancestors as
    /// the retarget rules need.
    fn next_bits_required(
        &mut self,
        prev: &IndexedHeader,
        next_time: i64,
    ) -> Result<u32, EngineError> {
        let consensus = &self.params.consensus;
        let interval = consensus.pow_retarget_interval;
        let limit_bits = pow_limit_bits(consensus);
        let allow_min_difficulty = consensus.pow_allow_min_difficulty_blocks;

        let mut chain = vec![header_info(prev)];
        let mut cursor = prev.clone();
        if (prev.height + 1) % interval == 0 {
            while chain.len() < interval as usize {
                let Some(parent) = self.store.previous_header(&cursor)? else {
                    break;
                };
                chain.push(header_info(&parent));
                cursor = parent;
            }
        } else if allow_min_difficulty {
            while cursor.height % interval != 0 && cursor.header.bits == limit_bits {
                let Some(parent) = self.store.previous_header(&cursor)? else {
                    break;
                };
                chain.push(header_info(&parent));
                cursor = parent;
            }
        }
        chain.reverse();
        Ok(get_next_work_required(&chain, next_time, &self.params.consensus)?)
    }

    fn add_block(&mut self, block: &Block, prev: &IndexedHeader) -> Result<(), EngineError> {
        let hash = block.hash();
        let height = prev.height + 1;
        let new_work = prev.total_work + block_proof(block.header.bits)?;

        let tip_hash = self
            .store
            .mainchain_tip_hash()?
            .ok_or_else(|| EngineError::invariant("valid parent but no main tip"))?;
        let tip = self
            .store
            .block_header(&tip_hash)?
            .ok_or_else(|| EngineError::invariant("main tip is not indexed"))?;

        if new_work <= tip.total_work {
            log::debug!(
                "{} extends a side branch at height {height}",
                hash256_to_hex(&hash)
            );
            self.store.load_output_cache(&block.transactions)?;
            self.store
                .save_block_on_side_branch(block, height, prev.total_work)?;
            return Ok(());
        }

        if prev.hash != tip.hash {
            let (disconnect, connect) = self.find_fork(&tip, prev)?;
            log::info!(
                "{} triggers a reorganization: disconnecting {} blocks, connecting {}",
                hash256_to_hex(&hash),
                disconnect.len(),
                connect.len() + 1
            );
            for stale in &disconnect {
                let stale = self.load_valid_block(stale)?;
                self.store.load_output_cache(&stale.transactions)?;
                self.disconnect_block(&stale)?;
            }
            for fresh in connect.iter().rev() {
                let fresh = self.load_valid_block(fresh)?;
                self.store.load_output_cache(&fresh.transactions)?;
                self.connect_block(&fresh)?;
            }
        }

        self.store.load_output_cache(&block.transactions)?;
        self.connect_block(block)?;
        log::info!("{} is the new tip at height {height}", hash256_to_hex(&hash));
        Ok(())
    }

    fn load_valid_block(&mut self, hash: &Hash256) -> Result<Block, EngineError> {
        self.store.valid_block(hash)?.ok_or_else(|| {
            EngineError::invariant(format!("block {} has no stored body", hash256_to_hex(hash)))
        })
    }

    /// Hashes to disconnect from the old tip (tip first) and to connect up
    /// to `new_prev` (newest first), stopping at the common ancestor.
    fn find_fork(
        &mut self,
        old_tip: &IndexedHeader,
        new_prev: &IndexedHeader,
    ) -> Result<(Vec<Hash256>, Vec<Hash256>), EngineError> {
        let mut old = old_tip.clone();
        let mut new = new_prev.clone();
        let mut disconnect = Vec::new();
        let mut connect = Vec::new();

        while old.height > new.height {
            disconnect.push(old.hash);
            old = self.parent_of(&old)?;
        }
        while new.height > old.height {
            connect.push(new.hash);
            new = self.parent_of(&new)?;
        }
        while old.hash != new.hash {
            disconnect.push(old.hash);
            connect.push(new.hash);
            old = self.parent_of(&old)?;
            new = self.parent_of(&new)?;
        }
        Ok((disconnect, connect))
    }

    fn parent_of(&mut self, header: &IndexedHeader) -> Result<IndexedHeader, EngineError> {
        self.store.previous_header(header)?.ok_or_else(|| {
            EngineError::invariant(format!(
                "branches of {} share no ancestor",
                hash256_to_hex(&header.hash)
            ))
        })
    }

    fn disconnect_block(&mut self, block: &Block) -> Result<(), EngineError> {
        let hash = block.hash();
        let height = self
            .store
            .height_for_block(&hash)?
            .ok_or_else(|| EngineError::invariant("disconnecting an unindexed block"))?;

        for tx in block.transactions.iter().rev() {
            let overlay = self.store.overlay_mut();
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    overlay.mark_spent(&input.prevout, false);
                }
            }
            let txid = tx.txid();
            for index in 0..tx.vout.len() as u32 {
                overlay.mark_unavailable(&OutPoint::new(txid, index));
            }
        }
        self.store.update_outputs_on_disconnect_block(block)?;

        for tx in &block.transactions {
            let txid = tx.txid();
            if tx.is_coinbase() {
                self.store.move_coinbase_tx_to_block_pool(&txid)?;
                continue;
            }
            match self.accept_to_memory_pool(tx, true, true) {
                Ok(()) => {}
                Err(EngineError::Validation(err)) => {
                    log::debug!("{} not returned to the pool: {err}", hash256_to_hex(&txid));
                    for conflicted in self.pool.remove(&mut self.store, &txid)? {
                        self.events.push(ChainEvent::PoolConflicted(conflicted));
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let prev_work = self.store.total_work_up_to(&block.header.prev_block)?;
        self.store
            .save_block_on_side_branch(block, height, prev_work)?;
        self.events
            .push(ChainEvent::BlockDisconnected { hash, height });
        log::debug!("{} disconnected from height {height}", hash256_to_hex(&hash));
        Ok(())
    }

    fn connect_block(&mut self, block: &Block) -> Result<(), EngineError> {
        let started = Instant::now();
        check_block(block, &self.params.consensus, self.max_block_time(), true)?;
        self.metrics.record_check_block(started.elapsed());

        let hash = block.hash();
        if hash == self.params.consensus.hash_genesis_block {
            return Ok(());
        }

        let mut ctx = BlockContext::new(block);
        let height = self
            .store
            .height_for_block(&block.header.prev_block)?
            .ok_or_else(|| EngineError::invariant("connecting a block whose parent is not indexed"))?
            + 1;

        let consensus = &self.params.consensus;
        let check_scripts = self.options.execute_all_scripts
            || self.options.checkpoints_disabled
            || height >= consensus.max_checkpoint_height();

        if !consensus.is_bip30_exception(height, &hash)
            && self.store.has_previously_unspent_outputs_for_any_tx(block)?
        {
            return Err(block_rejected(
                "ConnectBlock() : tried to overwrite transaction (BIP30)",
            ));
        }

        let strict_p2sh = block.header.time >= consensus.bip16_switch_time;
        let flags = if strict_p2sh {
            SCRIPT_VERIFY_P2SH
        } else {
            SCRIPT_VERIFY_NONE
        };

        let inputs_started = Instant::now();
        let mut fees: Amount = 0;
        let mut sigops = 0u32;
        let mut summaries = HashMap::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            sigops += legacy_sigops(tx);
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(block_rejected("ConnectBlock() : too many sigops"));
            }

            if !tx.is_coinbase() {
                let txid = tx.txid();
                if !self
                    .store
                    .all_outpoints_are_available(Some(&ctx), &txid, &prevouts(tx), None)?
                {
                    return Err(block_rejected("ConnectBlock() : inputs missing/spent"));
                }

                if strict_p2sh {
                    let scripts = self
                        .spent_outputs(Some(&ctx), tx, false)?
                        .ok_or_else(|| EngineError::invariant("available input has no output"))?
                        .into_iter()
                        .map(|output| output.script_pubkey)
                        .collect::<Vec<_>>();
                    sigops += p2sh_sigops(tx, &scripts);
                    if sigops > MAX_BLOCK_SIGOPS {
                        return Err(block_rejected("ConnectBlock() : too many sigops"));
                    }
                }

                let summary = self.check_inputs(Some(&ctx), tx, height, flags, check_scripts, false)?;
                fees += summary.fee;
                summaries.insert(txid, summary);
            }

            self.update_unspent(&mut ctx, tx);
        }
        self.metrics.record_inputs(inputs_started.elapsed());

        let persist_started = Instant::now();
        self.store.update_outputs_on_connect_block(block)?;
        for conflicted in self.pool.remove_for_block(&mut self.store, block)? {
            self.events.push(ChainEvent::PoolConflicted(conflicted));
        }

        let coinbase_value = value_out(&block.transactions[0])?;
        let limit = block_subsidy(height, &self.params.consensus) + fees;
        if coinbase_value > limit {
            return Err(block_rejected(format!(
                "ConnectBlock() : coinbase pays too much (actual={coinbase_value} vs limit={limit})"
            )));
        }

        let prev_work = self.store.total_work_up_to(&block.header.prev_block)?;
        self.store
            .save_block_on_main_branch(block, height, prev_work, &summaries)?;
        self.metrics.record_persist(persist_started.elapsed());
        self.events.push(ChainEvent::BlockConnected { hash, height });
        log::debug!("{} connected at height {height}", hash256_to_hex(&hash));
        Ok(())
    }

    /// Spends the inputs and creates the outputs of `tx` in the overlay and
    /// the block context.
    fn update_unspent(&mut self, ctx: &mut BlockContext<'_>, tx: &Transaction) {
        let overlay = self.store.overlay_mut();
        if !tx.is_coinbase() {
            for input in &tx.vin {
                overlay.mark_spent(&input.prevout, true);
                ctx.set_spent(&input.prevout, true);
            }
        }
        let txid = tx.txid();
        for index in 0..tx.vout.len() as u32 {
            overlay.mark_spent(&OutPoint::new(txid, index), false);
        }
    }

    fn resolve_output(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        outpoint: &OutPoint,
        include_pool: bool,
    ) -> Result<Option<TxOut>, EngineError> {
        if let Some(output) = self.store.output_for_outpoint(ctx, outpoint)? {
            return Ok(Some(output));
        }
        if include_pool {
            return self.pool.output(&self.store, outpoint);
        }
        Ok(None)
    }

    /// Outputs spent by each input, or `None` if any is unknown.
    fn spent_outputs(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        tx: &Transaction,
        include_pool: bool,
    ) -> Result<Option<Vec<TxOut>>, EngineError> {
        let mut outputs = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            match self.resolve_output(ctx, &input.prevout, include_pool)? {
                Some(output) => outputs.push(output),
                None => return Ok(None),
            }
        }
        Ok(Some(outputs))
    }

    /// Contextual input checks: availability, coinbase maturity, value
    /// ranges and, when `check_scripts` is set, script evaluation.
    fn check_inputs(
        &mut self,
        ctx: Option<&BlockContext<'_>>,
        tx: &Transaction,
        spend_height: u32,
        flags: u32,
        check_scripts: bool,
        include_pool: bool,
    ) -> Result<TxSummary, EngineError> {
        if tx.is_coinbase() {
            return Ok(TxSummary::default());
        }
        let txid = tx.txid();
        let pool = include_pool.then_some(&self.pool);
        if !self
            .store
            .all_outpoints_are_available(ctx, &txid, &prevouts(tx), pool)?
        {
            return Err(tx_rejected(format!(
                "CheckInputs() : {} inputs unavailable",
                hash256_to_hex(&txid)
            )));
        }

        let maturity = self.params.consensus.coinbase_maturity as i64;
        let mut value_in: Amount = 0;
        let mut spent = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let output = self
                .resolve_output(ctx, &input.prevout, include_pool)?
                .ok_or_else(|| EngineError::invariant("available input has no output"))?;

            if self.store.is_tx_coinbase(ctx, &input.prevout.hash)? {
                let output_height = self.store.height_for_tx(ctx, &input.prevout.hash)?;
                let depth = spend_height as i64 - output_height as i64;
                if depth < maturity {
                    return Err(tx_rejected(format!(
                        "CheckInputs() : tried to spend coinbase at depth {depth} < {maturity}"
                    )));
                }
            }

            value_in = value_in.saturating_add(output.value);
            if !money_range(output.value) || !money_range(value_in) {
                return Err(tx_rejected("CheckInputs() : txin values out of range"));
            }
            spent.push(output);
        }

        let value_out = value_out(tx)?;
        if value_in < value_out {
            return Err(tx_rejected(format!(
                "CheckInputs() : tx {} value in < value out",
                hash256_to_hex(&txid)
            )));
        }
        let fee = value_in - value_out;
        if !money_range(fee) {
            return Err(tx_rejected("CheckInputs() : fees out of range"));
        }

        if check_scripts {
            let verifier = &self.verifier;
            let failed = spent.par_iter().enumerate().any(|(index, output)| {
                verifier
                    .verify_input(tx, index, &output.script_pubkey, flags)
                    .is_err()
            });
            if failed {
                return Err(tx_rejected("Script evaluation failed"));
            }
        }

        Ok(TxSummary {
            fee,
            total_in: value_in,
            total_out: value_out,
        })
    }

    fn tip_height(&mut self) -> Result<u32, EngineError> {
        let Some(tip) = self.store.mainchain_tip_hash()? else {
            return Ok(0);
        };
        Ok(self.store.height_for_block(&tip)?.unwrap_or(0))
    }

    /// Admits a loose transaction to the memory pool. `expect_tip` is set
    /// when the transaction is coming back from a disconnected block and is
    /// still recorded on the main branch.
    fn accept_to_memory_pool(
        &mut self,
        tx: &Transaction,
        expect_tip: bool,
        on_disconnect: bool,
    ) -> Result<(), EngineError> {
        let txid = tx.txid();
        log::debug!("{} start processing", hash256_to_hex(&txid));

        check_transaction(tx)?;
        if tx.is_coinbase() {
            return Err(tx_rejected("AcceptToMemoryPool() : coinbase as individual tx"));
        }

        let spend_height = self.tip_height()? + 1;
        let require_standard = self.params.require_standard && !self.options.allow_nonstandard_tx;
        if require_standard {
            if let Err(reason) = is_standard_tx(tx, spend_height, unix_now()) {
                return Err(tx_rejected(format!(
                    "AcceptToMemoryPool() : nonstandard transaction: {reason}"
                )));
            }
        }

        if self.pool.exists(&self.store, &txid)? {
            return Err(tx_rejected("AcceptToMemoryPool() : already in the memory pool"));
        }
        if self.pool.any_inputs_spent(&self.store, tx)? {
            return Err(tx_rejected(
                "AcceptToMemoryPool() : already spent in the memory pool",
            ));
        }
        if !expect_tip && self.pool.exists_including_main_branch(&self.store, &txid)? {
            return Err(tx_rejected("AcceptToMemoryPool() : transaction already seen"));
        }

        for input in &tx.vin {
            if !self
                .pool
                .exists_including_main_branch(&self.store, &input.prevout.hash)?
            {
                return Err(EngineError::Validation(ValidationError::MissingInputs(
                    "AcceptToMemoryPool() : transaction missing inputs".to_string(),
                )));
            }
        }

        if !on_disconnect {
            self.store.load_output_cache(std::slice::from_ref(tx))?;
        }

        if !self.store.all_outpoints_are_available(
            None,
            &txid,
            &prevouts(tx),
            Some(&self.pool),
        )? {
            return Err(tx_rejected("AcceptToMemoryPool() : inputs already spent"));
        }

        if require_standard {
            let scripts = self
                .spent_outputs(None, tx, true)?
                .map(|outputs| {
                    outputs
                        .into_iter()
                        .map(|output| output.script_pubkey)
                        .collect::<Vec<_>>()
                });
            if !scripts.is_some_and(|scripts| are_inputs_standard(tx, &scripts)) {
                return Err(tx_rejected(
                    "AcceptToMemoryPool() : nonstandard transaction input",
                ));
            }
        }

        let summary = self.check_inputs(None, tx, spend_height, SCRIPT_VERIFY_P2SH, true, true)?;
        self.pool
            .add_unchecked(&mut self.store, tx, summary, on_disconnect)?;
        self.events.push(ChainEvent::PoolAdded(txid));
        log::debug!("{} accepted to the memory pool", hash256_to_hex(&txid));
        Ok(())
    }

    /// Validates a loose transaction. Missing inputs park it as an orphan;
    /// acceptance retries every orphan it unlocks, breadth first.
    pub fn process_transaction(
        &mut self,
        tx: &Transaction,
        raise_errors: bool,
    ) -> Result<bool, EngineError> {
        self.store.flush_overlay();
        let txid = tx.txid();

        let outcome = self.atomically(|engine| match engine.accept_to_memory_pool(tx, false, false) {
            Ok(()) => Ok(None),
            Err(EngineError::Validation(err)) if err.is_missing_inputs() => {
                if engine.pool.add_orphan_tx(&mut engine.store, tx)? {
                    log::debug!("{} staged as an orphan", hash256_to_hex(&txid));
                }
                Ok(Some(err))
            }
            Err(err) => Err(err),
        });

        match outcome {
            Ok(None) => {}
            Ok(Some(missing)) => {
                self.store.flush_overlay();
                if raise_errors {
                    return Err(EngineError::Validation(missing));
                }
                return Ok(false);
            }
            Err(EngineError::Validation(err)) => {
                log::debug!("{} rejected: {err}", hash256_to_hex(&txid));
                self.store.flush_overlay();
                if raise_errors {
                    return Err(EngineError::Validation(err));
                }
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        self.events.push(ChainEvent::RelayTx(txid));
        let mut parents = VecDeque::from([txid]);
        while let Some(parent) = parents.pop_front() {
            for orphan in self.pool.orphan_txs_by_prev_hash(&self.store, &parent)? {
                let orphan_id = orphan.txid();
                self.store.flush_overlay();
                match self.atomically(|engine| engine.accept_to_memory_pool(&orphan, false, false)) {
                    Ok(()) => {
                        parents.push_back(orphan_id);
                        self.events.push(ChainEvent::RelayTx(orphan_id));
                    }
                    Err(EngineError::Validation(err)) if err.is_missing_inputs() => {}
                    Err(EngineError::Validation(err)) => {
                        log::warn!(
                            "{} orphan tx failed validation: {err}",
                            hash256_to_hex(&orphan_id)
                        );
                        self.atomically(|engine| {
                            engine.pool.remove_orphan(&mut engine.store, &orphan_id)
                        })?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.store.flush_overlay();
        Ok(true)
    }
}
