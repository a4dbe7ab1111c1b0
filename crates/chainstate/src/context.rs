//! The block being connected, as seen by lookups that need in-block
//! visibility before the block is persisted.

use std::collections::{HashMap, HashSet};

use utxod_consensus::Hash256;
use utxod_primitives::block::Block;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxOut};

pub struct BlockContext<'a> {
    block: &'a Block,
    hash: Hash256,
    positions: HashMap<Hash256, usize>,
    spent: HashSet<OutPoint>,
}

impl<'a> BlockContext<'a> {
    pub fn new(block: &'a Block) -> Self {
        let positions = block
            .transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| (tx.txid(), position))
            .collect();
        Self {
            block,
            hash: block.hash(),
            positions,
            spent: HashSet::new(),
        }
    }

    pub fn block(&self) -> &'a Block {
        self.block
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.block.header.prev_block
    }

    pub fn position(&self, txid: &Hash256) -> Option<usize> {
        self.positions.get(txid).copied()
    }

    pub fn tx(&self, txid: &Hash256) -> Option<&'a Transaction> {
        self.position(txid).map(|position| &self.block.transactions[position])
    }

    pub fn txout(&self, outpoint: &OutPoint) -> Option<&'a TxOut> {
        self.tx(&outpoint.hash)?.vout.get(outpoint.index as usize)
    }

    /// `Some` only for outputs created in this block.
    pub fn is_spent(&self, outpoint: &OutPoint) -> Option<bool> {
        self.txout(outpoint)?;
        Some(self.spent.contains(outpoint))
    }

    pub fn set_spent(&mut self, outpoint: &OutPoint, spent: bool) {
        if self.txout(outpoint).is_none() {
            return;
        }
        if spent {
            self.spent.insert(outpoint.clone());
        } else {
            self.spent.remove(outpoint);
        }
    }
}
