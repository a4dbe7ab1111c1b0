//! In-memory header index with lazy loading and bounded capacity.
//!
//! Headers live in an arena of slots addressed by hash. Child links are a
//! separate adjacency map keyed by parent hash, so evicting or removing an
//! entry is a map deletion and never leaves a dangling reference.

use std::collections::{HashMap, VecDeque};

use primitive_types::U256;
use utxod_consensus::Hash256;
use utxod_pow::difficulty::block_proof;
use utxod_primitives::block::BlockHeader;

use crate::error::EngineError;

pub const DEFAULT_HEADER_CACHE_CAPACITY: usize = 2016;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedHeader {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative work up to and including this header.
    pub total_work: U256,
}

impl IndexedHeader {
    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block
    }
}

/// Durable lookup used to fill index misses. Implementations read storage
/// only and never call back into the index.
pub trait HeaderSource {
    fn load_header(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, EngineError>;
}

struct Slot {
    header: IndexedHeader,
    stamp: u64,
}

pub struct ChainIndex {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_hash: HashMap<Hash256, usize>,
    children: HashMap<Hash256, Vec<Hash256>>,
    order: VecDeque<(usize, u64)>,
    clock: u64,
    capacity: usize,
    /// Hashes added per open transaction frame.
    journal: Vec<Vec<Hash256>>,
}

impl Default for ChainIndex {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_CACHE_CAPACITY)
    }
}

impl ChainIndex {
    /// `capacity` of zero disables eviction.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_hash: HashMap::new(),
            children: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
            capacity,
            journal: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Cached entry only; never touches storage.
    pub fn peek(&self, hash: &Hash256) -> Option<&IndexedHeader> {
        let slot = *self.by_hash.get(hash)?;
        self.slots[slot].as_ref().map(|slot| &slot.header)
    }

    pub fn children_of(&self, hash: &Hash256) -> &[Hash256] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cached header, loading it from `source` on a miss. A loaded header
    /// whose parent is cached takes its height and work from the parent.
    pub fn get(
        &mut self,
        hash: &Hash256,
        source: &dyn HeaderSource,
    ) -> Result<Option<IndexedHeader>, EngineError> {
        if let Some(header) = self.peek(hash) {
            return Ok(Some(header.clone()));
        }
        let Some(mut loaded) = source.load_header(hash)? else {
            return Ok(None);
        };
        if let Some(parent) = self.peek(loaded.prev_hash()) {
            loaded.height = parent.height + 1;
            loaded.total_work = parent.total_work + block_proof(loaded.header.bits)?;
        }
        self.store(loaded.clone());
        Ok(Some(loaded))
    }

    pub fn previous(
        &mut self,
        header: &IndexedHeader,
        source: &dyn HeaderSource,
    ) -> Result<Option<IndexedHeader>, EngineError> {
        self.get(header.prev_hash(), source)
    }

    /// Registers a header with `prior_work` as its parent's cumulative work.
    /// Returns the existing entry unchanged when the hash is already cached.
    pub fn insert(
        &mut self,
        header: &BlockHeader,
        height: u32,
        prior_work: U256,
    ) -> Result<IndexedHeader, EngineError> {
        let hash = header.hash();
        if let Some(existing) = self.peek(&hash) {
            return Ok(existing.clone());
        }
        let entry = IndexedHeader {
            hash,
            header: header.clone(),
            height,
            total_work: prior_work + block_proof(header.bits)?,
        };
        self.store(entry.clone());
        Ok(entry)
    }

    pub fn remove(&mut self, hash: &Hash256) {
        let Some(slot) = self.by_hash.remove(hash) else {
            return;
        };
        if let Some(Slot { header, .. }) = self.slots[slot].take() {
            if let Some(siblings) = self.children.get_mut(header.prev_hash()) {
                siblings.retain(|child| child != hash);
                if siblings.is_empty() {
                    self.children.remove(header.prev_hash());
                }
            }
        }
        self.children.remove(hash);
        self.free.push(slot);
    }

    pub fn begin(&mut self) {
        self.journal.push(Vec::new());
    }

    pub fn commit(&mut self) {
        if let Some(frame) = self.journal.pop() {
            if let Some(parent) = self.journal.last_mut() {
                parent.extend(frame);
            }
        }
    }

    /// Drops every entry added since the matching `begin`.
    pub fn rollback(&mut self) {
        if let Some(frame) = self.journal.pop() {
            for hash in frame.iter().rev() {
                self.remove(hash);
            }
        }
    }

    fn store(&mut self, header: IndexedHeader) {
        let hash = header.hash;
        let parent = *header.prev_hash();
        self.clock = self.clock.wrapping_add(1);
        let stamp = self.clock;
        let entry = Slot { header, stamp };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.by_hash.insert(hash, slot);
        self.children.entry(parent).or_default().push(hash);
        self.order.push_back((slot, stamp));
        if let Some(frame) = self.journal.last_mut() {
            frame.push(hash);
        }
        self.evict();
    }

    fn evict(&mut self) {
        if self.capacity == 0 {
            return;
        }
        while self.by_hash.len() > self.capacity {
            let Some((slot, stamp)) = self.order.pop_front() else {
                break;
            };
            let hash = match &self.slots[slot] {
                Some(entry) if entry.stamp == stamp => entry.header.hash,
                _ => continue,
            };
            self.remove(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stored(HashMap<Hash256, IndexedHeader>);

    impl HeaderSource for Stored {
        fn load_header(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, EngineError> {
            Ok(self.0.get(hash).cloned())
        }
    }

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    #[test]
    fn lazy_load_derives_height_from_cached_parent() {
        let mut index = ChainIndex::new(0);
        let parent = index.insert(&header([0u8; 32], 1), 10, U256::zero()).expect("insert");
        let child = header(parent.hash, 2);
        let stored = IndexedHeader {
            hash: child.hash(),
            header: child.clone(),
            height: 0,
            total_work: U256::zero(),
        };
        let source = Stored(HashMap::from([(stored.hash, stored.clone())]));

        let loaded = index.get(&stored.hash, &source).expect("get").expect("child");
        assert_eq!(loaded.height, 11);
        assert_eq!(loaded.total_work, parent.total_work + U256::from(2u64));
        assert_eq!(index.children_of(&parent.hash), &[stored.hash]);
        assert!(index.get(&[9u8; 32], &source).expect("get").is_none());
    }

    #[test]
    fn evicts_oldest_first_and_unlinks_children() {
        let mut index = ChainIndex::new(2);
        let first = index.insert(&header([0u8; 32], 1), 0, U256::zero()).expect("insert");
        let second = index.insert(&header(first.hash, 2), 1, first.total_work).expect("insert");
        let third = index.insert(&header(second.hash, 3), 2, second.total_work).expect("insert");

        assert_eq!(index.len(), 2);
        assert!(!index.contains(&first.hash));
        assert!(index.contains(&second.hash));
        assert!(index.children_of(&first.hash).is_empty());
        assert_eq!(index.children_of(&second.hash), &[third.hash]);
        assert_eq!(third.total_work, U256::from(6u64));
    }

    #[test]
    fn rollback_forgets_frame_entries() {
        let mut index = ChainIndex::new(0);
        let kept = index.insert(&header([0u8; 32], 1), 0, U256::zero()).expect("insert");
        index.begin();
        let dropped = index.insert(&header(kept.hash, 2), 1, kept.total_work).expect("insert");
        index.rollback();

        assert!(index.contains(&kept.hash));
        assert!(!index.contains(&dropped.hash));
        assert!(index.children_of(&kept.hash).is_empty());
    }
}
