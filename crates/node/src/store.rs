//! Backend selected at startup.

use std::fs;

use anyhow::Context;
use utxod_primitives::transaction::Transaction;
use utxod_script::verify::{NoScriptChecks, ScriptVerifier, SignatureChecker};
use utxod_script::ScriptError;
use utxod_storage::fjall::{FjallOptions, FjallStore};
use utxod_storage::memory::MemoryStore;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::config::{Backend, Config, ScriptChecks};

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        match config.backend {
            Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
            Backend::Fjall => {
                let path = config.db_path();
                fs::create_dir_all(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let options = FjallOptions {
                    cache_bytes: config.db_cache_bytes,
                };
                let store = FjallStore::open_with_options(&path, options)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                Ok(Store::Fjall(store))
            }
        }
    }

    /// Syncs the journal. A no-op for the memory backend.
    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

/// Script verifier selected by `script_checks`.
pub enum Verifier {
    Signatures(SignatureChecker),
    Disabled(NoScriptChecks),
}

impl Verifier {
    pub fn new(checks: ScriptChecks) -> Self {
        match checks {
            ScriptChecks::Signatures => Verifier::Signatures(SignatureChecker),
            ScriptChecks::None => Verifier::Disabled(NoScriptChecks),
        }
    }
}

impl ScriptVerifier for Verifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        flags: u32,
    ) -> Result<(), ScriptError> {
        match self {
            Verifier::Signatures(checker) => {
                checker.verify_input(tx, input_index, script_pubkey, flags)
            }
            Verifier::Disabled(checker) => {
                checker.verify_input(tx, input_index, script_pubkey, flags)
            }
        }
    }
}
