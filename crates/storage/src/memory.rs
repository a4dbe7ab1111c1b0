//! In-memory store used by tests and the `memory` backend.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type Table = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Table>, StoreError> {
        self.table
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Table>, StoreError> {
        self.table
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()?.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write()?.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let table = self.read()?;
        Ok(table
            .range((column, prefix.to_vec())..)
            .take_while(|((col, key), _)| *col == column && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut table = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    table.insert((*column, key.clone()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    table.remove(&(*column, key.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_in_column() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"ab1", b"1").expect("put");
        store.put(Column::Utxo, b"ab2", b"2").expect("put");
        store.put(Column::Utxo, b"ac1", b"3").expect("put");
        store.put(Column::Output, b"ab3", b"4").expect("put");

        let found = store.scan_prefix(Column::Utxo, b"ab").expect("scan");
        assert_eq!(
            found,
            vec![(b"ab1".to_vec(), b"1".to_vec()), (b"ab2".to_vec(), b"2".to_vec())]
        );
        assert_eq!(store.scan_prefix(Column::Utxo, b"").expect("scan").len(), 3);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k".to_vec(), b"v1".to_vec());
        batch.delete(Column::Meta, b"k".to_vec());
        batch.put(Column::Meta, b"k2".to_vec(), b"v2".to_vec());
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(Column::Meta, b"k").expect("get"), None);
        assert_eq!(store.get(Column::Meta, b"k2").expect("get"), Some(b"v2".to_vec()));
    }
}
