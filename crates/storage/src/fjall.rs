//! Durable store on fjall, one partition per column.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    /// Block cache shared by every partition.
    pub cache_bytes: Option<u64>,
}

pub struct FjallStore {
    keyspace: Keyspace,
    // Indexed by `Column as usize`.
    partitions: Vec<PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        let keyspace = config.open().map_err(backend)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(backend)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        &self.partitions[column as usize]
    }

    /// Forces buffered writes to the journal on disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(backend)
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(backend)?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(backend)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(backend)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.partition(column)
            .prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(backend)
            })
            .collect()
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut pending = self.keyspace.batch();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column), key.as_slice(), value.as_slice())
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column), key.as_slice())
                }
            }
        }
        pending.commit().map_err(backend)
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
