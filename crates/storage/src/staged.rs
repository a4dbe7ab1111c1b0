//! Nested savepoints over a [`KeyValueStore`].
//!
//! Writes made while a frame is open are staged in memory and are visible to
//! reads through this store. Committing an inner frame folds its writes into
//! the enclosing one; committing the outermost frame applies everything as a
//! single atomic batch. Rolling back drops the frame's writes.

use std::collections::BTreeMap;

use crate::{Column, KeyValueStore, StoreError, WriteBatch};

type Frame = BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>;

pub struct StagedStore<S> {
    base: S,
    frames: Vec<Frame>,
}

impl<S: KeyValueStore> StagedStore<S> {
    pub fn new(base: S) -> Self {
        Self {
            base,
            frames: Vec::new(),
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn begin(&mut self) {
        self.frames.push(Frame::new());
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| StoreError::Backend("commit without open transaction".to_string()))?;
        match self.frames.last_mut() {
            Some(parent) => parent.extend(frame),
            None => {
                let mut batch = WriteBatch::new();
                for ((column, key), value) in frame {
                    match value {
                        Some(value) => batch.put(column, key, value),
                        None => batch.delete(column, key),
                    }
                }
                if !batch.is_empty() {
                    self.base.write_batch(&batch)?;
                }
            }
        }
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.frames.pop();
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let lookup = (column, key.to_vec());
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(&lookup) {
                return Ok(value.clone());
            }
        }
        self.base.get(column, key)
    }

    pub fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    pub fn put(
        &mut self,
        column: Column,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let key = key.into();
        let value = value.into();
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert((column, key), Some(value));
                Ok(())
            }
            None => self.base.put(column, &key, &value),
        }
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let key = key.into();
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert((column, key), None);
                Ok(())
            }
            None => self.base.delete(column, &key),
        }
    }

    pub fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(column, prefix)?.into_iter().collect();
        for frame in &self.frames {
            let staged = frame
                .range((column, prefix.to_vec())..)
                .take_while(|((col, key), _)| *col == column && key.starts_with(prefix));
            for ((_, key), value) in staged {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
