use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::error::TrieError;

/// Byte-keyed node store backing a trie. Keys are node digests plus the
/// reserved state-root key; values are canonical node encodings.
pub trait TrieDB: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError>;

    fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies all writes accumulated in `batch` atomically.
    fn put_batch(&self, batch: WriteBatch) -> Result<(), TrieError>;
}

/// Ordered accumulator of store writes. A commit fills one in post-order of
/// the tree walk, with the state-root write appended last, and the store
/// applies it as a unit.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.ops
    }
}

/// InMemory implementation of the `TrieDB` trait, sharing its map with the
/// creator so tests and embedders can inspect or manipulate stored nodes.
pub struct InMemoryTrieDB {
    inner: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryTrieDB {
    pub fn new(map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>) -> Self {
        Self { inner: map }
    }
}

impl Default for InMemoryTrieDB {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl TrieDB for InMemoryTrieDB {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(key)
            .cloned())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .contains_key(key))
    }

    fn put_batch(&self, batch: WriteBatch) -> Result<(), TrieError> {
        let mut db = self.inner.lock().map_err(|_| TrieError::LockError)?;
        for (key, value) in batch.into_ops() {
            db.insert(key, value);
        }
        Ok(())
    }
}
