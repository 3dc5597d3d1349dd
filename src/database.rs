//! Key-value storage capability
//!
//! The engine only needs ordered byte keys, point reads, prefix cursors and
//! atomic batches. [`MemoryDatabase`] is the in-process implementation; a
//! persistent engine plugs in by implementing [`Database`].

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use parking_lot::{Mutex, RwLock};

use crate::error::{ConsensusError, Result};

/// Puts and deletes applied atomically by [`Database::write`]
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies every operation of the batch or none of them
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Cursor over all keys under `prefix`, optionally starting strictly after `start_after`
    /// (given without the prefix)
    fn cursor(&self, prefix: &[u8], start_after: Option<&[u8]>) -> Result<DbCursor>;

    fn count(&self, prefix: &[u8]) -> Result<usize>;
}

/// Snapshot cursor. Must be closed; any use after `close` fails with
/// [`ConsensusError::IteratorClosed`].
#[derive(Debug)]
pub struct DbCursor {
    prefix_len: usize,
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    closed: bool,
}

impl DbCursor {
    pub fn new(prefix_len: usize, entries: VecDeque<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { prefix_len, entries, closed: false }
    }

    /// Next `(key without prefix, value)` pair
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.closed {
            return Err(ConsensusError::IteratorClosed);
        }
        Ok(self.entries.pop_front().map(|(key, value)| (key[self.prefix_len..].to_vec(), value)))
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(ConsensusError::IteratorClosed);
        }
        self.closed = true;
        self.entries.clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Ordered in-memory map behind a read-write lock
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Remaining successful writes before every write fails; simulates a crash
    write_limit: Mutex<Option<usize>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents as a fresh database
    pub fn snapshot(&self) -> MemoryDatabase {
        MemoryDatabase { data: RwLock::new(self.data.read().clone()), write_limit: Mutex::new(None) }
    }

    /// Allows `limit` more batches, then fails all later writes. `None` removes the limit.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        *self.write_limit.lock() = limit;
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        {
            let mut limit = self.write_limit.lock();
            match limit.as_mut() {
                Some(0) => return Err(ConsensusError::Database("write limit reached".to_string())),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        let mut data = self.data.write();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    data.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn cursor(&self, prefix: &[u8], start_after: Option<&[u8]>) -> Result<DbCursor> {
        let data = self.data.read();
        let lower = match start_after {
            Some(key) => Bound::Excluded([prefix, key].concat()),
            None => Bound::Included(prefix.to_vec()),
        };
        let entries = data
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(DbCursor::new(prefix.len(), entries))
    }

    fn count(&self, prefix: &[u8]) -> Result<usize> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .count())
    }
}
