//! Outpoint-keyed UTXO buckets
//!
//! Point reads honour staged writes. Iteration goes through a database
//! cursor and therefore only sees committed entries.

use std::sync::Arc;

use tracing::debug;

use crate::constants::UTXO_SWAP_CHUNK_SIZE;
use crate::database::{Database, DbCursor, WriteBatch};
use crate::error::Result;
use crate::serialization::Decode;
use crate::staging::StagingArea;
use crate::stores::{CachedStore, StoreKey};
use crate::types::{Outpoint, UtxoEntry};
use crate::utxo::{UtxoDiff, UtxoView};

#[derive(Clone)]
pub struct UtxoSetStore {
    inner: CachedStore<Outpoint, UtxoEntry>,
}

impl UtxoSetStore {
    /// UTXO buckets are not cached: the sets are large and read once per input
    pub fn new(name: &'static str, db: Arc<dyn Database>) -> Self {
        Self { inner: CachedStore::new(name, db, 0) }
    }

    pub fn get(&self, area: &StagingArea, outpoint: &Outpoint) -> Result<Option<UtxoEntry>> {
        Ok(self.inner.try_get(area, outpoint)?.map(|entry| entry.as_ref().clone()))
    }

    pub fn stage_entry(&self, area: &mut StagingArea, outpoint: Outpoint, entry: UtxoEntry) -> Result<()> {
        self.inner.stage(area, outpoint, entry)
    }

    pub fn delete_entry(&self, area: &mut StagingArea, outpoint: Outpoint) -> Result<()> {
        self.inner.delete(area, outpoint)
    }

    pub fn stage_diff(&self, area: &mut StagingArea, diff: &UtxoDiff) -> Result<()> {
        for outpoint in diff.to_remove().keys() {
            if !diff.to_add().contains_key(outpoint) {
                self.inner.delete(area, *outpoint)?;
            }
        }
        for (outpoint, entry) in diff.to_add() {
            self.inner.stage(area, *outpoint, entry.clone())?;
        }
        Ok(())
    }

    /// Read view bound to a staging area
    pub fn view<'a>(&'a self, area: &'a StagingArea) -> UtxoSetView<'a> {
        UtxoSetView { store: self, area }
    }

    /// Iterates committed entries, starting strictly after `from` when given
    pub fn iterator(&self, from: Option<&Outpoint>) -> Result<UtxoSetIterator> {
        let start_after = from.map(|outpoint| outpoint.to_key_bytes());
        let cursor = self.inner.db().cursor(self.inner.prefix(), start_after.as_deref())?;
        Ok(UtxoSetIterator { cursor })
    }

    /// Up to `limit` committed entries after `from`
    pub fn entries(&self, from: Option<&Outpoint>, limit: usize) -> Result<Vec<(Outpoint, UtxoEntry)>> {
        let mut iterator = self.iterator(from)?;
        let mut entries = Vec::new();
        let collected: Result<()> = (|| {
            while entries.len() < limit {
                match iterator.next_utxo()? {
                    Some(pair) => entries.push(pair),
                    None => break,
                }
            }
            Ok(())
        })();
        iterator.close()?;
        collected.map(|_| entries)
    }

    pub fn count(&self) -> Result<usize> {
        self.inner.count()
    }

    /// Deletes every committed entry, one chunk per write
    pub fn clear(&self) -> Result<()> {
        let db = self.inner.db();
        loop {
            let mut cursor = db.cursor(self.inner.prefix(), None)?;
            let mut batch = WriteBatch::new();
            while batch.len() < UTXO_SWAP_CHUNK_SIZE {
                match cursor.next_entry()? {
                    Some((key, _)) => batch.delete([self.inner.prefix(), key.as_slice()].concat()),
                    None => break,
                }
            }
            cursor.close()?;
            if batch.is_empty() {
                return Ok(());
            }
            db.write(batch)?;
        }
    }

    /// Replaces this bucket's contents with a copy of `source`, chunk by chunk.
    /// Not atomic; callers guard it with the pruning-point update sentinel.
    pub fn overwrite_from(&self, source: &UtxoSetStore) -> Result<()> {
        self.clear()?;
        let db = self.inner.db();
        let mut last: Option<Vec<u8>> = None;
        let mut copied = 0usize;
        loop {
            let mut cursor = source.inner.db().cursor(source.inner.prefix(), last.as_deref())?;
            let mut batch = WriteBatch::new();
            while batch.len() < UTXO_SWAP_CHUNK_SIZE {
                match cursor.next_entry()? {
                    Some((key, value)) => {
                        batch.put([self.inner.prefix(), key.as_slice()].concat(), value);
                        last = Some(key);
                    }
                    None => break,
                }
            }
            cursor.close()?;
            if batch.is_empty() {
                break;
            }
            copied += batch.len();
            db.write(batch)?;
        }
        debug!(from = source.inner.name(), to = self.inner.name(), copied, "copied utxo bucket");
        Ok(())
    }
}

pub struct UtxoSetView<'a> {
    store: &'a UtxoSetStore,
    area: &'a StagingArea,
}

impl UtxoView for UtxoSetView<'_> {
    fn get_utxo(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>> {
        self.store.get(self.area, outpoint)
    }
}

/// Cursor-backed iterator over a UTXO bucket. Must be closed.
pub struct UtxoSetIterator {
    cursor: DbCursor,
}

impl UtxoSetIterator {
    pub fn next_utxo(&mut self) -> Result<Option<(Outpoint, UtxoEntry)>> {
        match self.cursor.next_entry()? {
            None => Ok(None),
            Some((key, value)) => Ok(Some((Outpoint::from_key_bytes(&key)?, UtxoEntry::decode(&value)?))),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.cursor.close()
    }
}
