//! Per-operation staging of store writes
//!
//! Every writing operation collects its changes in a [`StagingArea`]. Stores
//! keep one shard each, keyed by their bucket prefix. Committing serializes all
//! shards into a single [`WriteBatch`] and only then refreshes store caches;
//! dropping the area discards everything.

use std::any::Any;
use std::collections::BTreeMap;

use tracing::trace;

use crate::database::{Database, WriteBatch};
use crate::error::{ConsensusError, Result};

pub trait StagingShard: Any + Send {
    /// Serializes the staged writes into `batch`
    fn commit(&self, batch: &mut WriteBatch) -> Result<()>;

    /// Runs after the batch is durably written
    fn post_commit(&self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Default)]
pub struct StagingArea {
    shards: BTreeMap<Vec<u8>, Box<dyn StagingShard>>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shard<S: StagingShard>(&self, key: &[u8]) -> Result<Option<&S>> {
        match self.shards.get(key) {
            None => Ok(None),
            Some(shard) => shard.as_any().downcast_ref::<S>().map(Some).ok_or_else(|| shard_type_mismatch(key)),
        }
    }

    pub fn shard_mut<S: StagingShard, F: FnOnce() -> S>(&mut self, key: &[u8], create: F) -> Result<&mut S> {
        let shard = self.shards.entry(key.to_vec()).or_insert_with(|| Box::new(create()));
        shard.as_any_mut().downcast_mut::<S>().ok_or_else(|| shard_type_mismatch(key))
    }

    /// Writes every shard in one atomic batch, then lets the shards update their caches
    pub fn commit(self, db: &dyn Database) -> Result<()> {
        if self.shards.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for shard in self.shards.values() {
            shard.commit(&mut batch)?;
        }
        trace!(shards = self.shards.len(), writes = batch.len(), "committing staging area");
        db.write(batch)?;
        for shard in self.shards.values() {
            shard.post_commit();
        }
        Ok(())
    }
}

fn shard_type_mismatch(key: &[u8]) -> ConsensusError {
    ConsensusError::Invariant(format!("staging shard {} has an unexpected type", String::from_utf8_lossy(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingShard {
        key: Vec<u8>,
        post_commits: Arc<AtomicUsize>,
    }

    impl StagingShard for CountingShard {
        fn commit(&self, batch: &mut WriteBatch) -> Result<()> {
            batch.put(self.key.clone(), vec![1]);
            Ok(())
        }

        fn post_commit(&self) {
            self.post_commits.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_commit_writes_all_shards_then_runs_post_commit() {
        let db = MemoryDatabase::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut area = StagingArea::new();
        for key in [b"x".to_vec(), b"y".to_vec()] {
            let post_commits = counter.clone();
            area.shard_mut(&key.clone(), move || CountingShard { key, post_commits }).unwrap();
        }
        area.commit(&db).unwrap();
        assert!(db.has(b"x").unwrap() && db.has(b"y").unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_write_skips_post_commit() {
        let db = MemoryDatabase::new();
        db.set_write_limit(Some(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut area = StagingArea::new();
        let post_commits = counter.clone();
        area.shard_mut(b"x", move || CountingShard { key: b"x".to_vec(), post_commits }).unwrap();
        assert!(area.commit(&db).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(db.is_empty());
    }

    #[test]
    fn test_mismatched_shard_type_is_invariant_error() {
        struct Other;
        impl StagingShard for Other {
            fn commit(&self, _: &mut WriteBatch) -> Result<()> {
                Ok(())
            }
            fn post_commit(&self) {}
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        let mut area = StagingArea::new();
        area.shard_mut(b"k", || Other).unwrap();
        assert!(matches!(area.shard::<CountingShard>(b"k"), Err(ConsensusError::Invariant(_))));
    }
}
