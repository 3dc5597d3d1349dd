//! Typed, cached stores over database buckets
//!
//! Every store reads through three layers: the operation's staging shard, an
//! in-memory cache of committed values, and finally the database. Writes only
//! ever go to the staging shard.

pub mod pruning;
pub mod utxo_set;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::database::{Database, WriteBatch};
use crate::error::{ConsensusError, Result};
use crate::multiset::Multiset;
use crate::serialization::{Decode, Encode};
use crate::staging::{StagingArea, StagingShard};
use crate::types::*;
use crate::utxo::UtxoDiff;

pub use pruning::PruningStore;
pub use utxo_set::UtxoSetStore;

/// Keys stored as raw bytes after the bucket prefix
pub trait StoreKey: Clone + Eq + std::hash::Hash + Debug + Send + Sync + 'static {
    fn to_key_bytes(&self) -> Vec<u8>;

    fn from_key_bytes(bytes: &[u8]) -> Result<Self>;
}

impl StoreKey for Hash {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        Hash::from_slice(bytes)
    }
}

impl StoreKey for Outpoint {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        Outpoint::decode(bytes)
    }
}

/// Big-endian so that cursor order matches numeric order
impl StoreKey for u64 {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ConsensusError::Deserialization(format!("u64 key must be 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_be_bytes(array))
    }
}

/// Singleton values live under the bare bucket prefix
impl StoreKey for () {
    fn to_key_bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.is_empty() {
            true => Ok(()),
            false => Err(ConsensusError::Deserialization("singleton key must be empty".to_string())),
        }
    }
}

type Cache<K, V> = Arc<RwLock<HashMap<K, Arc<V>>>>;

pub struct CachedStore<K: StoreKey, V> {
    name: &'static str,
    prefix: Vec<u8>,
    db: Arc<dyn Database>,
    cache: Cache<K, V>,
    capacity: usize,
}

impl<K: StoreKey, V> Clone for CachedStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            prefix: self.prefix.clone(),
            db: self.db.clone(),
            cache: self.cache.clone(),
            capacity: self.capacity,
        }
    }
}

struct StoreShard<K: StoreKey, V> {
    prefix: Vec<u8>,
    to_add: HashMap<K, Arc<V>>,
    to_delete: HashSet<K>,
    cache: Cache<K, V>,
    capacity: usize,
}

impl<K: StoreKey, V: Encode + Send + Sync + 'static> StagingShard for StoreShard<K, V> {
    fn commit(&self, batch: &mut WriteBatch) -> Result<()> {
        for key in &self.to_delete {
            batch.delete([self.prefix.as_slice(), &key.to_key_bytes()].concat());
        }
        for (key, value) in &self.to_add {
            batch.put([self.prefix.as_slice(), &key.to_key_bytes()].concat(), value.encode());
        }
        Ok(())
    }

    fn post_commit(&self) {
        let mut cache = self.cache.write();
        for key in &self.to_delete {
            cache.remove(key);
        }
        if self.capacity == 0 {
            return;
        }
        for (key, value) in &self.to_add {
            if cache.len() >= self.capacity && !cache.contains_key(key) {
                if let Some(evicted) = cache.keys().next().cloned() {
                    cache.remove(&evicted);
                }
            }
            cache.insert(key.clone(), value.clone());
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<K: StoreKey, V: Encode + Decode + Send + Sync + 'static> CachedStore<K, V> {
    pub fn new(name: &'static str, db: Arc<dyn Database>, capacity: usize) -> Self {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(b'/');
        Self { name, prefix, db, cache: Arc::new(RwLock::new(HashMap::new())), capacity }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn db_key(&self, key: &K) -> Vec<u8> {
        [self.prefix.as_slice(), &key.to_key_bytes()].concat()
    }

    fn staged<'a>(&self, area: &'a StagingArea) -> Result<Option<&'a StoreShard<K, V>>> {
        area.shard::<StoreShard<K, V>>(&self.prefix)
    }

    fn staged_mut<'a>(&self, area: &'a mut StagingArea) -> Result<&'a mut StoreShard<K, V>> {
        let prefix = self.prefix.clone();
        let cache = self.cache.clone();
        let capacity = self.capacity;
        area.shard_mut(&self.prefix, move || StoreShard {
            prefix,
            to_add: HashMap::new(),
            to_delete: HashSet::new(),
            cache,
            capacity,
        })
    }

    pub fn try_get(&self, area: &StagingArea, key: &K) -> Result<Option<Arc<V>>> {
        if let Some(shard) = self.staged(area)? {
            if let Some(value) = shard.to_add.get(key) {
                return Ok(Some(value.clone()));
            }
            if shard.to_delete.contains(key) {
                return Ok(None);
            }
        }
        if let Some(value) = self.cache.read().get(key) {
            return Ok(Some(value.clone()));
        }
        match self.db.get(&self.db_key(key))? {
            None => Ok(None),
            Some(bytes) => {
                let value = Arc::new(V::decode(&bytes)?);
                if self.capacity > 0 {
                    let mut cache = self.cache.write();
                    if cache.len() < self.capacity {
                        cache.insert(key.clone(), value.clone());
                    }
                }
                Ok(Some(value))
            }
        }
    }

    pub fn get(&self, area: &StagingArea, key: &K) -> Result<Arc<V>> {
        self.try_get(area, key)?
            .ok_or_else(|| ConsensusError::NotFound(format!("{} entry for {:?}", self.name, key)))
    }

    pub fn has(&self, area: &StagingArea, key: &K) -> Result<bool> {
        if let Some(shard) = self.staged(area)? {
            if shard.to_add.contains_key(key) {
                return Ok(true);
            }
            if shard.to_delete.contains(key) {
                return Ok(false);
            }
        }
        if self.cache.read().contains_key(key) {
            return Ok(true);
        }
        self.db.has(&self.db_key(key))
    }

    pub fn stage(&self, area: &mut StagingArea, key: K, value: V) -> Result<()> {
        let shard = self.staged_mut(area)?;
        shard.to_delete.remove(&key);
        shard.to_add.insert(key, Arc::new(value));
        Ok(())
    }

    pub fn delete(&self, area: &mut StagingArea, key: K) -> Result<()> {
        let shard = self.staged_mut(area)?;
        shard.to_add.remove(&key);
        shard.to_delete.insert(key);
        Ok(())
    }

    /// Number of committed entries in the bucket
    pub fn count(&self) -> Result<usize> {
        self.db.count(&self.prefix)
    }
}

pub type BlockStore = CachedStore<Hash, Block>;
pub type HeaderStore = CachedStore<Hash, BlockHeader>;
pub type StatusStore = CachedStore<Hash, BlockStatus>;
pub type RelationsStore = CachedStore<Hash, BlockRelations>;
pub type GhostdagStore = CachedStore<Hash, GhostdagData>;
pub type ReachabilityStore = CachedStore<Hash, ReachabilityData>;
pub type UtxoDiffStore = CachedStore<Hash, UtxoDiff>;
pub type UtxoDiffChildStore = CachedStore<Hash, Hash>;
pub type AcceptanceDataStore = CachedStore<Hash, AcceptanceData>;
pub type MultisetStore<M> = CachedStore<Hash, M>;
pub type HashListStore = CachedStore<(), Vec<Hash>>;
pub type HashStore = CachedStore<(), Hash>;

/// Every store of the engine. Cloning shares the underlying caches.
#[derive(Clone)]
pub struct Stores<M: Multiset> {
    pub blocks: BlockStore,
    pub headers: HeaderStore,
    pub statuses: StatusStore,
    pub relations: RelationsStore,
    pub ghostdag: GhostdagStore,
    pub reachability: ReachabilityStore,
    pub utxo_diffs: UtxoDiffStore,
    pub utxo_diff_children: UtxoDiffChildStore,
    pub acceptance_data: AcceptanceDataStore,
    pub multisets: MultisetStore<M>,
    pub tips: HashListStore,
    pub virtual_diff_parents: HashListStore,
    pub virtual_utxo_set: UtxoSetStore,
    pub headers_selected_tip: HashStore,
    pub reindex_root: HashStore,
    pub pruning: PruningStore<M>,
}

impl<M: Multiset> Stores<M> {
    pub fn new(db: Arc<dyn Database>, cache_size: usize) -> Self {
        Self {
            blocks: CachedStore::new("block", db.clone(), cache_size / 10),
            headers: CachedStore::new("block-header", db.clone(), cache_size),
            statuses: CachedStore::new("block-status", db.clone(), cache_size),
            relations: CachedStore::new("block-relations", db.clone(), cache_size),
            ghostdag: CachedStore::new("ghostdag-data", db.clone(), cache_size),
            reachability: CachedStore::new("reachability-data", db.clone(), cache_size),
            utxo_diffs: CachedStore::new("utxo-diff", db.clone(), cache_size / 10),
            utxo_diff_children: CachedStore::new("utxo-diff-child", db.clone(), cache_size),
            acceptance_data: CachedStore::new("acceptance-data", db.clone(), cache_size / 10),
            multisets: CachedStore::new("multiset", db.clone(), cache_size / 10),
            tips: CachedStore::new("tips", db.clone(), 1),
            virtual_diff_parents: CachedStore::new("virtual-diff-parents", db.clone(), 1),
            virtual_utxo_set: UtxoSetStore::new("virtual-utxo-set", db.clone()),
            headers_selected_tip: CachedStore::new("headers-selected-tip", db.clone(), 1),
            reindex_root: CachedStore::new("reachability-reindex-root", db.clone(), 1),
            pruning: PruningStore::new(db),
        }
    }

    /// Whether the block has a header (the block is known)
    pub fn has_block(&self, area: &StagingArea, hash: &Hash) -> Result<bool> {
        self.statuses.has(area, hash)
    }

    pub fn status(&self, area: &StagingArea, hash: &Hash) -> Result<BlockStatus> {
        Ok(*self.statuses.get(area, hash)?)
    }

    pub fn tips(&self, area: &StagingArea) -> Result<Vec<Hash>> {
        Ok(self.tips.try_get(area, &())?.map(|tips| tips.as_ref().clone()).unwrap_or_default())
    }

    pub fn virtual_diff_parents(&self, area: &StagingArea) -> Result<Vec<Hash>> {
        Ok(self.virtual_diff_parents.try_get(area, &())?.map(|p| p.as_ref().clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;

    fn store(capacity: usize) -> (Arc<MemoryDatabase>, CachedStore<Hash, u64>) {
        let db = Arc::new(MemoryDatabase::new());
        let store = CachedStore::new("numbers", db.clone(), capacity);
        (db, store)
    }

    #[test]
    fn test_reads_see_staged_writes_before_commit() {
        let (db, store) = store(10);
        let key = Hash::from_u64_word(1);
        let mut area = StagingArea::new();
        store.stage(&mut area, key, 5).unwrap();
        assert_eq!(*store.get(&area, &key).unwrap(), 5);
        assert!(store.try_get(&StagingArea::new(), &key).unwrap().is_none());
        area.commit(db.as_ref()).unwrap();
        assert_eq!(*store.get(&StagingArea::new(), &key).unwrap(), 5);
    }

    #[test]
    fn test_discarded_area_leaves_store_untouched() {
        let (db, store) = store(10);
        let key = Hash::from_u64_word(1);
        let mut area = StagingArea::new();
        store.stage(&mut area, key, 5).unwrap();
        drop(area);
        assert!(db.is_empty());
        assert!(!store.has(&StagingArea::new(), &key).unwrap());
    }

    #[test]
    fn test_delete_hides_committed_value() {
        let (db, store) = store(10);
        let key = Hash::from_u64_word(2);
        let mut area = StagingArea::new();
        store.stage(&mut area, key, 9).unwrap();
        area.commit(db.as_ref()).unwrap();

        let mut area = StagingArea::new();
        store.delete(&mut area, key).unwrap();
        assert!(!store.has(&area, &key).unwrap());
        assert!(store.has(&StagingArea::new(), &key).unwrap());
        area.commit(db.as_ref()).unwrap();
        assert!(store.get(&StagingArea::new(), &key).unwrap_err().is_not_found());
    }

    #[test]
    fn test_uncached_store_reads_from_database() {
        let (db, store) = store(0);
        let key = Hash::from_u64_word(3);
        let mut area = StagingArea::new();
        store.stage(&mut area, key, 1).unwrap();
        area.commit(db.as_ref()).unwrap();
        assert_eq!(*store.get(&StagingArea::new(), &key).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_corrupted_value_is_not_not_found() {
        let (db, store) = store(0);
        let key = Hash::from_u64_word(4);
        let mut batch = WriteBatch::new();
        batch.put([store.prefix(), key.as_bytes().as_slice()].concat(), vec![1, 2]);
        db.write(batch).unwrap();
        let err = store.get(&StagingArea::new(), &key).unwrap_err();
        assert!(matches!(err, ConsensusError::Deserialization(_)));
    }

    #[test]
    fn test_u64_keys_sort_numerically() {
        assert!(1u64.to_key_bytes() < 256u64.to_key_bytes());
        assert_eq!(u64::from_key_bytes(&300u64.to_key_bytes()).unwrap(), 300);
    }
}
