//! Pruning point, its index and the UTXO buckets that follow it

use std::sync::Arc;

use crate::database::Database;
use crate::error::Result;
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::stores::{CachedStore, HashStore, UtxoSetStore};
use crate::types::Hash;

#[derive(Clone)]
pub struct PruningStore<M: Multiset> {
    pub pruning_point: HashStore,
    pub by_index: CachedStore<u64, Hash>,
    /// Index of the latest pruning point
    pub last_index: CachedStore<(), u64>,
    pub candidate: HashStore,
    pub candidate_utxo_set: UtxoSetStore,
    pub candidate_multiset: CachedStore<(), M>,
    pub pruning_point_utxo_set: UtxoSetStore,
    pub imported_utxo_set: UtxoSetStore,
    pub imported_multiset: CachedStore<(), M>,
    pub updating_utxo_set: CachedStore<(), bool>,
}

impl<M: Multiset> PruningStore<M> {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            pruning_point: CachedStore::new("pruning-point-hash", db.clone(), 1),
            by_index: CachedStore::new("pruning-point-by-index", db.clone(), 64),
            last_index: CachedStore::new("pruning-point-index", db.clone(), 1),
            candidate: CachedStore::new("candidate-pruning-point-hash", db.clone(), 1),
            candidate_utxo_set: UtxoSetStore::new("candidate-pruning-point-utxos", db.clone()),
            candidate_multiset: CachedStore::new("candidate-pruning-point-multiset", db.clone(), 1),
            pruning_point_utxo_set: UtxoSetStore::new("pruning-point-utxo-set", db.clone()),
            imported_utxo_set: UtxoSetStore::new("imported-pruning-point-utxos", db.clone()),
            imported_multiset: CachedStore::new("imported-pruning-point-multiset", db.clone(), 1),
            updating_utxo_set: CachedStore::new("updating-pruning-point-utxo-set", db, 1),
        }
    }

    pub fn pruning_point(&self, area: &StagingArea) -> Result<Hash> {
        Ok(*self.pruning_point.get(area, &())?)
    }

    pub fn has_pruning_point(&self, area: &StagingArea) -> Result<bool> {
        self.pruning_point.has(area, &())
    }

    pub fn last_index(&self, area: &StagingArea) -> Result<u64> {
        Ok(*self.last_index.get(area, &())?)
    }

    pub fn pruning_point_by_index(&self, area: &StagingArea, index: u64) -> Result<Hash> {
        Ok(*self.by_index.get(area, &index)?)
    }

    /// Every pruning point from the first to the current one
    pub fn pruning_points(&self, area: &StagingArea) -> Result<Vec<Hash>> {
        if !self.last_index.has(area, &())? {
            return Ok(Vec::new());
        }
        (0..=self.last_index(area)?).map(|index| self.pruning_point_by_index(area, index)).collect()
    }

    /// Makes `hash` the current pruning point and appends it to the index
    pub fn append_pruning_point(&self, area: &mut StagingArea, hash: Hash) -> Result<u64> {
        let index = match self.last_index.try_get(area, &())? {
            Some(last) => *last + 1,
            None => 0,
        };
        self.by_index.stage(area, index, hash)?;
        self.last_index.stage(area, (), index)?;
        self.pruning_point.stage(area, (), hash)?;
        Ok(index)
    }

    pub fn candidate(&self, area: &StagingArea) -> Result<Hash> {
        Ok(*self.candidate.get(area, &())?)
    }

    pub fn candidate_multiset(&self, area: &StagingArea) -> Result<M> {
        Ok(self.candidate_multiset.get(area, &())?.as_ref().clone())
    }

    pub fn imported_multiset(&self, area: &StagingArea) -> Result<M> {
        Ok(self.imported_multiset.try_get(area, &())?.map(|m| m.as_ref().clone()).unwrap_or_else(M::empty))
    }

    pub fn is_updating_utxo_set(&self, area: &StagingArea) -> Result<bool> {
        Ok(self.updating_utxo_set.try_get(area, &())?.map(|flag| *flag).unwrap_or(false))
    }
}
