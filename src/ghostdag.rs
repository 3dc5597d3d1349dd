//! GHOSTDAG ordering protocol
//!
//! For a new block (or the virtual) this picks the selected parent, builds
//! the merge set and colors it blue or red so that no blue block ever has
//! more than K blues in its anticone.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::dag_topology::DagTopologyManager;
use crate::error::{ConsensusError, Result};
use crate::pow::calc_work;
use crate::staging::StagingArea;
use crate::stores::{GhostdagStore, HeaderStore};
use crate::types::{BlueWork, GhostdagData, Hash, KType};

enum ColoringOutput {
    Blue(KType, BTreeMap<Hash, KType>),
    Red,
}

enum ColoringState {
    Blue,
    Red,
    Pending,
}

/// A step of the candidate check: the block being colored has no hash yet
struct ChainBlock {
    hash: Option<Hash>,
    data: Arc<GhostdagData>,
}

#[derive(Clone)]
pub struct GhostdagManager {
    k: KType,
    genesis_hash: Hash,
    store: GhostdagStore,
    headers: HeaderStore,
    topology: DagTopologyManager,
}

impl GhostdagManager {
    pub fn new(k: KType, genesis_hash: Hash, store: GhostdagStore, headers: HeaderStore, topology: DagTopologyManager) -> Self {
        Self { k, genesis_hash, store, headers, topology }
    }

    pub fn k(&self) -> KType {
        self.k
    }

    pub fn genesis_ghostdag_data(&self) -> GhostdagData {
        GhostdagData::genesis()
    }

    pub fn data(&self, area: &StagingArea, block: &Hash) -> Result<Arc<GhostdagData>> {
        self.store.get(area, block)
    }

    /// The heavier of two blocks by `(blue_work, blue_score, hash)`
    pub fn choose_selected_parent(&self, area: &StagingArea, a: Hash, b: Hash) -> Result<Hash> {
        let a_sortable = self.data(area, &a)?.to_sortable(a);
        let b_sortable = self.data(area, &b)?.to_sortable(b);
        Ok(if a_sortable > b_sortable { a } else { b })
    }

    pub fn find_selected_parent(&self, area: &StagingArea, parents: &[Hash]) -> Result<Hash> {
        let mut iter = parents.iter().copied();
        let first = iter.next().ok_or_else(|| ConsensusError::Invariant("no parents to select from".to_string()))?;
        iter.try_fold(first, |best, candidate| self.choose_selected_parent(area, best, candidate))
    }

    /// Runs GHOSTDAG over `parents`. Genesis gets the genesis data.
    pub fn ghostdag(&self, area: &StagingArea, parents: &[Hash]) -> Result<GhostdagData> {
        if parents.is_empty() {
            return Ok(self.genesis_ghostdag_data());
        }
        let selected_parent = self.find_selected_parent(area, parents)?;
        let mut new_block_data = GhostdagData::new_with_selected_parent(selected_parent);

        let merge_set = self.ordered_merge_set_without_selected_parent(area, selected_parent, parents)?;
        for candidate in merge_set {
            match self.check_blue_candidate(area, &new_block_data, candidate)? {
                ColoringOutput::Blue(anticone_size, blues_anticone_sizes) => {
                    new_block_data.add_blue(candidate, anticone_size, &blues_anticone_sizes);
                }
                ColoringOutput::Red => new_block_data.add_red(candidate),
            }
        }

        let selected_parent_data = self.data(area, &selected_parent)?;
        new_block_data.blue_score = selected_parent_data.blue_score + new_block_data.merge_set_blues.len() as u64;
        let mut blue_work: BlueWork = selected_parent_data.blue_work.clone();
        for blue in &new_block_data.merge_set_blues {
            blue_work += calc_work(self.headers.get(area, blue)?.bits);
        }
        new_block_data.blue_work = blue_work;
        Ok(new_block_data)
    }

    /// `past(parents) \ past(selected_parent)`, ascending by blue work, which is
    /// a topological order
    pub fn ordered_merge_set_without_selected_parent(
        &self,
        area: &StagingArea,
        selected_parent: Hash,
        parents: &[Hash],
    ) -> Result<Vec<Hash>> {
        let reachability = self.topology.reachability();
        let mut queue: VecDeque<Hash> = parents.iter().copied().filter(|p| *p != selected_parent).collect();
        let mut merge_set: HashSet<Hash> = queue.iter().copied().collect();
        let mut selected_parent_past: HashSet<Hash> = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !self.topology.has_relations(area, &current)? {
                continue;
            }
            for parent in self.topology.parents(area, &current)? {
                if merge_set.contains(&parent) || selected_parent_past.contains(&parent) {
                    continue;
                }
                if reachability.is_dag_ancestor_of(area, parent, selected_parent)? {
                    selected_parent_past.insert(parent);
                    continue;
                }
                merge_set.insert(parent);
                queue.push_back(parent);
            }
        }
        self.sort_blocks(area, merge_set)
    }

    /// Sorts ascending by `(blue_work, blue_score, hash)`
    pub fn sort_blocks(&self, area: &StagingArea, blocks: impl IntoIterator<Item = Hash>) -> Result<Vec<Hash>> {
        let mut sortable = blocks
            .into_iter()
            .map(|block| Ok(self.data(area, &block)?.to_sortable(block)))
            .collect::<Result<Vec<_>>>()?;
        sortable.sort();
        Ok(sortable.into_iter().map(|block| block.hash).collect())
    }

    fn check_blue_candidate(
        &self,
        area: &StagingArea,
        new_block_data: &GhostdagData,
        candidate: Hash,
    ) -> Result<ColoringOutput> {
        // The selected parent plus K blues: the blue set of the merge set is full
        if new_block_data.merge_set_blues.len() as u64 == self.k as u64 + 1 {
            return Ok(ColoringOutput::Red);
        }
        let mut candidate_blues_anticone_sizes: BTreeMap<Hash, KType> = BTreeMap::new();
        let mut candidate_blue_anticone_size: KType = 0;
        let mut chain_block = ChainBlock { hash: None, data: Arc::new(new_block_data.clone()) };

        loop {
            let state = self.check_blue_candidate_with_chain_block(
                area,
                new_block_data,
                &chain_block,
                candidate,
                &mut candidate_blues_anticone_sizes,
                &mut candidate_blue_anticone_size,
            )?;
            match state {
                ColoringState::Blue => {
                    return Ok(ColoringOutput::Blue(candidate_blue_anticone_size, candidate_blues_anticone_sizes))
                }
                ColoringState::Red => return Ok(ColoringOutput::Red),
                ColoringState::Pending => {}
            }
            let selected_parent = chain_block.data.selected_parent.ok_or_else(|| {
                ConsensusError::Invariant(format!("walked past genesis while coloring {candidate}"))
            })?;
            chain_block = ChainBlock { hash: Some(selected_parent), data: self.data(area, &selected_parent)? };
        }
    }

    fn check_blue_candidate_with_chain_block(
        &self,
        area: &StagingArea,
        new_block_data: &GhostdagData,
        chain_block: &ChainBlock,
        candidate: Hash,
        candidate_blues_anticone_sizes: &mut BTreeMap<Hash, KType>,
        candidate_blue_anticone_size: &mut KType,
    ) -> Result<ColoringState> {
        if let Some(hash) = chain_block.hash {
            // Every blue below this chain block is in the candidate's past
            if self.is_in_past_of(area, hash, candidate)? {
                return Ok(ColoringState::Blue);
            }
        }
        for blue in &chain_block.data.merge_set_blues {
            if self.is_in_past_of(area, *blue, candidate)? {
                continue;
            }
            let blue_anticone_size = self.blue_anticone_size(area, *blue, new_block_data)?;
            candidate_blues_anticone_sizes.insert(*blue, blue_anticone_size);
            *candidate_blue_anticone_size += 1;
            if *candidate_blue_anticone_size > self.k {
                return Ok(ColoringState::Red);
            }
            if blue_anticone_size == self.k {
                return Ok(ColoringState::Red);
            }
        }
        Ok(ColoringState::Pending)
    }

    /// Blocks known only through trusted GHOSTDAG data lie below the pruning
    /// point and so in the past of anything still being colored
    fn is_in_past_of(&self, area: &StagingArea, block: Hash, candidate: Hash) -> Result<bool> {
        let reachability = self.topology.reachability();
        if !reachability.has(area, &block)? {
            return Ok(true);
        }
        reachability.is_dag_ancestor_of(area, block, candidate)
    }

    /// Size of the blue anticone of `block` as seen from the blue set of `context`
    fn blue_anticone_size(&self, area: &StagingArea, block: Hash, context: &GhostdagData) -> Result<KType> {
        if let Some(size) = context.blues_anticone_sizes.get(&block) {
            return Ok(*size);
        }
        let mut current = context.selected_parent;
        while let Some(hash) = current {
            let data = self.data(area, &hash)?;
            if let Some(size) = data.blues_anticone_sizes.get(&block) {
                return Ok(*size);
            }
            current = data.selected_parent;
        }
        Err(ConsensusError::Invariant(format!("{block} is not in the blue set of the given context")))
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::VIRTUAL_GENESIS_BLOCK_HASH;
    use crate::database::{Database, MemoryDatabase};
    use crate::reachability::ReachabilityManager;
    use crate::stores::CachedStore;
    use crate::types::BlockHeader;

    struct TestDag {
        db: Arc<dyn Database>,
        manager: GhostdagManager,
        topology: DagTopologyManager,
        headers: HeaderStore,
    }

    fn header(bits: u32, nonce: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            parents: vec![],
            hash_merkle_root: Hash::default(),
            accepted_id_merkle_root: Hash::default(),
            utxo_commitment: Hash::default(),
            timestamp: 0,
            bits,
            nonce,
            daa_score: 0,
            blue_score: 0,
            blue_work: BlueWork::default(),
            pruning_point: Hash::default(),
        }
    }

    impl TestDag {
        fn new(k: KType) -> Self {
            let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
            let reachability = ReachabilityManager::new(
                CachedStore::new("reachability-data", db.clone(), 1000),
                CachedStore::new("reachability-reindex-root", db.clone(), 1),
                100,
                4096,
            );
            let topology = DagTopologyManager::new(CachedStore::new("block-relations", db.clone(), 1000), reachability);
            let headers: HeaderStore = CachedStore::new("block-header", db.clone(), 1000);
            let manager = GhostdagManager::new(
                k,
                Hash::from_u64_word(0),
                CachedStore::new("ghostdag-data", db.clone(), 1000),
                headers.clone(),
                topology.clone(),
            );
            let dag = Self { db, manager, topology, headers };
            let mut area = StagingArea::new();
            dag.topology.reachability().init(&mut area).unwrap();
            area.commit(dag.db.as_ref()).unwrap();
            dag.add(0, &[]);
            dag
        }

        fn add(&self, block: u64, parents: &[u64]) -> GhostdagData {
            let hash = Hash::from_u64_word(block);
            let parents: Vec<Hash> = parents.iter().map(|p| Hash::from_u64_word(*p)).collect();
            let mut area = StagingArea::new();
            let data = self.manager.ghostdag(&area, &parents).unwrap();
            self.manager.store.stage(&mut area, hash, data.clone()).unwrap();
            self.headers.stage(&mut area, hash, header(0x207fffff, block)).unwrap();
            self.topology.set_parents(&mut area, hash, &parents).unwrap();
            let selected_parent = data.selected_parent.unwrap_or(VIRTUAL_GENESIS_BLOCK_HASH);
            let merged: Vec<Hash> = data.merge_set().skip(1).copied().collect();
            let merged = if data.selected_parent.is_some() { merged } else { Vec::new() };
            self.topology.reachability().add_block(&mut area, hash, selected_parent, &merged, None).unwrap();
            area.commit(self.db.as_ref()).unwrap();
            data
        }
    }

    #[test]
    fn test_merger_of_two_blocks() {
        let dag = TestDag::new(3);
        dag.add(1, &[0]);
        dag.add(2, &[0]);
        let merger = dag.add(3, &[1, 2]);
        // Equal work and score: the larger hash wins
        assert_eq!(merger.selected_parent, Some(Hash::from_u64_word(2)));
        assert_eq!(merger.merge_set_blues, vec![Hash::from_u64_word(2), Hash::from_u64_word(1)]);
        assert!(merger.merge_set_reds.is_empty());
        assert_eq!(merger.blue_score, 3);
        assert_eq!(merger.blue_work, BlueWork::from(6u8));
        assert_eq!(merger.blues_anticone_sizes[&Hash::from_u64_word(1)], 1);
    }

    #[test]
    fn test_wide_merge_set_is_capped_at_k_blues() {
        let k = 2;
        let dag = TestDag::new(k);
        let parents: Vec<u64> = (1..=5).collect();
        for p in &parents {
            dag.add(*p, &[0]);
        }
        let merger = dag.add(10, &parents);
        assert_eq!(merger.merge_set_blues.len(), k as usize + 1);
        assert_eq!(merger.merge_set_reds.len(), 5 - (k as usize + 1));
        assert_eq!(merger.blue_score, 1 + k as u64 + 1);
        for blue in merger.merge_set_blues.iter().skip(1) {
            assert!(merger.blues_anticone_sizes[blue] <= k);
        }
    }

    #[test]
    fn test_genesis_and_chain() {
        let dag = TestDag::new(3);
        let one = dag.add(1, &[0]);
        let two = dag.add(2, &[1]);
        assert_eq!(one.blue_score, 1);
        assert_eq!(two.blue_score, 2);
        assert_eq!(two.merge_set_blues, vec![Hash::from_u64_word(1)]);
        let area = StagingArea::new();
        assert_eq!(dag.manager.data(&area, &Hash::from_u64_word(0)).unwrap().blue_score, 0);
    }

    #[test]
    fn test_choose_selected_parent_prefers_blue_work() {
        let dag = TestDag::new(3);
        dag.add(1, &[0]);
        dag.add(2, &[1]);
        dag.add(3, &[0]);
        let area = StagingArea::new();
        let chosen = dag.manager.choose_selected_parent(&area, Hash::from_u64_word(2), Hash::from_u64_word(3)).unwrap();
        assert_eq!(chosen, Hash::from_u64_word(2));
    }
}
