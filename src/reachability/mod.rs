//! Reachability index
//!
//! Every known block is a node of a tree rooted at the virtual genesis. A
//! block's tree parent is its selected parent and every node owns an interval
//! containing the intervals of its whole subtree, so chain ancestry is a
//! containment test. DAG edges that are not tree edges are covered by each
//! node's future covering set: an ordered list of DAG descendants outside its
//! subtree, searched by interval.
//!
//! Intervals are allocated by halving the remaining capacity of the parent.
//! When a parent runs out, a reindex reallocates space around the reindex
//! root, which follows the selected tip at a fixed depth.

pub mod interval;
mod reindex;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::constants::VIRTUAL_GENESIS_BLOCK_HASH;
use crate::error::{ConsensusError, Result};
use crate::staging::StagingArea;
use crate::stores::{HashStore, ReachabilityStore};
use crate::types::{Hash, ReachabilityData};

pub use interval::Interval;
use reindex::ReindexContext;

/// Counters describing how much reindexing work was done
#[derive(Debug, Default)]
pub struct ReindexStats {
    reindexes: AtomicU64,
    reallocations: AtomicU64,
}

impl ReindexStats {
    /// Number of reindex operations (capacity overflows plus reindex-root moves)
    pub fn reindexes(&self) -> u64 {
        self.reindexes.load(Ordering::Relaxed)
    }

    /// Number of intervals rewritten by reindex operations
    pub fn reallocations(&self) -> u64 {
        self.reallocations.load(Ordering::Relaxed)
    }
}

enum SearchOutput {
    Found(Hash, usize),
    NotFound(usize),
}

#[derive(Clone)]
pub struct ReachabilityManager {
    store: ReachabilityStore,
    reindex_root: HashStore,
    reindex_depth: u64,
    reindex_slack: u64,
    stats: Arc<ReindexStats>,
}

impl ReachabilityManager {
    pub fn new(store: ReachabilityStore, reindex_root: HashStore, reindex_depth: u64, reindex_slack: u64) -> Self {
        Self { store, reindex_root, reindex_depth, reindex_slack, stats: Arc::new(ReindexStats::default()) }
    }

    pub fn stats(&self) -> &ReindexStats {
        &self.stats
    }

    /// Creates the tree root if it does not exist yet
    pub fn init(&self, area: &mut StagingArea) -> Result<()> {
        if self.store.has(area, &VIRTUAL_GENESIS_BLOCK_HASH)? {
            return Ok(());
        }
        self.store.stage(area, VIRTUAL_GENESIS_BLOCK_HASH, ReachabilityData::new(None, Interval::maximal(), 0))?;
        self.reindex_root.stage(area, (), VIRTUAL_GENESIS_BLOCK_HASH)
    }

    pub fn has(&self, area: &StagingArea, block: &Hash) -> Result<bool> {
        self.store.has(area, block)
    }

    pub fn data(&self, area: &StagingArea, block: &Hash) -> Result<Arc<ReachabilityData>> {
        self.store.get(area, block)
    }

    pub fn interval(&self, area: &StagingArea, block: Hash) -> Result<Interval> {
        Ok(self.data(area, &block)?.interval)
    }

    pub fn tree_parent(&self, area: &StagingArea, block: Hash) -> Result<Hash> {
        self.data(area, &block)?
            .parent
            .ok_or_else(|| ConsensusError::Invariant(format!("reachability root has no parent (queried {block})")))
    }

    pub fn children(&self, area: &StagingArea, block: Hash) -> Result<Vec<Hash>> {
        Ok(self.data(area, &block)?.children.clone())
    }

    pub fn height(&self, area: &StagingArea, block: Hash) -> Result<u64> {
        Ok(self.data(area, &block)?.height)
    }

    pub fn future_covering_set(&self, area: &StagingArea, block: Hash) -> Result<Vec<Hash>> {
        Ok(self.data(area, &block)?.future_covering_set.clone())
    }

    pub fn reindex_root(&self, area: &StagingArea) -> Result<Hash> {
        Ok(*self.reindex_root.get(area, &())?)
    }

    fn update(&self, area: &mut StagingArea, block: Hash, f: impl FnOnce(&mut ReachabilityData)) -> Result<()> {
        let mut data = self.data(area, &block)?.as_ref().clone();
        f(&mut data);
        self.store.stage(area, block, data)
    }

    fn set_interval(&self, area: &mut StagingArea, block: Hash, interval: Interval) -> Result<()> {
        self.update(area, block, |data| data.interval = interval)
    }

    /// Capacity available to children: the last unit of the interval belongs to the block itself
    fn children_capacity(&self, area: &StagingArea, block: Hash) -> Result<Interval> {
        Ok(self.interval(area, block)?.decrease_end(1))
    }

    fn remaining_before(&self, area: &StagingArea, block: Hash) -> Result<Interval> {
        let capacity = self.children_capacity(area, block)?;
        let data = self.data(area, &block)?;
        match data.children.first() {
            Some(first) => Ok(Interval::new(capacity.start, self.interval(area, *first)?.start - 1)),
            None => Ok(capacity),
        }
    }

    fn remaining_after(&self, area: &StagingArea, block: Hash) -> Result<Interval> {
        let capacity = self.children_capacity(area, block)?;
        let data = self.data(area, &block)?;
        match data.children.last() {
            Some(last) => Ok(Interval::new(self.interval(area, *last)?.end + 1, capacity.end)),
            None => Ok(capacity),
        }
    }

    /// Adds `block` as a tree child of `selected_parent` and registers it in the
    /// future covering sets of the rest of its merge set. `hint` is the current
    /// selected tip, used to move the reindex root.
    pub fn add_block(
        &self,
        area: &mut StagingArea,
        block: Hash,
        selected_parent: Hash,
        merge_set_without_selected_parent: &[Hash],
        hint: Option<Hash>,
    ) -> Result<()> {
        self.add_tree_block(area, block, selected_parent)?;
        for merged in merge_set_without_selected_parent {
            self.insert_to_future_covering_set(area, *merged, block)?;
        }
        if let Some(hint) = hint {
            self.try_advancing_reindex_root(area, hint)?;
        }
        Ok(())
    }

    fn add_tree_block(&self, area: &mut StagingArea, block: Hash, parent: Hash) -> Result<()> {
        let remaining = self.remaining_after(area, parent)?;
        let parent_height = self.height(area, parent)?;
        self.update(area, parent, |data| data.children.push(block))?;
        if remaining.is_empty() {
            // The empty interval sits right at the end of the parent's capacity
            self.store.stage(area, block, ReachabilityData::new(Some(parent), remaining, parent_height + 1))?;
            let reindex_root = self.reindex_root(area)?;
            trace!(%block, %parent, %reindex_root, "parent interval exhausted, reindexing");
            let mut ctx = ReindexContext::new(self, area);
            ctx.reindex_intervals(block, reindex_root)?;
            self.stats.reindexes.fetch_add(1, Ordering::Relaxed);
        } else {
            // Below the reindex root, new children are side branches; pack them
            // so the parent's slack lasts for many of them
            let reindex_root = self.reindex_root(area)?;
            let allocated = if self.is_strict_chain_ancestor_of(area, parent, reindex_root)? {
                Interval::new(remaining.start, remaining.start)
            } else {
                remaining.split_half().0
            };
            self.store.stage(area, block, ReachabilityData::new(Some(parent), allocated, parent_height + 1))?;
        }
        Ok(())
    }

    fn insert_to_future_covering_set(&self, area: &mut StagingArea, merged: Hash, block: Hash) -> Result<()> {
        let fcs = self.future_covering_set(area, merged)?;
        match self.binary_search_descendant(area, &fcs, block)? {
            SearchOutput::Found(existing, _) => Err(ConsensusError::Invariant(format!(
                "future covering set of {merged} already covers {block} through {existing}"
            ))),
            SearchOutput::NotFound(index) => self.update(area, merged, |data| data.future_covering_set.insert(index, block)),
        }
    }

    /// Whether `this` is `queried` or a tree ancestor of it
    pub fn is_chain_ancestor_of(&self, area: &StagingArea, this: Hash, queried: Hash) -> Result<bool> {
        Ok(self.interval(area, this)?.contains(self.interval(area, queried)?))
    }

    pub fn is_strict_chain_ancestor_of(&self, area: &StagingArea, this: Hash, queried: Hash) -> Result<bool> {
        Ok(self.interval(area, this)?.strictly_contains(self.interval(area, queried)?))
    }

    /// Whether `this` is in the past of `queried` (or equal to it)
    pub fn is_dag_ancestor_of(&self, area: &StagingArea, this: Hash, queried: Hash) -> Result<bool> {
        if self.is_chain_ancestor_of(area, this, queried)? {
            return Ok(true);
        }
        let fcs = self.future_covering_set(area, this)?;
        Ok(matches!(self.binary_search_descendant(area, &fcs, queried)?, SearchOutput::Found(..)))
    }

    /// Whether `this` is a DAG ancestor of any block in `queried`
    pub fn is_dag_ancestor_of_any(&self, area: &StagingArea, this: Hash, queried: &[Hash]) -> Result<bool> {
        for block in queried {
            if self.is_dag_ancestor_of(area, this, *block)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Searches an interval-ordered list for a tree ancestor of `descendant`
    fn binary_search_descendant(&self, area: &StagingArea, ordered: &[Hash], descendant: Hash) -> Result<SearchOutput> {
        // The end of an interval is the unique point allocated to the block itself
        let point = self.interval(area, descendant)?.end;
        let (mut low, mut high) = (0usize, ordered.len());
        while low < high {
            let mid = low + (high - low) / 2;
            let start = self.interval(area, ordered[mid])?.start;
            if start == point {
                return Ok(SearchOutput::Found(ordered[mid], mid));
            }
            if start < point {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        // Only the element right before the insertion point can contain `point`
        if low > 0 && self.is_chain_ancestor_of(area, ordered[low - 1], descendant)? {
            return Ok(SearchOutput::Found(ordered[low - 1], low - 1));
        }
        Ok(SearchOutput::NotFound(low))
    }

    /// The child of `ancestor` on the tree path down to `descendant`
    pub fn next_chain_ancestor(&self, area: &StagingArea, descendant: Hash, ancestor: Hash) -> Result<Hash> {
        if descendant == ancestor || !self.is_strict_chain_ancestor_of(area, ancestor, descendant)? {
            return Err(ConsensusError::Invariant(format!("{ancestor} is not a strict tree ancestor of {descendant}")));
        }
        self.next_chain_ancestor_unchecked(area, descendant, ancestor)
    }

    fn next_chain_ancestor_unchecked(&self, area: &StagingArea, descendant: Hash, ancestor: Hash) -> Result<Hash> {
        let children = self.children(area, ancestor)?;
        match self.binary_search_descendant(area, &children, descendant)? {
            SearchOutput::Found(child, _) => Ok(child),
            SearchOutput::NotFound(_) => {
                Err(ConsensusError::Invariant(format!("no child of {ancestor} leads to {descendant}")))
            }
        }
    }

    fn find_common_tree_ancestor(&self, area: &StagingArea, block: Hash, other: Hash) -> Result<Hash> {
        let mut current = block;
        loop {
            if self.is_chain_ancestor_of(area, current, other)? {
                return Ok(current);
            }
            current = self.tree_parent(area, current)?;
        }
    }

    /// Moves the reindex root down toward `hint`, keeping it `reindex_depth` below it
    pub fn try_advancing_reindex_root(&self, area: &mut StagingArea, hint: Hash) -> Result<()> {
        let current = self.reindex_root(area)?;
        let (mut ancestor, next) = self.find_next_reindex_root(area, current, hint)?;
        if current == next {
            return Ok(());
        }
        while ancestor != next {
            let child = self.next_chain_ancestor_unchecked(area, next, ancestor)?;
            let mut ctx = ReindexContext::new(self, area);
            ctx.concentrate_interval(ancestor, child, child == next)?;
            ancestor = child;
        }
        self.stats.reindexes.fetch_add(1, Ordering::Relaxed);
        trace!(from = %current, to = %next, "moved reindex root");
        self.reindex_root.stage(area, (), next)
    }

    fn find_next_reindex_root(&self, area: &StagingArea, current: Hash, hint: Hash) -> Result<(Hash, Hash)> {
        let mut ancestor = current;
        let mut next = current;
        let hint_height = self.height(area, hint)?;

        if !self.is_chain_ancestor_of(area, current, hint)? {
            let current_height = self.height(area, current)?;
            // Switch chains only after a large enough height lead, so that
            // alternating reorgs cannot make the root thrash
            if hint_height < current_height || hint_height - current_height < self.reindex_slack {
                return Ok((current, current));
            }
            let common = self.find_common_tree_ancestor(area, hint, current)?;
            debug!(%current, %hint, %common, "reindex root left the selected chain");
            ancestor = common;
            next = common;
        }

        while next != hint {
            let child = self.next_chain_ancestor_unchecked(area, hint, next)?;
            let child_height = self.height(area, child)?;
            if hint_height < child_height {
                return Err(ConsensusError::Invariant(format!("tree child {child} is higher than the tip {hint}")));
            }
            if hint_height - child_height < self.reindex_depth {
                break;
            }
            next = child;
        }
        Ok((ancestor, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, MemoryDatabase};
    use crate::stores::CachedStore;

    struct TestTree {
        db: Arc<dyn Database>,
        manager: ReachabilityManager,
    }

    impl TestTree {
        fn new(depth: u64, slack: u64) -> Self {
            let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
            let manager = ReachabilityManager::new(
                CachedStore::new("reachability-data", db.clone(), 100_000),
                CachedStore::new("reachability-reindex-root", db.clone(), 1),
                depth,
                slack,
            );
            let mut area = StagingArea::new();
            manager.init(&mut area).unwrap();
            area.commit(db.as_ref()).unwrap();
            Self { db, manager }
        }

        fn add(&self, block: u64, selected_parent: Hash, merged: &[u64], hint: Option<u64>) -> Hash {
            let hash = Hash::from_u64_word(block);
            let merged: Vec<Hash> = merged.iter().map(|m| Hash::from_u64_word(*m)).collect();
            let mut area = StagingArea::new();
            self.manager
                .add_block(&mut area, hash, selected_parent, &merged, Some(hint.map(Hash::from_u64_word).unwrap_or(hash)))
                .unwrap();
            area.commit(self.db.as_ref()).unwrap();
            hash
        }

        fn is_ancestor(&self, a: u64, b: u64) -> bool {
            self.manager
                .is_dag_ancestor_of(&StagingArea::new(), Hash::from_u64_word(a), Hash::from_u64_word(b))
                .unwrap()
        }

        fn assert_tree_consistent(&self, blocks: &[u64]) {
            let area = StagingArea::new();
            for block in blocks {
                let hash = Hash::from_u64_word(*block);
                let data = self.manager.data(&area, &hash).unwrap();
                let parent = data.parent.unwrap();
                let parent_interval = self.manager.interval(&area, parent).unwrap();
                assert!(parent_interval.strictly_contains(data.interval), "block {block} escapes its parent");
                for pair in self.manager.children(&area, hash).unwrap().windows(2) {
                    let left = self.manager.interval(&area, pair[0]).unwrap();
                    let right = self.manager.interval(&area, pair[1]).unwrap();
                    assert!(left.end < right.start, "children of {block} overlap");
                }
            }
        }
    }

    #[test]
    fn test_chain_ancestry_survives_reindexing() {
        // Tiny depth and slack force both reindex paths
        let tree = TestTree::new(4, 8);
        let mut parent = VIRTUAL_GENESIS_BLOCK_HASH;
        for i in 1..=300u64 {
            parent = tree.add(i, parent, &[], None);
        }
        assert!(tree.manager.stats().reindexes() > 0);
        let blocks: Vec<u64> = (1..=300).collect();
        tree.assert_tree_consistent(&blocks);
        for a in (1..=300).step_by(13) {
            for b in (1..=300).step_by(7) {
                assert_eq!(tree.is_ancestor(a, b), a <= b, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn test_future_covering_set_answers_dag_queries() {
        //   1
        //  / \
        // 2   3
        //  \ /
        //   4   (selected parent 2, merges 3)
        //   |
        //   5
        let tree = TestTree::new(100, 4096);
        let g = tree.add(1, VIRTUAL_GENESIS_BLOCK_HASH, &[], None);
        let two = tree.add(2, g, &[], None);
        tree.add(3, g, &[], Some(2));
        let four = tree.add(4, two, &[3], None);
        tree.add(5, four, &[], None);

        assert!(tree.is_ancestor(3, 4));
        assert!(tree.is_ancestor(3, 5));
        assert!(tree.is_ancestor(1, 5));
        assert!(!tree.is_ancestor(3, 2));
        assert!(!tree.is_ancestor(2, 3));
        assert!(!tree.is_ancestor(4, 3));
        assert!(!tree.is_ancestor(5, 4));
        assert!(tree.is_ancestor(4, 4));

        let area = StagingArea::new();
        assert_eq!(tree.manager.future_covering_set(&area, Hash::from_u64_word(3)).unwrap(), vec![four]);
        assert!(!tree.manager.is_chain_ancestor_of(&area, Hash::from_u64_word(3), four).unwrap());
    }

    #[test]
    fn test_many_siblings_force_reindex_below_root() {
        let tree = TestTree::new(8, 16);
        let mut parent = VIRTUAL_GENESIS_BLOCK_HASH;
        for i in 1..=100u64 {
            parent = tree.add(i, parent, &[], None);
        }
        // Fifty side branches off block 50, far below the reindex root
        let fork = Hash::from_u64_word(50);
        for i in 0..50u64 {
            tree.add(1_000 + i, fork, &[], Some(100));
        }
        let mut blocks: Vec<u64> = (1..=100).collect();
        blocks.extend(1_000..1_050);
        tree.assert_tree_consistent(&blocks);
        for i in 0..50u64 {
            let side = 1_000 + i;
            assert!(tree.is_ancestor(50, side));
            assert!(tree.is_ancestor(1, side));
            assert!(!tree.is_ancestor(51, side));
            assert!(!tree.is_ancestor(side, 100));
        }
    }

    #[test]
    fn test_reindex_root_follows_hint() {
        let tree = TestTree::new(10, 64);
        let mut parent = VIRTUAL_GENESIS_BLOCK_HASH;
        for i in 1..=50u64 {
            parent = tree.add(i, parent, &[], None);
        }
        let root = tree.manager.reindex_root(&StagingArea::new()).unwrap();
        let area = StagingArea::new();
        assert_eq!(tree.manager.height(&area, parent).unwrap() - tree.manager.height(&area, root).unwrap(), 10);
    }

    #[test]
    fn test_next_chain_ancestor() {
        let tree = TestTree::new(100, 4096);
        let g = tree.add(1, VIRTUAL_GENESIS_BLOCK_HASH, &[], None);
        let a = tree.add(2, g, &[], None);
        let b = tree.add(3, a, &[], None);
        let area = StagingArea::new();
        assert_eq!(tree.manager.next_chain_ancestor(&area, b, g).unwrap(), a);
        assert!(tree.manager.next_chain_ancestor(&area, g, b).is_err());
        assert!(tree.manager.next_chain_ancestor(&area, b, b).is_err());
    }
}
