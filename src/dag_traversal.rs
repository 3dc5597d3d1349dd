//! Traversal utilities over the block DAG
//!
//! Block heaps, anticone search, selected-chain walks and the blue window.
//! Everything here only reads through the given staging area.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet, VecDeque};

use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::dag_topology::DagTopologyManager;
use crate::error::{ConsensusError, Result};
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::{GhostdagStore, HeaderStore};
use crate::types::{BlueWork, GhostdagData, Hash, SelectedChainPath};

/// A block keyed by its GHOSTDAG weight: `(blue_work, blue_score, hash)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortableBlock {
    pub hash: Hash,
    pub blue_work: BlueWork,
    pub blue_score: u64,
}

impl SortableBlock {
    pub fn new(hash: Hash, blue_work: BlueWork, blue_score: u64) -> Self {
        Self { hash, blue_work, blue_score }
    }
}

impl Ord for SortableBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.blue_work
            .cmp(&other.blue_work)
            .then_with(|| self.blue_score.cmp(&other.blue_score))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for SortableBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pops the heaviest block first
#[derive(Debug, Default)]
pub struct DownHeap(BinaryHeap<SortableBlock>);

impl DownHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: SortableBlock) {
        self.0.push(block);
    }

    pub fn pop(&mut self) -> Option<SortableBlock> {
        self.0.pop()
    }

    pub fn peek(&self) -> Option<&SortableBlock> {
        self.0.peek()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pops the lightest block first
#[derive(Debug, Default)]
pub struct UpHeap(BinaryHeap<Reverse<SortableBlock>>);

impl UpHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: SortableBlock) {
        self.0.push(Reverse(block));
    }

    pub fn pop(&mut self) -> Option<SortableBlock> {
        self.0.pop().map(|Reverse(block)| block)
    }

    pub fn peek(&self) -> Option<&SortableBlock> {
        self.0.peek().map(|Reverse(block)| block)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub struct DagTraversalManager {
    genesis_hash: Hash,
    ghostdag: GhostdagStore,
    headers: HeaderStore,
    topology: DagTopologyManager,
}

impl DagTraversalManager {
    pub fn new(genesis_hash: Hash, ghostdag: GhostdagStore, headers: HeaderStore, topology: DagTopologyManager) -> Self {
        Self { genesis_hash, ghostdag, headers, topology }
    }

    fn reachability(&self) -> &ReachabilityManager {
        self.topology.reachability()
    }

    pub fn ghostdag_data(&self, area: &StagingArea, block: &Hash) -> Result<std::sync::Arc<GhostdagData>> {
        self.ghostdag.get(area, block)
    }

    pub fn sortable(&self, area: &StagingArea, block: Hash) -> Result<SortableBlock> {
        Ok(self.ghostdag_data(area, &block)?.to_sortable(block))
    }

    pub fn selected_parent(&self, area: &StagingArea, block: &Hash) -> Result<Option<Hash>> {
        Ok(self.ghostdag_data(area, block)?.selected_parent)
    }

    /// Blocks that are neither ancestors nor descendants of `block`, found by
    /// walking parents down from `tips`
    pub fn anticone(&self, area: &StagingArea, block: Hash, tips: &[Hash]) -> Result<Vec<Hash>> {
        let mut anticone = Vec::new();
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut queue: VecDeque<Hash> = tips.iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            // The whole past of an ancestor is in the past of `block` too
            if self.reachability().is_dag_ancestor_of(area, current, block)? {
                continue;
            }
            if !self.reachability().is_dag_ancestor_of(area, block, current)? {
                anticone.push(current);
            }
            for parent in self.topology.parents(area, &current)? {
                if !visited.contains(&parent) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(anticone)
    }

    /// The block `depth` steps down the selected parent chain of `high`, or
    /// the lowest chain block if the chain is shorter
    pub fn block_at_depth(&self, area: &StagingArea, high: Hash, depth: u64) -> Result<Hash> {
        let mut current = high;
        for _ in 0..depth {
            match self.selected_parent(area, &current)? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(current)
    }

    /// Iterates the selected chain of `high` upward, starting at `low`
    pub fn selected_child_iterator<'a>(
        &'a self,
        area: &'a StagingArea,
        low: Hash,
        high: Hash,
    ) -> Result<SelectedChildIterator<'a>> {
        if !self.reachability().is_chain_ancestor_of(area, low, high)? {
            return Err(ConsensusError::NotInSelectedChain(low, high));
        }
        Ok(SelectedChildIterator { reachability: self.reachability(), area, high, current: None, low })
    }

    /// Chain changes when the selected tip moves from `from` to `to`
    pub fn calculate_chain_path(&self, area: &StagingArea, from: Hash, to: Hash) -> Result<SelectedChainPath> {
        let mut removed = Vec::new();
        let mut current = from;
        while !self.reachability().is_chain_ancestor_of(area, current, to)? {
            removed.push(current);
            current = self
                .selected_parent(area, &current)?
                .ok_or_else(|| ConsensusError::Invariant(format!("{from} and {to} share no chain ancestor")))?;
        }
        let common = current;
        let mut added = Vec::new();
        let mut current = to;
        while current != common {
            added.push(current);
            current = self
                .selected_parent(area, &current)?
                .ok_or_else(|| ConsensusError::Invariant(format!("{common} is not on the chain of {to}")))?;
        }
        added.reverse();
        Ok(SelectedChainPath { removed, added })
    }

    /// The `size` heaviest blocks of the past of the block described by
    /// `high`, padded with genesis when the past is smaller
    pub fn blue_window(&self, area: &StagingArea, high: &GhostdagData, size: usize) -> Result<Vec<Hash>> {
        let mut window = Vec::with_capacity(size);
        let mut current = high.clone();
        'chain: while window.len() < size {
            let Some(selected_parent) = current.selected_parent else {
                break;
            };
            window.push(selected_parent);

            let mut blues = Vec::with_capacity(current.merge_set_blues.len());
            for blue in current.merge_set_blues.iter().skip(1) {
                blues.push(self.sortable(area, *blue)?);
            }
            let mut reds = Vec::with_capacity(current.merge_set_reds.len());
            for red in &current.merge_set_reds {
                reds.push(self.sortable(area, *red)?);
            }
            blues.sort_by(|a, b| b.cmp(a));
            reds.sort_by(|a, b| b.cmp(a));
            for block in blues.into_iter().chain(reds) {
                if window.len() >= size {
                    break 'chain;
                }
                window.push(block.hash);
            }
            current = self.ghostdag_data(area, &selected_parent)?.as_ref().clone();
        }
        window.truncate(size);
        while window.len() < size {
            window.push(self.genesis_hash);
        }
        Ok(window)
    }

    /// Median timestamp of the blue window of the block described by `data`
    pub fn past_median_time(&self, area: &StagingArea, data: &GhostdagData, window_size: usize) -> Result<i64> {
        if data.selected_parent.is_none() {
            return Ok(self.headers.get(area, &self.genesis_hash)?.timestamp);
        }
        let window = self.blue_window(area, data, window_size)?;
        let mut timestamps = Vec::with_capacity(window.len());
        for block in &window {
            timestamps.push(self.headers.get(area, block)?.timestamp);
        }
        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() / 2])
    }

    /// Lowest block on the selected chain of `high` whose blue score is at least `blue_score`
    pub fn lowest_chain_block_above_or_equal_to_blue_score(
        &self,
        area: &StagingArea,
        high: Hash,
        blue_score: u64,
    ) -> Result<Hash> {
        let mut current = high;
        let data = self.ghostdag_data(area, &high)?;
        if data.blue_score < blue_score {
            return Err(ConsensusError::Invariant(format!(
                "{high} has blue score {} below the requested {blue_score}",
                data.blue_score
            )));
        }
        let mut selected_parent = data.selected_parent;
        while let Some(parent) = selected_parent {
            if parent == VIRTUAL_BLOCK_HASH {
                break;
            }
            let parent_data = self.ghostdag_data(area, &parent)?;
            if parent_data.blue_score < blue_score {
                break;
            }
            current = parent;
            selected_parent = parent_data.selected_parent;
        }
        Ok(current)
    }
}

/// Steps from `low` up the selected chain until `high` (both inclusive)
pub struct SelectedChildIterator<'a> {
    reachability: &'a ReachabilityManager,
    area: &'a StagingArea,
    low: Hash,
    high: Hash,
    current: Option<Hash>,
}

impl Iterator for SelectedChildIterator<'_> {
    type Item = Result<Hash>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.current {
            None => Ok(self.low),
            Some(current) if current == self.high => return None,
            Some(current) => self.reachability.next_chain_ancestor(self.area, self.high, current),
        };
        match next {
            Ok(hash) => {
                self.current = Some(hash);
                Some(Ok(hash))
            }
            Err(err) => {
                // Stop after reporting the failure once
                self.current = Some(self.high);
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(word: u64, work: u32, score: u64) -> SortableBlock {
        SortableBlock::new(Hash::from_u64_word(word), BlueWork::from(work), score)
    }

    #[test]
    fn test_sortable_block_ordering() {
        assert!(block(1, 10, 0) > block(2, 9, 100));
        assert!(block(1, 10, 5) > block(2, 10, 4));
        assert!(block(2, 10, 5) > block(1, 10, 5));
    }

    #[test]
    fn test_heaps_pop_in_opposite_orders() {
        let mut down = DownHeap::new();
        let mut up = UpHeap::new();
        for b in [block(1, 5, 1), block(2, 7, 1), block(3, 6, 1)] {
            down.push(b.clone());
            up.push(b);
        }
        assert_eq!(down.len(), 3);
        assert_eq!(down.pop().unwrap().hash, Hash::from_u64_word(2));
        assert_eq!(down.peek().unwrap().hash, Hash::from_u64_word(3));
        assert_eq!(up.pop().unwrap().hash, Hash::from_u64_word(1));
        assert_eq!(up.pop().unwrap().hash, Hash::from_u64_word(3));
        assert_eq!(up.pop().unwrap().hash, Hash::from_u64_word(2));
        assert!(up.is_empty());
    }
}
