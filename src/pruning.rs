//! Finality, pruning point selection and pruning
//!
//! The pruning point advances in finality-depth steps along the virtual's
//! selected chain. A separate candidate follows the highest chain block that
//! is already `pruning_depth` deep so its UTXO set is at hand.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::constants::{VIRTUAL_BLOCK_HASH, ZERO_HASH};
use crate::consensus_state::restore_past_utxo;
use crate::dag_traversal::DagTraversalManager;
use crate::error::{ConsensusError, Result, RuleError};
use crate::multiset::Multiset;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::types::{BlockHeader, GhostdagData, Hash, Outpoint, UtxoEntry};

/// A pruning point promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruningPointMove {
    pub pruning_point: Hash,
    pub index: u64,
}

#[derive(Clone)]
pub struct PruningManager<M: Multiset> {
    config: Arc<Config>,
    stores: Stores<M>,
    reachability: ReachabilityManager,
    traversal: DagTraversalManager,
}

impl<M: Multiset> PruningManager<M> {
    pub fn new(
        config: Arc<Config>,
        stores: Stores<M>,
        reachability: ReachabilityManager,
        traversal: DagTraversalManager,
    ) -> Self {
        Self { config, stores, reachability, traversal }
    }

    pub fn pruning_point(&self, area: &StagingArea) -> Result<Hash> {
        self.stores.pruning.pruning_point(area)
    }

    /// Read from headers, which also exist for imported pruning points
    fn blue_score(&self, area: &StagingArea, block: &Hash) -> Result<u64> {
        Ok(self.stores.headers.get(area, block)?.blue_score)
    }

    /// The block `finality_depth` steps down the virtual's selected chain, or
    /// the pruning point when the walk would pass it. `None` before the
    /// virtual exists.
    pub fn finality_point(&self, area: &StagingArea) -> Result<Option<Hash>> {
        let Some(virtual_data) = self.stores.ghostdag.try_get(area, &VIRTUAL_BLOCK_HASH)? else {
            return Ok(None);
        };
        let Some(mut current) = virtual_data.selected_parent else {
            return Ok(None);
        };
        let pruning_point = self.stores.pruning.pruning_point.try_get(area, &())?.map(|pp| *pp);
        for _ in 0..self.config.finality_depth {
            if Some(current) == pruning_point {
                break;
            }
            match self.traversal.selected_parent(area, &current)? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(Some(current))
    }

    /// A block violates finality when the finality point is not on its selected chain
    pub fn is_violating_finality(&self, area: &StagingArea, block: Hash) -> Result<bool> {
        match self.finality_point(area)? {
            None => Ok(false),
            Some(finality_point) => Ok(!self.reachability.is_chain_ancestor_of(area, finality_point, block)?),
        }
    }

    /// Walks pruning points forward from `from` in finality-depth steps along the
    /// selected chain of `chain_tip`, keeping each step at least `pruning_depth`
    /// below `blue_score`
    fn advance_pruning_point(&self, area: &StagingArea, from: Hash, chain_tip: Hash, blue_score: u64) -> Result<Hash> {
        let finality_depth = self.config.finality_depth;
        let pruning_depth = self.config.pruning_depth;
        let tip_blue_score = self.blue_score(area, &chain_tip)?;
        let mut current = from;
        loop {
            let target = (self.blue_score(area, &current)? / finality_depth + 1) * finality_depth;
            if target + pruning_depth > blue_score || tip_blue_score < target {
                break;
            }
            let candidate = self.traversal.lowest_chain_block_above_or_equal_to_blue_score(area, chain_tip, target)?;
            if self.blue_score(area, &candidate)? + pruning_depth > blue_score {
                break;
            }
            current = candidate;
        }
        Ok(current)
    }

    /// The pruning point a header with `ghostdag_data` must commit to
    pub fn expected_header_pruning_point(&self, area: &StagingArea, ghostdag_data: &GhostdagData) -> Result<Hash> {
        let genesis = self.config.genesis_hash();
        let Some(selected_parent) = ghostdag_data.selected_parent else {
            return Ok(ZERO_HASH);
        };
        let from = match self.stores.headers.get(area, &selected_parent)?.pruning_point {
            pp if selected_parent == genesis || pp == ZERO_HASH => genesis,
            pp => pp,
        };
        self.advance_pruning_point(area, from, selected_parent, ghostdag_data.blue_score)
    }

    /// Moves the candidate and, when a finality step allows it, the pruning
    /// point itself, following the new virtual
    pub fn update_pruning_point_by_virtual(
        &self,
        area: &mut StagingArea,
        virtual_data: &GhostdagData,
    ) -> Result<Option<PruningPointMove>> {
        let Some(virtual_selected_parent) = virtual_data.selected_parent else {
            return Ok(None);
        };
        self.update_candidate(area, virtual_selected_parent, virtual_data.blue_score)?;

        let current = self.pruning_point(area)?;
        let next = self.advance_pruning_point(area, current, virtual_selected_parent, virtual_data.blue_score)?;
        if next == current {
            return Ok(None);
        }

        let old_past = restore_past_utxo(&self.stores, area, current)?;
        let new_past = restore_past_utxo(&self.stores, area, next)?;
        self.stores.pruning.pruning_point_utxo_set.stage_diff(area, &old_past.diff_from(&new_past)?)?;
        let index = self.stores.pruning.append_pruning_point(area, next)?;
        let pruned = self.prune_bodies(area, current, next)?;
        info!(pruning_point = %next, index, pruned, "pruning point moved");
        Ok(Some(PruningPointMove { pruning_point: next, index }))
    }

    fn update_candidate(&self, area: &mut StagingArea, virtual_selected_parent: Hash, virtual_blue_score: u64) -> Result<()> {
        let pruning_depth = self.config.pruning_depth;
        if virtual_blue_score < pruning_depth {
            return Ok(());
        }
        let max_blue_score = virtual_blue_score - pruning_depth;
        let current = self.stores.pruning.candidate(area)?;

        let mut next = current;
        if self.reachability.is_chain_ancestor_of(area, current, virtual_selected_parent)? {
            while next != virtual_selected_parent {
                let child = self.reachability.next_chain_ancestor(area, virtual_selected_parent, next)?;
                if self.blue_score(area, &child)? > max_blue_score {
                    break;
                }
                next = child;
            }
        } else {
            // The chain moved away from the candidate; search down from the tip
            let lowest_above =
                self.traversal.lowest_chain_block_above_or_equal_to_blue_score(area, virtual_selected_parent, max_blue_score)?;
            next = if self.blue_score(area, &lowest_above)? > max_blue_score {
                self.traversal.selected_parent(area, &lowest_above)?.unwrap_or(lowest_above)
            } else {
                lowest_above
            };
        }
        if next == current {
            return Ok(());
        }

        let old_past = restore_past_utxo(&self.stores, area, current)?;
        let new_past = restore_past_utxo(&self.stores, area, next)?;
        self.stores.pruning.candidate_utxo_set.stage_diff(area, &old_past.diff_from(&new_past)?)?;
        let multiset = self.stores.multisets.get(area, &next)?.as_ref().clone();
        self.stores.pruning.candidate_multiset.stage(area, (), multiset)?;
        self.stores.pruning.candidate.stage(area, (), next)?;
        debug!(from = %current, to = %next, "pruning point candidate moved");
        Ok(())
    }

    /// Deletes the bodies of blocks in the past of `new` that are not in its
    /// merge set. Everything at or below `old` was handled by the previous
    /// promotion except `old` and its merge set.
    fn prune_bodies(&self, area: &mut StagingArea, old: Hash, new: Hash) -> Result<usize> {
        let new_data = self.traversal.ghostdag_data(area, &new)?;
        let keep: HashSet<Hash> = new_data.merge_set().copied().collect();
        let old_data = self.traversal.ghostdag_data(area, &old)?;

        let mut pruned = 0;
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut queue: VecDeque<Hash> = self.stores.relations.get(area, &new)?.parents.iter().copied().collect();
        queue.push_back(old);
        queue.extend(old_data.merge_set().copied());
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if !keep.contains(&current) && self.stores.blocks.has(area, &current)? {
                self.stores.blocks.delete(area, current)?;
                pruned += 1;
            }
            if self.reachability.has(area, &current)? && self.reachability.is_dag_ancestor_of(area, current, old)? {
                continue;
            }
            if let Some(relations) = self.stores.relations.try_get(area, &current)? {
                queue.extend(relations.parents.iter().copied().filter(|parent| !visited.contains(parent)));
            }
        }
        Ok(pruned)
    }

    /// A valid pruning point lies on the headers selected chain at least
    /// `pruning_depth` below its tip
    pub fn is_valid_pruning_point(&self, area: &StagingArea, block: Hash) -> Result<bool> {
        if block == self.config.genesis_hash() {
            return Ok(true);
        }
        if !self.stores.has_block(area, &block)? {
            return Ok(false);
        }
        let headers_selected_tip = *self.stores.headers_selected_tip.get(area, &())?;
        if !self.reachability.is_chain_ancestor_of(area, block, headers_selected_tip)? {
            return Ok(false);
        }
        Ok(self.blue_score(area, &headers_selected_tip)? >= self.blue_score(area, &block)? + self.config.pruning_depth)
    }

    /// Pruning points that share no known block with the selected chain of
    /// the current finality point would rewrite final history
    pub fn are_pruning_points_violating_finality(&self, area: &StagingArea, pruning_points: &[Hash]) -> Result<bool> {
        let Some(finality_point) = self.finality_point(area)? else {
            return Ok(false);
        };
        for pruning_point in pruning_points.iter().rev() {
            if !self.reachability.has(area, pruning_point)? {
                continue;
            }
            if self.reachability.is_chain_ancestor_of(area, *pruning_point, finality_point)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Headers of every pruning point, oldest first
    pub fn pruning_point_headers(&self, area: &StagingArea) -> Result<Vec<BlockHeader>> {
        self.stores
            .pruning
            .pruning_points(area)?
            .iter()
            .map(|hash| Ok(self.stores.headers.get(area, hash)?.as_ref().clone()))
            .collect()
    }

    /// A page of the pruning point UTXO set. Fails if `expected` is no longer
    /// the pruning point.
    pub fn pruning_point_utxos(
        &self,
        area: &StagingArea,
        expected: Hash,
        from: Option<&Outpoint>,
        limit: usize,
    ) -> Result<Vec<(Outpoint, UtxoEntry)>> {
        let pruning_point = self.pruning_point(area)?;
        if pruning_point != expected {
            return Err(RuleError::WrongPruningPointHash(expected).into());
        }
        self.stores.pruning.pruning_point_utxo_set.entries(from, limit)
    }

    /// Validates an imported list of pruning point headers and makes it the index
    pub fn import_pruning_points(&self, area: &mut StagingArea, headers: &[BlockHeader]) -> Result<()> {
        let Some(last) = headers.last() else {
            return Err(ConsensusError::Invariant("no pruning points to import".to_string()));
        };
        for pair in headers.windows(2) {
            let expected = pair[0].hash();
            if pair[1].pruning_point != expected {
                return Err(RuleError::UnexpectedPruningPoint { expected, actual: pair[1].pruning_point }.into());
            }
        }
        let hashes: Vec<Hash> = headers.iter().map(BlockHeader::hash).collect();
        if self.are_pruning_points_violating_finality(area, &hashes)? {
            return Err(RuleError::SuggestedPruningViolatesFinality(last.hash()).into());
        }
        for (index, header) in headers.iter().enumerate() {
            let hash = hashes[index];
            if !self.stores.headers.has(area, &hash)? {
                self.stores.headers.stage(area, hash, header.clone())?;
            }
            self.stores.pruning.by_index.stage(area, index as u64, hash)?;
        }
        self.stores.pruning.last_index.stage(area, (), headers.len() as u64 - 1)?;
        self.stores.pruning.pruning_point.stage(area, (), last.hash())?;
        debug!(count = headers.len(), pruning_point = %last.hash(), "imported pruning points");
        Ok(())
    }
}
