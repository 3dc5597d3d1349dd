use std::collections::HashSet;

use tracing::trace;

use super::ConsensusStateManager;
use crate::dag_traversal::DownHeap;
use crate::error::{ConsensusError, Result};
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::types::{BlockStatus, GhostdagData, Hash};

impl<M: Multiset> ConsensusStateManager<M> {
    /// Chooses the virtual's parents among `tips`.
    ///
    /// The selected parent is the heaviest valid candidate. A candidate that
    /// is not valid gives way to those of its parents that have no valid
    /// child. Other candidates are then added heaviest first while the parent
    /// count, the merge set size and the bounded-merge rule allow.
    pub fn pick_virtual_parents(&self, area: &StagingArea, tips: &[Hash]) -> Result<Vec<Hash>> {
        let mut heap = DownHeap::new();
        let mut visited: HashSet<Hash> = HashSet::new();
        for tip in tips {
            if visited.insert(*tip) {
                heap.push(self.traversal.sortable(area, *tip)?);
            }
        }

        let selected_parent = loop {
            let candidate = heap
                .pop()
                .ok_or_else(|| ConsensusError::Invariant("no valid block to select as the virtual's parent".to_string()))?;
            if self.stores.status(area, &candidate.hash)? == BlockStatus::Valid {
                break candidate.hash;
            }
            for parent in self.topology.parents(area, &candidate.hash)? {
                if visited.contains(&parent) || !self.has_no_valid_children(area, parent)? {
                    continue;
                }
                visited.insert(parent);
                heap.push(self.traversal.sortable(area, parent)?);
            }
        };

        let mut parents = vec![selected_parent];
        let reachability = self.topology.reachability();
        while let Some(candidate) = heap.pop() {
            if parents.len() >= self.config.max_block_parents {
                break;
            }
            let status = self.stores.status(area, &candidate.hash)?;
            if !matches!(status, BlockStatus::Valid | BlockStatus::DisqualifiedFromChain) {
                continue;
            }
            if reachability.is_dag_ancestor_of_any(area, candidate.hash, &parents)? {
                continue;
            }
            let mut proposed = parents.clone();
            proposed.push(candidate.hash);
            let merge_set =
                self.ghostdag.ordered_merge_set_without_selected_parent(area, selected_parent, &proposed)?;
            if merge_set.len() as u64 + 1 > self.config.merge_set_size_limit {
                trace!(candidate = %candidate.hash, "virtual parent candidate exceeds the merge set limit");
                continue;
            }
            let data = self.ghostdag.ghostdag(area, &proposed)?;
            if self.is_violating_bounded_merge(area, &data)? {
                trace!(candidate = %candidate.hash, "virtual parent candidate merges a bad red");
                continue;
            }
            parents = proposed;
        }
        Ok(parents)
    }

    /// Children still waiting for UTXO verification count as not valid
    fn has_no_valid_children(&self, area: &StagingArea, block: Hash) -> Result<bool> {
        for child in self.topology.children(area, &block)? {
            if self.stores.statuses.try_get(area, &child)?.map(|status| *status) == Some(BlockStatus::Valid) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A red is bad when it is outside the future of the finality point and no
    /// blue of the same merge set has it in its past
    pub(super) fn is_violating_bounded_merge(&self, area: &StagingArea, data: &GhostdagData) -> Result<bool> {
        let Some(finality_point) = self.pruning.finality_point(area)? else {
            return Ok(false);
        };
        let reachability = self.topology.reachability();
        for red in &data.merge_set_reds {
            if reachability.is_dag_ancestor_of(area, finality_point, *red)? {
                continue;
            }
            if !reachability.is_dag_ancestor_of_any(area, *red, &data.merge_set_blues)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
