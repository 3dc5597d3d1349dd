//! Queries used by peers to sync headers and blocks
//!
//! Locators are sparse lists of selected-chain blocks, dense near the top and
//! exponentially sparser below. Hash ranges are returned in an order where
//! every block comes after its parents, so a peer can insert them as sent.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::config::Config;
use crate::dag_traversal::DagTraversalManager;
use crate::error::{ConsensusError, Result};
use crate::ghostdag::GhostdagManager;
use crate::multiset::Multiset;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::types::{BlockGhostdagDataHashPair, BlockStatus, BlockWithTrustedData, Hash, SyncInfo};

#[derive(Clone)]
pub struct SyncManager<M: Multiset> {
    config: Arc<Config>,
    stores: Stores<M>,
    reachability: ReachabilityManager,
    ghostdag: GhostdagManager,
    traversal: DagTraversalManager,
}

impl<M: Multiset> SyncManager<M> {
    pub fn new(
        config: Arc<Config>,
        stores: Stores<M>,
        reachability: ReachabilityManager,
        ghostdag: GhostdagManager,
        traversal: DagTraversalManager,
    ) -> Self {
        Self { config, stores, reachability, ghostdag, traversal }
    }

    fn blue_score(&self, area: &StagingArea, block: &Hash) -> Result<u64> {
        Ok(self.traversal.ghostdag_data(area, block)?.blue_score)
    }

    /// Selected-chain blocks from `high` down to `low`, with the blue score
    /// gap doubling at every step. A `limit` of zero means no limit.
    pub fn create_block_locator(&self, area: &StagingArea, low: Hash, high: Hash, limit: usize) -> Result<Vec<Hash>> {
        if !self.reachability.is_chain_ancestor_of(area, low, high)? {
            return Err(ConsensusError::NotInSelectedChain(low, high));
        }
        let low_blue_score = self.blue_score(area, &low)?;
        let mut locator = Vec::new();
        let mut current = high;
        let mut current_blue_score = self.blue_score(area, &high)?;
        let mut step = 1u64;
        loop {
            locator.push(current);
            if current_blue_score <= low_blue_score {
                break;
            }
            if limit > 0 && locator.len() == limit {
                break;
            }
            let next_blue_score = current_blue_score.saturating_sub(step).max(low_blue_score);
            current = self.traversal.lowest_chain_block_above_or_equal_to_blue_score(area, high, next_blue_score)?;
            current_blue_score = self.blue_score(area, &current)?;
            step *= 2;
        }
        trace!(%low, %high, len = locator.len(), "created block locator");
        Ok(locator)
    }

    pub fn create_block_locator_from_pruning_point(&self, area: &StagingArea, high: Hash, limit: usize) -> Result<Vec<Hash>> {
        let pruning_point = self.stores.pruning.pruning_point(area)?;
        self.create_block_locator(area, pruning_point, high, limit)
    }

    /// Locator over the headers selected chain, between two blocks of it
    pub fn create_headers_selected_chain_block_locator(&self, area: &StagingArea, low: Hash, high: Hash) -> Result<Vec<Hash>> {
        if low == high {
            return Ok(vec![low]);
        }
        let headers_selected_tip = self.headers_selected_tip(area)?;
        for block in [low, high] {
            if !self.reachability.is_chain_ancestor_of(area, block, headers_selected_tip)? {
                return Err(ConsensusError::NotInSelectedChain(block, headers_selected_tip));
            }
        }
        self.create_block_locator(area, low, high, 0)
    }

    /// Locator from the pruning point up to the headers selected tip
    pub fn create_full_headers_selected_chain_block_locator(&self, area: &StagingArea) -> Result<Vec<Hash>> {
        let pruning_point = self.stores.pruning.pruning_point(area)?;
        let headers_selected_tip = self.headers_selected_tip(area)?;
        self.create_headers_selected_chain_block_locator(area, pruning_point, headers_selected_tip)
    }

    fn headers_selected_tip(&self, area: &StagingArea) -> Result<Hash> {
        Ok(*self.stores.headers_selected_tip.get(area, &())?)
    }

    /// Blocks in the past of `high` but not in the past of `low`, each after
    /// its parents, and the high block actually used.
    ///
    /// The range is walked along the selected chain of `high`: each chain
    /// block's merge set comes first in ascending blue work, then the chain
    /// block itself. When `high` is more than `max_blue_score_difference`
    /// above `low`, it is lowered along its chain to fit. Zero means no bound.
    pub fn get_hashes_between(
        &self,
        area: &StagingArea,
        low: Hash,
        high: Hash,
        max_blue_score_difference: u64,
    ) -> Result<(Vec<Hash>, Hash)> {
        let low_blue_score = self.blue_score(area, &low)?;
        let mut high = high;
        let high_blue_score = self.blue_score(area, &high)?;
        if high_blue_score < low_blue_score {
            return Err(ConsensusError::Invariant(format!(
                "low {low} has blue score {low_blue_score} above high {high} ({high_blue_score})"
            )));
        }
        if max_blue_score_difference > 0 && high_blue_score > low_blue_score + max_blue_score_difference {
            high = self.traversal.lowest_chain_block_above_or_equal_to_blue_score(
                area,
                high,
                low_blue_score + max_blue_score_difference,
            )?;
        }

        // Highest block on the chain of `high` that `low` already has
        let mut base = high;
        while !self.reachability.is_dag_ancestor_of(area, base, low)? {
            base = self
                .traversal
                .selected_parent(area, &base)?
                .ok_or_else(|| ConsensusError::Invariant(format!("{low} and {high} share no chain ancestor")))?;
        }

        let mut hashes = Vec::new();
        let mut seen: HashSet<Hash> = HashSet::new();
        for chain_block in self.traversal.selected_child_iterator(area, base, high)?.skip(1) {
            let chain_block = chain_block?;
            let data = self.traversal.ghostdag_data(area, &chain_block)?;
            let mut merged = Vec::new();
            for block in data.merge_set() {
                if Some(*block) == data.selected_parent || seen.contains(block) {
                    continue;
                }
                if self.reachability.is_dag_ancestor_of(area, *block, low)? {
                    continue;
                }
                merged.push(*block);
            }
            for block in self.ghostdag.sort_blocks(area, merged)? {
                seen.insert(block);
                hashes.push(block);
            }
            seen.insert(chain_block);
            hashes.push(chain_block);
        }
        trace!(%low, %high, count = hashes.len(), "collected hashes between");
        Ok((hashes, high))
    }

    /// Header-only blocks in the past of `high` above the highest block of
    /// its selected chain that has a body
    pub fn missing_block_body_hashes(&self, area: &StagingArea, high: Hash) -> Result<Vec<Hash>> {
        let mut low = high;
        while !self.stores.status(area, &low)?.has_body() {
            low = self
                .traversal
                .selected_parent(area, &low)?
                .ok_or_else(|| ConsensusError::Invariant(format!("no block with a body below {high}")))?;
        }
        if low == high {
            return Ok(Vec::new());
        }
        let (hashes, _) = self.get_hashes_between(area, low, high, 0)?;
        let mut missing = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if self.stores.statuses.try_get(area, &hash)?.map(|status| *status) == Some(BlockStatus::HeaderOnly) {
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    pub fn sync_info(&self, area: &StagingArea) -> Result<SyncInfo> {
        Ok(SyncInfo {
            header_count: self.stores.headers.count()?,
            block_count: self.stores.blocks.count()?,
            headers_selected_tip: self.stores.headers_selected_tip.try_get(area, &())?.map(|tip| *tip),
        })
    }

    /// The pruning point followed by its anticone in ascending blue work,
    /// each with the GHOSTDAG data and headers a node without their past
    /// needs: the selected chain down to the previous pruning point and at
    /// least a past median time window plus K blocks, with merge sets.
    pub fn pruning_point_and_its_anticone_with_trusted_data(
        &self,
        area: &StagingArea,
        virtual_parents: &[Hash],
    ) -> Result<Vec<BlockWithTrustedData>> {
        let pruning_point = self.stores.pruning.pruning_point(area)?;
        let anticone = self.traversal.anticone(area, pruning_point, virtual_parents)?;
        let mut blocks = vec![pruning_point];
        blocks.extend(self.ghostdag.sort_blocks(area, anticone)?);

        let previous_pruning_point_blue_score = {
            let header = self.stores.headers.get(area, &pruning_point)?;
            match self.stores.headers.try_get(area, &header.pruning_point)? {
                Some(previous) => previous.blue_score,
                None => 0,
            }
        };
        let min_chain_depth = self.config.past_median_time_window_size() + self.ghostdag.k() as usize + 1;

        blocks
            .into_iter()
            .map(|hash| self.block_with_trusted_data(area, hash, previous_pruning_point_blue_score, min_chain_depth))
            .collect()
    }

    fn block_with_trusted_data(
        &self,
        area: &StagingArea,
        hash: Hash,
        lowest_blue_score: u64,
        min_chain_depth: usize,
    ) -> Result<BlockWithTrustedData> {
        let block = self.stores.blocks.get(area, &hash)?.as_ref().clone();
        let mut included: Vec<Hash> = Vec::new();
        let mut seen: HashSet<Hash> = HashSet::new();

        let mut current = Some(hash);
        let mut depth = 0usize;
        while let Some(chain_block) = current {
            let Some(data) = self.stores.ghostdag.try_get(area, &chain_block)? else {
                break;
            };
            if seen.insert(chain_block) {
                included.push(chain_block);
            }
            for merged in data.merge_set() {
                if seen.insert(*merged) {
                    included.push(*merged);
                }
            }
            depth += 1;
            if depth > min_chain_depth && data.blue_score <= lowest_blue_score {
                break;
            }
            current = data.selected_parent;
        }

        let mut ghostdag_data = Vec::with_capacity(included.len());
        let mut window_headers = Vec::with_capacity(included.len());
        for block_hash in included {
            if let Some(data) = self.stores.ghostdag.try_get(area, &block_hash)? {
                ghostdag_data.push(BlockGhostdagDataHashPair { hash: block_hash, ghostdag_data: data.as_ref().clone() });
            }
            if block_hash == hash {
                continue;
            }
            if let Some(header) = self.stores.headers.try_get(area, &block_hash)? {
                window_headers.push(header.as_ref().clone());
            }
        }
        Ok(BlockWithTrustedData { block, ghostdag_data, window_headers })
    }
}
