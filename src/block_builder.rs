//! Building blocks that pass validation
//!
//! Given parents, miner data and transactions, fills in every header field
//! the validator recomputes:
//! 1. GHOSTDAG blue score and blue work, and the DAA score
//! 2. A timestamp after the past median time
//! 3. The expected pruning point
//! 4. The UTXO commitment and accepted id merkle root of the block's past
//! 5. The coinbase paying the merge set, and the hash merkle root
//!
//! There is no proof of work to find; the nonce stays zero.

use std::sync::Arc;

use crate::coinbase::CoinbaseManager;
use crate::config::Config;
use crate::consensus_state::ConsensusStateManager;
use crate::constants::BLOCK_VERSION;
use crate::dag_traversal::DagTraversalManager;
use crate::error::{ConsensusError, Result};
use crate::ghostdag::GhostdagManager;
use crate::hashing::{calc_accepted_id_merkle_root, calc_hash_merkle_root};
use crate::multiset::Multiset;
use crate::pruning::PruningManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::types::{Block, BlockHeader, Hash, MinerData, Transaction};

/// Minimum spacing between a block and its selected parent, in milliseconds
const BLOCK_TIME_STEP_MS: i64 = 1_000;

#[derive(Clone)]
pub struct BlockBuilder<M: Multiset> {
    config: Arc<Config>,
    stores: Stores<M>,
    ghostdag: GhostdagManager,
    traversal: DagTraversalManager,
    coinbase: CoinbaseManager,
    consensus_state: ConsensusStateManager<M>,
    pruning: PruningManager<M>,
}

impl<M: Multiset> BlockBuilder<M> {
    pub fn new(
        config: Arc<Config>,
        stores: Stores<M>,
        ghostdag: GhostdagManager,
        traversal: DagTraversalManager,
        coinbase: CoinbaseManager,
        consensus_state: ConsensusStateManager<M>,
        pruning: PruningManager<M>,
    ) -> Self {
        Self { config, stores, ghostdag, traversal, coinbase, consensus_state, pruning }
    }

    /// A valid block over `parents`, whose selected parent must be valid.
    /// `transactions` follow the coinbase unchanged.
    pub fn build_block(
        &self,
        area: &StagingArea,
        parents: &[Hash],
        miner_data: &MinerData,
        transactions: Vec<Transaction>,
    ) -> Result<Block> {
        if parents.is_empty() {
            return Err(ConsensusError::Invariant("a built block needs parents".to_string()));
        }
        let data = self.ghostdag.ghostdag(area, parents)?;
        let selected_parent = data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant("block over parents has no selected parent".to_string()))?;
        let selected_parent_header = self.stores.headers.get(area, &selected_parent)?;
        let daa_score = self.consensus_state.daa_score(area, &data)?;

        let past_median_time =
            self.traversal.past_median_time(area, &data, self.config.past_median_time_window_size())?;
        let timestamp = (past_median_time + 1).max(selected_parent_header.timestamp + BLOCK_TIME_STEP_MS);
        let pruning_point = self.pruning.expected_header_pruning_point(area, &data)?;

        let (multiset, acceptance_data) = self.consensus_state.calculate_commitments(area, &data, daa_score)?;
        let accepted_ids = acceptance_data
            .iter()
            .flat_map(|block| block.transaction_acceptance_data.iter())
            .filter(|tx| tx.is_accepted)
            .map(|tx| tx.transaction.id())
            .collect();
        let coinbase = self.coinbase.expected_coinbase_transaction(area, &data, &acceptance_data, miner_data)?;

        let mut all_transactions = Vec::with_capacity(transactions.len() + 1);
        all_transactions.push(coinbase);
        all_transactions.extend(transactions);

        let header = BlockHeader {
            version: BLOCK_VERSION,
            parents: vec![parents.to_vec()],
            hash_merkle_root: calc_hash_merkle_root(&all_transactions),
            accepted_id_merkle_root: calc_accepted_id_merkle_root(accepted_ids),
            utxo_commitment: multiset.hash(),
            timestamp,
            bits: self.config.genesis.header.bits,
            nonce: 0,
            daa_score,
            blue_score: data.blue_score,
            blue_work: data.blue_work,
            pruning_point,
        };
        Ok(Block::new(header, all_transactions))
    }
}
