//! Block validation
//!
//! Header and body checks, each split into a context-free part and a part
//! that needs the block's position in the DAG. UTXO-dependent checks happen
//! later, when the block's status is resolved.

use std::collections::HashSet;
use std::sync::Arc;

use crate::coinbase::CoinbaseManager;
use crate::config::Config;
use crate::dag_traversal::DagTraversalManager;
use crate::error::{Result, RuleError};
use crate::hashing::calc_hash_merkle_root;
use crate::multiset::Multiset;
use crate::pruning::PruningManager;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::transaction_validator::TransactionValidator;
use crate::types::{Block, BlockHeader, BlockStatus, GhostdagData, Hash};

#[derive(Clone)]
pub struct BlockValidator<M: Multiset> {
    config: Arc<Config>,
    stores: Stores<M>,
    reachability: ReachabilityManager,
    traversal: DagTraversalManager,
    coinbase: CoinbaseManager,
    tx_validator: Arc<dyn TransactionValidator>,
    pruning: PruningManager<M>,
}

impl<M: Multiset> BlockValidator<M> {
    pub fn new(
        config: Arc<Config>,
        stores: Stores<M>,
        reachability: ReachabilityManager,
        traversal: DagTraversalManager,
        coinbase: CoinbaseManager,
        tx_validator: Arc<dyn TransactionValidator>,
        pruning: PruningManager<M>,
    ) -> Self {
        Self { config, stores, reachability, traversal, coinbase, tx_validator, pruning }
    }

    /// Context-free header checks:
    /// 1. At least one parent
    /// 2. No more than `max_block_parents`
    /// 3. No parent listed twice
    pub fn validate_header_in_isolation(&self, header: &BlockHeader) -> Result<()> {
        let parents = header.direct_parents();
        if parents.is_empty() {
            return Err(RuleError::NoParents.into());
        }
        if parents.len() > self.config.max_block_parents {
            return Err(RuleError::TooManyParents(parents.len()).into());
        }
        let mut seen = HashSet::with_capacity(parents.len());
        for parent in parents {
            if !seen.insert(*parent) {
                return Err(RuleError::DuplicateParents(*parent).into());
            }
        }
        Ok(())
    }

    /// Parents that have no known header
    pub fn missing_parents(&self, area: &StagingArea, header: &BlockHeader) -> Result<Vec<Hash>> {
        let mut missing = Vec::new();
        for parent in header.direct_parents() {
            if !self.stores.has_block(area, parent)? {
                missing.push(*parent);
            }
        }
        Ok(missing)
    }

    /// Fails if any parent is known to be invalid. Parents must be known.
    pub fn validate_parents_not_invalid(&self, area: &StagingArea, header: &BlockHeader) -> Result<()> {
        for parent in header.direct_parents() {
            if self.stores.status(area, parent)? == BlockStatus::Invalid {
                return Err(RuleError::InvalidAncestor(*parent).into());
            }
        }
        Ok(())
    }

    /// Header checks against the DAG:
    /// 1. The merge set is within the size limit
    /// 2. Blue score, blue work and DAA score match the GHOSTDAG result
    /// 3. The timestamp is after the past median time
    /// 4. The pruning point is the one the block's chain implies
    pub fn validate_header_in_context(&self, area: &StagingArea, header: &BlockHeader, data: &GhostdagData) -> Result<()> {
        let merge_set_size = data.merge_set_size() as u64;
        if merge_set_size > self.config.merge_set_size_limit {
            return Err(RuleError::MergeSetTooBig(merge_set_size).into());
        }

        if header.blue_score != data.blue_score {
            return Err(RuleError::UnexpectedBlueScore { expected: data.blue_score, actual: header.blue_score }.into());
        }
        if header.blue_work != data.blue_work {
            return Err(RuleError::UnexpectedBlueWork.into());
        }
        let expected_daa_score = match data.selected_parent {
            Some(selected_parent) => self.stores.headers.get(area, &selected_parent)?.daa_score + merge_set_size,
            None => 0,
        };
        if header.daa_score != expected_daa_score {
            return Err(RuleError::UnexpectedDaaScore { expected: expected_daa_score, actual: header.daa_score }.into());
        }

        let past_median_time =
            self.traversal.past_median_time(area, data, self.config.past_median_time_window_size())?;
        if header.timestamp <= past_median_time {
            return Err(RuleError::TimeTooOld { timestamp: header.timestamp, past_median_time }.into());
        }

        let expected_pruning_point = self.pruning.expected_header_pruning_point(area, data)?;
        if header.pruning_point != expected_pruning_point {
            return Err(
                RuleError::UnexpectedPruningPoint { expected: expected_pruning_point, actual: header.pruning_point }
                    .into(),
            );
        }
        Ok(())
    }

    /// Context-free body checks:
    /// 1. A coinbase comes first and nowhere else
    /// 2. The hash merkle root matches the transactions
    /// 3. No transaction appears twice and no outpoint is spent twice
    /// 4. Every transaction is well formed and the total mass fits the block
    pub fn validate_body_in_isolation(&self, block: &Block) -> Result<()> {
        let transactions = &block.transactions;
        let coinbase = transactions.first().ok_or(RuleError::NoTransactions)?;
        if !coinbase.is_coinbase() {
            return Err(RuleError::FirstTxNotCoinbase.into());
        }
        if let Some(index) = transactions.iter().skip(1).position(|tx| tx.is_coinbase()) {
            return Err(RuleError::MultipleCoinbases(index + 1).into());
        }

        let merkle_root = calc_hash_merkle_root(transactions);
        if merkle_root != block.header.hash_merkle_root {
            return Err(RuleError::BadMerkleRoot { expected: merkle_root, actual: block.header.hash_merkle_root }.into());
        }

        let mut ids = HashSet::with_capacity(transactions.len());
        let mut spent = HashSet::new();
        let mut mass: u64 = 0;
        for tx in transactions {
            let id = tx.id();
            if !ids.insert(id) {
                return Err(RuleError::DuplicateTransactions(id).into());
            }
            for input in &tx.inputs {
                if !spent.insert(input.previous_outpoint) {
                    return Err(RuleError::DoubleSpendInSameBlock(input.previous_outpoint).into());
                }
            }
            self.tx_validator.validate_in_isolation(tx)?;
            mass = mass.saturating_add(self.tx_validator.calculate_mass(tx));
        }
        if mass > self.config.max_block_mass {
            return Err(RuleError::BlockMassTooHigh(mass).into());
        }
        self.coinbase.validate_coinbase_payload_in_isolation(coinbase)?;
        Ok(())
    }

    /// Body checks against the DAG:
    /// 1. Every parent has a body, unless it is below the pruning point
    /// 2. The coinbase payload carries the block's blue score and subsidy
    pub fn validate_body_in_context(&self, area: &StagingArea, block: &Block, data: &GhostdagData) -> Result<()> {
        let pruning_point = self.pruning.pruning_point(area)?;
        let mut missing = Vec::new();
        for parent in block.header.direct_parents() {
            if self.stores.status(area, parent)?.has_body() {
                continue;
            }
            if self.reachability.is_dag_ancestor_of(area, *parent, pruning_point)? {
                continue;
            }
            missing.push(*parent);
        }
        if !missing.is_empty() {
            return Err(RuleError::MissingParents(missing).into());
        }

        let coinbase = block.transactions.first().ok_or(RuleError::NoTransactions)?;
        self.coinbase.validate_coinbase_payload_in_context(coinbase, data.blue_score)
    }
}
