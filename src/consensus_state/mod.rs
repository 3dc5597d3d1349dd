//! Block status resolution and the virtual block's UTXO state
//!
//! Every resolved block stores a UTXO diff that, applied along its chain of
//! diff children, leads from the virtual UTXO set to the block's past UTXO
//! set. Blocks without a diff child are the virtual diff parents; their
//! diffs are relative to the virtual UTXO set itself.

mod import;
mod resolve;
mod reverse;
mod update_virtual;
mod utxo_calculation;
mod virtual_parents;

use std::sync::Arc;

use crate::coinbase::CoinbaseManager;
use crate::config::Config;
use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::dag_topology::DagTopologyManager;
use crate::dag_traversal::DagTraversalManager;
use crate::database::Database;
use crate::error::{ConsensusError, Result};
use crate::ghostdag::GhostdagManager;
use crate::multiset::Multiset;
use crate::pruning::PruningManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::transaction_validator::{TransactionValidator, TxValidationContext};
use crate::types::{GhostdagData, Hash};

pub use resolve::ResolveOutcome;
pub use reverse::ReversalData;
pub use update_virtual::VirtualUpdate;
pub use utxo_calculation::{populate_transaction_inputs, restore_past_utxo};

#[derive(Clone)]
pub struct ConsensusStateManager<M: Multiset> {
    config: Arc<Config>,
    db: Arc<dyn Database>,
    stores: Stores<M>,
    topology: DagTopologyManager,
    ghostdag: GhostdagManager,
    traversal: DagTraversalManager,
    coinbase: CoinbaseManager,
    tx_validator: Arc<dyn TransactionValidator>,
    pruning: PruningManager<M>,
}

impl<M: Multiset> ConsensusStateManager<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn Database>,
        stores: Stores<M>,
        topology: DagTopologyManager,
        ghostdag: GhostdagManager,
        traversal: DagTraversalManager,
        coinbase: CoinbaseManager,
        tx_validator: Arc<dyn TransactionValidator>,
        pruning: PruningManager<M>,
    ) -> Self {
        Self { config, db, stores, topology, ghostdag, traversal, coinbase, tx_validator, pruning }
    }

    pub fn virtual_ghostdag_data(&self, area: &StagingArea) -> Result<Arc<GhostdagData>> {
        self.stores.ghostdag.get(area, &VIRTUAL_BLOCK_HASH)
    }

    pub fn virtual_selected_parent(&self, area: &StagingArea) -> Result<Hash> {
        self.virtual_ghostdag_data(area)?
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant("virtual has no selected parent".to_string()))
    }

    /// DAA score of a block (or the virtual) described by `data`: its selected
    /// parent's score plus the size of its merge set
    pub fn daa_score(&self, area: &StagingArea, data: &GhostdagData) -> Result<u64> {
        match data.selected_parent {
            None => Ok(0),
            Some(selected_parent) => {
                Ok(self.stores.headers.get(area, &selected_parent)?.daa_score + data.merge_set_size() as u64)
            }
        }
    }

    /// Past median time of the selected parent of the block described by `data`
    pub fn selected_parent_median_time(&self, area: &StagingArea, data: &GhostdagData) -> Result<i64> {
        let window_size = self.config.past_median_time_window_size();
        match data.selected_parent {
            None => self.traversal.past_median_time(area, data, window_size),
            Some(selected_parent) => {
                let selected_parent_data = self.traversal.ghostdag_data(area, &selected_parent)?;
                self.traversal.past_median_time(area, &selected_parent_data, window_size)
            }
        }
    }

    /// Context for transactions accepted by the virtual
    pub fn virtual_tx_context(&self, area: &StagingArea) -> Result<TxValidationContext> {
        let data = self.virtual_ghostdag_data(area)?;
        Ok(TxValidationContext {
            blue_score: data.blue_score,
            daa_score: self.daa_score(area, &data)?,
            past_median_time: self.selected_parent_median_time(area, &data)?,
        })
    }

    /// Replaces the parents of `block` with `block` in the tip set
    pub fn add_tip(&self, area: &mut StagingArea, block: Hash, parents: &[Hash]) -> Result<Vec<Hash>> {
        let mut tips: Vec<Hash> = self.stores.tips(area)?.into_iter().filter(|tip| !parents.contains(tip)).collect();
        if !tips.contains(&block) {
            tips.push(block);
        }
        self.stores.tips.stage(area, (), tips.clone())?;
        Ok(tips)
    }
}
