use tracing::debug;

use super::{restore_past_utxo, ConsensusStateManager};
use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::error::{ConsensusError, Result};
use crate::multiset::Multiset;
use crate::pruning::PruningPointMove;
use crate::staging::StagingArea;
use crate::transaction_validator::TxValidationContext;
use crate::types::{Hash, SelectedChainPath};
use crate::utxo::UtxoDiff;

/// How the virtual changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualUpdate {
    pub chain_changes: SelectedChainPath,
    pub virtual_parents: Vec<Hash>,
    pub pruning_point_move: Option<PruningPointMove>,
}

impl<M: Multiset> ConsensusStateManager<M> {
    /// Recomputes the virtual from the current tips.
    ///
    /// `resolved_tip` is the top of a freshly resolved chain, with its past
    /// UTXO set against the current virtual UTXO set. It joins the virtual
    /// diff parents and takes over any of its parents that were diff parents.
    /// Every diff parent is then rebased onto the new virtual UTXO set.
    pub fn update_virtual(&self, area: &mut StagingArea, resolved_tip: Option<(Hash, UtxoDiff)>) -> Result<VirtualUpdate> {
        let old_selected_parent =
            self.stores.ghostdag.try_get(area, &VIRTUAL_BLOCK_HASH)?.and_then(|data| data.selected_parent);

        let mut diff_parents = self.stores.virtual_diff_parents(area)?;
        if let Some((tip, tip_past)) = resolved_tip {
            let parents = self.topology.parents(area, &tip)?;
            for parent in parents.iter().filter(|parent| diff_parents.contains(parent)) {
                let parent_past = self.stores.utxo_diffs.get(area, parent)?;
                self.stores.utxo_diffs.stage(area, *parent, tip_past.diff_from(&parent_past)?)?;
                self.stores.utxo_diff_children.stage(area, *parent, tip)?;
            }
            diff_parents.retain(|parent| !parents.contains(parent));
            if !diff_parents.contains(&tip) {
                diff_parents.push(tip);
            }
        }

        let tips = self.stores.tips(area)?;
        let virtual_parents = self.pick_virtual_parents(area, &tips)?;
        self.topology.set_virtual_parents(area, virtual_parents.clone())?;
        let virtual_data = self.ghostdag.ghostdag(area, &virtual_parents)?;
        let selected_parent = virtual_data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant("virtual has no selected parent".to_string()))?;

        let selected_parent_past = restore_past_utxo(&self.stores, area, selected_parent)?;
        let context = TxValidationContext {
            blue_score: virtual_data.blue_score,
            daa_score: self.daa_score(area, &virtual_data)?,
            past_median_time: self.selected_parent_median_time(area, &virtual_data)?,
        };
        let past = self.calculate_past_utxo_and_acceptance(area, &virtual_data, &selected_parent_past, &context)?;
        let virtual_diff = selected_parent_past.with_diff(&past.merge_diff)?;

        for parent in &diff_parents {
            let parent_past = self.stores.utxo_diffs.get(area, parent)?;
            self.stores.utxo_diffs.stage(area, *parent, virtual_diff.diff_from(&parent_past)?)?;
        }
        self.stores.virtual_utxo_set.stage_diff(area, &virtual_diff)?;
        self.stores.virtual_diff_parents.stage(area, (), diff_parents)?;
        self.stores.multisets.stage(area, VIRTUAL_BLOCK_HASH, past.multiset)?;
        self.stores.acceptance_data.stage(area, VIRTUAL_BLOCK_HASH, past.acceptance_data)?;
        self.stores.ghostdag.stage(area, VIRTUAL_BLOCK_HASH, virtual_data.clone())?;

        let chain_changes = match old_selected_parent {
            Some(old) => self.traversal.calculate_chain_path(area, old, selected_parent)?,
            None => SelectedChainPath { removed: Vec::new(), added: vec![selected_parent] },
        };
        let pruning_point_move = self.pruning.update_pruning_point_by_virtual(area, &virtual_data)?;
        debug!(
            selected_parent = %selected_parent,
            blue_score = virtual_data.blue_score,
            parents = virtual_parents.len(),
            added = chain_changes.added.len(),
            removed = chain_changes.removed.len(),
            "virtual updated"
        );
        Ok(VirtualUpdate { chain_changes, virtual_parents, pruning_point_move })
    }
}
