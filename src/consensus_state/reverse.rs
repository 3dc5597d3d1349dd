use tracing::trace;

use super::ConsensusStateManager;
use crate::error::Result;
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::types::Hash;
use crate::utxo::UtxoDiff;

/// What is needed to turn a freshly resolved chain's diffs around
#[derive(Debug, Clone)]
pub struct ReversalData {
    /// The resolved tip, whose diff is already relative to the virtual
    pub tip: Hash,
    /// Diff from the tip's selected parent's past UTXO set to the tip's
    pub tip_merge_diff: UtxoDiff,
}

impl<M: Multiset> ConsensusStateManager<M> {
    /// Walks down from the resolved tip and makes every block whose diff
    /// still points at its selected parent point at its selected child
    /// instead. Each step is committed on its own, so an interrupted reversal
    /// leaves every diff chain walkable.
    pub fn reverse_utxo_diffs(&self, reversal: ReversalData) -> Result<usize> {
        let ReversalData { tip, tip_merge_diff } = reversal;
        let mut previous = tip;
        let mut previous_merge_diff = tip_merge_diff;
        let mut steps = 0;
        loop {
            let mut area = StagingArea::new();
            let Some(current) = self.traversal.selected_parent(&area, &previous)? else {
                break;
            };
            let Some(current_selected_parent) = self.traversal.selected_parent(&area, &current)? else {
                break;
            };
            let old_child = self.stores.utxo_diff_children.try_get(&area, &current)?.map(|child| *child);
            if old_child != Some(current_selected_parent) {
                break;
            }
            let old_diff = self.stores.utxo_diffs.get(&area, &current)?.as_ref().clone();

            self.stores.utxo_diffs.stage(&mut area, current, previous_merge_diff.reversed())?;
            self.stores.utxo_diff_children.stage(&mut area, current, previous)?;
            area.commit(self.db.as_ref())?;

            previous_merge_diff = old_diff;
            previous = current;
            steps += 1;
        }
        trace!(%tip, steps, "reversed utxo diffs");
        Ok(steps)
    }
}
