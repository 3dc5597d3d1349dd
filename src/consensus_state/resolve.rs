use tracing::{debug, trace};

use super::reverse::ReversalData;
use super::ConsensusStateManager;
use crate::error::{ConsensusError, Result, RuleError};
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::transaction_validator::TxValidationContext;
use crate::types::{BlockStatus, Hash};
use crate::utxo::UtxoDiff;

/// Result of resolving the status of a block and its pending chain
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub status: BlockStatus,
    /// The rule the queried block broke, if it was disqualified itself
    pub disqualification: Option<RuleError>,
    /// Highest block of the chain that resolved as valid, with its past UTXO
    /// set expressed against the virtual UTXO set
    pub resolved_tip: Option<(Hash, UtxoDiff)>,
    pub reversal: Option<ReversalData>,
}

impl<M: Multiset> ConsensusStateManager<M> {
    /// Resolves `block` and every `UtxoPendingVerification` block on its
    /// selected chain, bottom-up.
    ///
    /// A block whose selected parent is disqualified is disqualified as well.
    /// Every valid block except the top one stores its diff against its
    /// selected parent; the top one is expressed against the virtual UTXO set
    /// and the caller adds it to the virtual diff parents.
    pub fn resolve_block_status(&self, area: &mut StagingArea, block: Hash) -> Result<ResolveOutcome> {
        let mut pending = Vec::new();
        let mut current = block;
        loop {
            let status = self.stores.status(area, &current)?;
            if status != BlockStatus::UtxoPendingVerification {
                break;
            }
            pending.push(current);
            current = self
                .traversal
                .selected_parent(area, &current)?
                .ok_or_else(|| ConsensusError::Invariant(format!("pending block {current} has no selected parent")))?;
        }
        if pending.is_empty() {
            return Ok(ResolveOutcome {
                status: self.stores.status(area, &block)?,
                disqualification: None,
                resolved_tip: None,
                reversal: None,
            });
        }
        pending.reverse();
        let resolved_base = current;
        trace!(%block, count = pending.len(), base = %resolved_base, "resolving pending chain");

        let mut disqualification = None;
        let mut resolved_tip: Option<(Hash, UtxoDiff, UtxoDiff)> = None;
        let mut disqualified = self.stores.status(area, &resolved_base)? != BlockStatus::Valid;
        let mut selected_parent_past =
            if disqualified { UtxoDiff::default() } else { super::restore_past_utxo(&self.stores, area, resolved_base)? };

        for hash in pending.iter().copied() {
            if disqualified {
                self.stores.statuses.stage(area, hash, BlockStatus::DisqualifiedFromChain)?;
                continue;
            }
            let data = self.traversal.ghostdag_data(area, &hash)?;
            let block_body = self.stores.blocks.get(area, &hash)?;
            let context = TxValidationContext {
                blue_score: data.blue_score,
                daa_score: block_body.header.daa_score,
                past_median_time: self.selected_parent_median_time(area, &data)?,
            };
            let past = self.calculate_past_utxo_and_acceptance(area, &data, &selected_parent_past, &context)?;
            let past_utxo = selected_parent_past.with_diff(&past.merge_diff)?;

            match self.verify_utxo(area, &block_body, &data, &past, &past_utxo, &context) {
                Ok(()) => {}
                Err(ConsensusError::Rule(err)) => {
                    debug!(block = %hash, %err, "block disqualified from the selected chain");
                    if hash == block {
                        disqualification = Some(err);
                    }
                    self.stores.statuses.stage(area, hash, BlockStatus::DisqualifiedFromChain)?;
                    disqualified = true;
                    continue;
                }
                Err(err) => return Err(err),
            }

            let selected_parent = data
                .selected_parent
                .ok_or_else(|| ConsensusError::Invariant(format!("resolved block {hash} has no selected parent")))?;
            self.stores.statuses.stage(area, hash, BlockStatus::Valid)?;
            self.stores.multisets.stage(area, hash, past.multiset)?;
            self.stores.acceptance_data.stage(area, hash, past.acceptance_data)?;
            // Points down to the selected parent until the chain is reversed
            self.stores.utxo_diffs.stage(area, hash, past.merge_diff.clone())?;
            self.stores.utxo_diff_children.stage(area, hash, selected_parent)?;
            resolved_tip = Some((hash, past_utxo.clone(), past.merge_diff));
            selected_parent_past = past_utxo;
        }

        let mut outcome = ResolveOutcome {
            status: self.stores.status(area, &block)?,
            disqualification,
            resolved_tip: None,
            reversal: None,
        };
        if let Some((tip, tip_past, tip_merge_diff)) = resolved_tip {
            self.stores.utxo_diffs.stage(area, tip, tip_past.clone())?;
            self.stores.utxo_diff_children.delete(area, tip)?;
            if tip != pending[0] {
                outcome.reversal = Some(ReversalData { tip, tip_merge_diff });
            }
            outcome.resolved_tip = Some((tip, tip_past));
        }
        Ok(outcome)
    }
}
