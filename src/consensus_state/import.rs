use tracing::{info, warn};

use super::{populate_transaction_inputs, ConsensusStateManager};
use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::error::{Result, RuleError};
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::transaction_validator::TxValidationContext;
use crate::types::{BlockStatus, Hash, Outpoint, UtxoEntry};
use crate::utxo::UtxoDiff;

impl<M: Multiset> ConsensusStateManager<M> {
    /// Empties the imported UTXO bucket and its multiset in a single commit
    pub fn clear_imported_pruning_point_data(&self) -> Result<()> {
        let imported = &self.stores.pruning.imported_utxo_set;
        let mut area = StagingArea::new();
        for (outpoint, _) in imported.entries(None, usize::MAX)? {
            imported.delete_entry(&mut area, outpoint)?;
        }
        self.stores.pruning.imported_multiset.delete(&mut area, ())?;
        area.commit(self.db.as_ref())
    }

    /// Adds a chunk of the pruning point UTXO set sent by a peer
    pub fn append_imported_pruning_point_utxos(&self, utxos: &[(Outpoint, UtxoEntry)]) -> Result<()> {
        let mut area = StagingArea::new();
        let mut multiset = self.stores.pruning.imported_multiset(&area)?;
        for (outpoint, entry) in utxos {
            if self.stores.pruning.imported_utxo_set.get(&area, outpoint)?.is_some() {
                return Err(RuleError::MalformedUtxo(format!("outpoint {outpoint} imported twice")).into());
            }
            self.stores.pruning.imported_utxo_set.stage_entry(&mut area, *outpoint, entry.clone())?;
            multiset.add_utxo(outpoint, entry);
        }
        self.stores.pruning.imported_multiset.stage(&mut area, (), multiset)?;
        area.commit(self.db.as_ref())
    }

    /// Adopts the imported UTXO set as the state of `pruning_point`.
    ///
    /// The set must hash to the pruning point's UTXO commitment. On success
    /// the pruning point becomes the only tip and the virtual's sole parent,
    /// and the imported set replaces the virtual, pruning point and candidate
    /// buckets. The bucket swap is guarded by a sentinel so that an
    /// interrupted swap is redone on the next start.
    pub fn validate_and_insert_imported_pruning_point(&self, pruning_point: Hash) -> Result<()> {
        let mut area = StagingArea::new();
        let pruning = &self.stores.pruning;
        if pruning.pruning_point(&area)? != pruning_point {
            return Err(RuleError::WrongPruningPointHash(pruning_point).into());
        }
        let pruning_points = pruning.pruning_points(&area)?;
        if self.pruning.are_pruning_points_violating_finality(&area, &pruning_points)? {
            return Err(RuleError::SuggestedPruningViolatesFinality(pruning_point).into());
        }

        let header = self.stores.headers.get(&area, &pruning_point)?;
        let multiset = pruning.imported_multiset(&area)?;
        let multiset_hash = multiset.hash();
        if multiset_hash != header.utxo_commitment {
            return Err(RuleError::BadPruningPointUtxoSet { expected: header.utxo_commitment, actual: multiset_hash }.into());
        }

        // The pruning point's own transactions spend from its past, which is
        // the imported set. Coinbase maturity is not known here and is skipped.
        let block = self.stores.blocks.get(&area, &pruning_point)?;
        let context = TxValidationContext {
            blue_score: u64::MAX,
            daa_score: header.daa_score,
            past_median_time: header.timestamp,
        };
        {
            let view = pruning.imported_utxo_set.view(&area);
            for tx in block.transactions.iter().skip(1) {
                let mut populated = tx.clone();
                let missing = populate_transaction_inputs(&mut populated, &view)?;
                if !missing.is_empty() {
                    return Err(RuleError::MissingTxOut(missing).into());
                }
                self.tx_validator.validate_in_context(&populated, &context)?;
            }
        }

        self.stores.statuses.stage(&mut area, pruning_point, BlockStatus::Valid)?;
        self.stores.utxo_diffs.stage(&mut area, pruning_point, UtxoDiff::default())?;
        self.stores.utxo_diff_children.delete(&mut area, pruning_point)?;
        self.stores.multisets.stage(&mut area, pruning_point, multiset.clone())?;
        self.stores.tips.stage(&mut area, (), vec![pruning_point])?;
        self.stores.virtual_diff_parents.stage(&mut area, (), vec![pruning_point])?;
        self.topology.set_virtual_parents(&mut area, vec![pruning_point])?;
        let virtual_data = self.ghostdag.ghostdag(&area, &[pruning_point])?;
        self.stores.ghostdag.stage(&mut area, VIRTUAL_BLOCK_HASH, virtual_data)?;
        self.stores.multisets.stage(&mut area, VIRTUAL_BLOCK_HASH, multiset.clone())?;
        self.stores.acceptance_data.stage(&mut area, VIRTUAL_BLOCK_HASH, Vec::new())?;
        pruning.candidate.stage(&mut area, (), pruning_point)?;
        pruning.candidate_multiset.stage(&mut area, (), multiset)?;
        pruning.updating_utxo_set.stage(&mut area, (), true)?;
        area.commit(self.db.as_ref())?;

        self.swap_imported_utxo_set()?;
        info!(%pruning_point, "imported pruning point utxo set");
        Ok(())
    }

    fn swap_imported_utxo_set(&self) -> Result<()> {
        let pruning = &self.stores.pruning;
        self.stores.virtual_utxo_set.overwrite_from(&pruning.imported_utxo_set)?;
        pruning.pruning_point_utxo_set.overwrite_from(&pruning.imported_utxo_set)?;
        pruning.candidate_utxo_set.overwrite_from(&pruning.imported_utxo_set)?;
        let mut area = StagingArea::new();
        pruning.updating_utxo_set.stage(&mut area, (), false)?;
        area.commit(self.db.as_ref())
    }

    /// Finishes a bucket swap that was interrupted by a crash
    pub fn recover_interrupted_utxo_swap(&self) -> Result<bool> {
        if !self.stores.pruning.is_updating_utxo_set(&StagingArea::new())? {
            return Ok(false);
        }
        warn!("pruning point utxo set update was interrupted, redoing it");
        self.swap_imported_utxo_set()?;
        Ok(true)
    }
}
