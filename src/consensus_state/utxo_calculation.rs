use tracing::trace;

use super::ConsensusStateManager;
use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::error::{ConsensusError, Result, RuleError};
use crate::hashing::calc_accepted_id_merkle_root;
use crate::multiset::Multiset;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::transaction_validator::TxValidationContext;
use crate::types::{
    AcceptanceData, Block, BlockAcceptanceData, BlockStatus, GhostdagData, Hash, Outpoint, Transaction,
    TransactionAcceptanceData, UtxoEntry,
};
use crate::utxo::{DiffView, MutableUtxoDiff, UtxoDiff, UtxoView};

/// Diff from the virtual UTXO set to the past UTXO set of `block`, found by
/// composing the diffs along its chain of diff children
pub fn restore_past_utxo<M: Multiset>(stores: &Stores<M>, area: &StagingArea, block: Hash) -> Result<UtxoDiff> {
    if block == VIRTUAL_BLOCK_HASH {
        return Ok(UtxoDiff::default());
    }
    let mut chain = vec![block];
    let mut current = block;
    while let Some(child) = stores.utxo_diff_children.try_get(area, &current)? {
        current = *child;
        if chain.contains(&current) {
            return Err(ConsensusError::Invariant(format!("utxo diff child chain of {block} loops at {current}")));
        }
        chain.push(current);
    }
    let mut accumulated = MutableUtxoDiff::new();
    for hash in chain.iter().rev() {
        let diff = stores.utxo_diffs.get(area, hash)?;
        accumulated.with_diff_in_place(diff.as_ref())?;
    }
    Ok(accumulated.into_immutable())
}

/// Fills in the UTXO entries of `tx`'s inputs from `view`. Returns the
/// outpoints that could not be found.
pub fn populate_transaction_inputs(tx: &mut Transaction, view: &dyn UtxoView) -> Result<Vec<Outpoint>> {
    let mut missing = Vec::new();
    for input in tx.inputs.iter_mut() {
        match view.get_utxo(&input.previous_outpoint)? {
            Some(entry) => input.utxo_entry = Some(entry),
            None => missing.push(input.previous_outpoint),
        }
    }
    Ok(missing)
}

fn add_transaction_to_multiset<M: Multiset>(multiset: &mut M, tx: &Transaction, block_blue_score: u64) {
    for input in &tx.inputs {
        if let Some(entry) = &input.utxo_entry {
            multiset.remove_utxo(&input.previous_outpoint, entry);
        }
    }
    let id = tx.id();
    for (index, output) in tx.outputs.iter().enumerate() {
        let entry = UtxoEntry::new(output.value, output.script_public_key.clone(), block_blue_score, tx.is_coinbase());
        multiset.add_utxo(&Outpoint::new(id, index as u32), &entry);
    }
}

/// What applying a block's merge set on top of its selected parent produced
pub struct PastUtxoData<M> {
    /// From the selected parent's past UTXO set to this block's
    pub merge_diff: UtxoDiff,
    pub acceptance_data: AcceptanceData,
    pub multiset: M,
}

impl<M: Multiset> ConsensusStateManager<M> {
    /// Applies the merge-set blues of the block described by `data`, in
    /// order, on top of its selected parent's past UTXO set.
    /// `selected_parent_past` is that set expressed against the virtual UTXO set.
    pub(super) fn calculate_past_utxo_and_acceptance(
        &self,
        area: &StagingArea,
        data: &GhostdagData,
        selected_parent_past: &UtxoDiff,
        context: &TxValidationContext,
    ) -> Result<PastUtxoData<M>> {
        let selected_parent = data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant("cannot apply the merge set of genesis".to_string()))?;
        let mut multiset = self.stores.multisets.get(area, &selected_parent)?.as_ref().clone();
        let mut merge_diff = MutableUtxoDiff::new();
        let mut acceptance_data = AcceptanceData::with_capacity(data.merge_set_blues.len());
        let virtual_utxos = self.stores.virtual_utxo_set.view(area);
        let selected_parent_view = DiffView::new(selected_parent_past, &virtual_utxos);

        for (i, blue) in data.merge_set_blues.iter().enumerate() {
            let block = self.stores.blocks.get(area, blue)?;
            let mut transaction_acceptance_data = Vec::with_capacity(block.transactions.len());
            for tx in &block.transactions {
                if tx.is_coinbase() {
                    // Only the selected parent's coinbase enters the UTXO set
                    let is_accepted = i == 0;
                    if is_accepted {
                        merge_diff.add_transaction(tx, data.blue_score)?;
                        add_transaction_to_multiset(&mut multiset, tx, data.blue_score);
                    }
                    transaction_acceptance_data.push(TransactionAcceptanceData {
                        transaction: tx.clone(),
                        fee: 0,
                        is_accepted,
                        transaction_input_utxo_entries: Vec::new(),
                    });
                    continue;
                }

                let mut populated = tx.clone();
                let missing = {
                    let view = DiffView::new(merge_diff.as_immutable(), &selected_parent_view);
                    populate_transaction_inputs(&mut populated, &view)?
                };
                let (is_accepted, fee) = if !missing.is_empty() {
                    trace!(tx = %tx.id(), block = %blue, ?missing, "transaction not accepted: missing outputs");
                    (false, 0)
                } else {
                    match self.tx_validator.validate_in_context(&populated, context) {
                        Ok(fee) => (true, fee),
                        Err(ConsensusError::Rule(err)) => {
                            trace!(tx = %tx.id(), block = %blue, %err, "transaction not accepted");
                            (false, 0)
                        }
                        Err(err) => return Err(err),
                    }
                };
                if is_accepted {
                    merge_diff.add_transaction(&populated, data.blue_score)?;
                    add_transaction_to_multiset(&mut multiset, &populated, data.blue_score);
                }
                let transaction_input_utxo_entries =
                    populated.inputs.iter().filter_map(|input| input.utxo_entry.clone()).collect();
                transaction_acceptance_data.push(TransactionAcceptanceData {
                    transaction: populated,
                    fee,
                    is_accepted,
                    transaction_input_utxo_entries,
                });
            }
            acceptance_data.push(BlockAcceptanceData { block_hash: *blue, transaction_acceptance_data });
        }
        Ok(PastUtxoData { merge_diff: merge_diff.into_immutable(), acceptance_data, multiset })
    }

    /// Multiset and acceptance data that a new block described by `data`
    /// must commit to. Its selected parent must be valid.
    pub fn calculate_commitments(
        &self,
        area: &StagingArea,
        data: &GhostdagData,
        daa_score: u64,
    ) -> Result<(M, AcceptanceData)> {
        let selected_parent = data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant("genesis commitments are fixed".to_string()))?;
        let status = self.stores.status(area, &selected_parent)?;
        if status != BlockStatus::Valid {
            return Err(ConsensusError::Invariant(format!(
                "cannot build on {selected_parent} with status {status}"
            )));
        }
        let selected_parent_past = restore_past_utxo(&self.stores, area, selected_parent)?;
        let context = TxValidationContext {
            blue_score: data.blue_score,
            daa_score,
            past_median_time: self.selected_parent_median_time(area, data)?,
        };
        let past = self.calculate_past_utxo_and_acceptance(area, data, &selected_parent_past, &context)?;
        Ok((past.multiset, past.acceptance_data))
    }

    /// Checks the header commitments of `block` against its computed past,
    /// then its own transactions against that past
    pub(super) fn verify_utxo(
        &self,
        area: &StagingArea,
        block: &Block,
        data: &GhostdagData,
        past: &PastUtxoData<M>,
        past_utxo: &UtxoDiff,
        context: &TxValidationContext,
    ) -> Result<()> {
        let header = &block.header;
        let multiset_hash = past.multiset.hash();
        if header.utxo_commitment != multiset_hash {
            return Err(RuleError::BadUtxoCommitment { expected: multiset_hash, actual: header.utxo_commitment }.into());
        }

        let accepted_ids = past
            .acceptance_data
            .iter()
            .flat_map(|block| block.transaction_acceptance_data.iter())
            .filter(|tx| tx.is_accepted)
            .map(|tx| tx.transaction.id())
            .collect();
        let accepted_id_merkle_root = calc_accepted_id_merkle_root(accepted_ids);
        if header.accepted_id_merkle_root != accepted_id_merkle_root {
            return Err(RuleError::BadAcceptedIdMerkleRoot {
                expected: accepted_id_merkle_root,
                actual: header.accepted_id_merkle_root,
            }
            .into());
        }

        let coinbase = block.transactions.first().ok_or(RuleError::NoTransactions)?;
        let miner_data = self.coinbase.validate_coinbase_payload_in_isolation(coinbase)?.miner_data;
        let expected_coinbase =
            self.coinbase.expected_coinbase_transaction(area, data, &past.acceptance_data, &miner_data)?;
        if expected_coinbase.hash() != coinbase.hash() {
            return Err(RuleError::BadCoinbaseTransaction("coinbase does not pay the expected rewards".to_string()).into());
        }

        // The block's own transactions must be spendable from its past
        let virtual_utxos = self.stores.virtual_utxo_set.view(area);
        let view = DiffView::new(past_utxo, &virtual_utxos);
        for tx in block.transactions.iter().skip(1) {
            let mut populated = tx.clone();
            let missing = populate_transaction_inputs(&mut populated, &view)?;
            if !missing.is_empty() {
                return Err(RuleError::MissingTxOut(missing).into());
            }
            self.tx_validator.validate_in_context(&populated, context)?;
        }
        Ok(())
    }
}
