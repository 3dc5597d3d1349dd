//! Transaction validation
//!
//! Checks split into the context-free part (structure, amounts, mass) and the
//! part that needs populated UTXO entries and the accepting block's position
//! in the DAG. Script execution is an extension point.

use std::collections::HashSet;

use crate::constants::{LOCK_TIME_THRESHOLD, MAX_SOMPI, MAX_TX_IN_SEQUENCE_NUM, MAX_TX_SIG_OPS, TX_VERSION};
use crate::error::{Result, RuleError};
use crate::serialization::encode_transaction_for_hashing;
use crate::types::{Outpoint, SubnetworkId, Transaction};

/// Where in the DAG a transaction is being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxValidationContext {
    /// Blue score of the accepting block, used for coinbase maturity
    pub blue_score: u64,
    /// DAA score of the accepting block, used for score-based lock times
    pub daa_score: u64,
    /// Past median time of the accepting block's selected parent
    pub past_median_time: i64,
}

pub trait TransactionValidator: Send + Sync {
    fn validate_in_isolation(&self, tx: &Transaction) -> Result<()>;

    /// Validates a transaction whose inputs carry their UTXO entries. Returns the fee.
    fn validate_in_context(&self, tx: &Transaction, context: &TxValidationContext) -> Result<u64>;

    fn calculate_mass(&self, tx: &Transaction) -> u64;

    /// Signature and script checks. Accepts everything unless overridden.
    fn verify_scripts(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DefaultTransactionValidator {
    pub max_tx_mass: u64,
    pub mass_per_tx_byte: u64,
    pub mass_per_script_pub_key_byte: u64,
    pub mass_per_sig_op: u64,
    pub coinbase_maturity: u64,
}

impl DefaultTransactionValidator {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_tx_mass: config.max_tx_mass,
            mass_per_tx_byte: config.mass_per_tx_byte,
            mass_per_script_pub_key_byte: config.mass_per_script_pub_key_byte,
            mass_per_sig_op: config.mass_per_sig_op,
            coinbase_maturity: config.coinbase_maturity,
        }
    }

    fn check_outputs(&self, tx: &Transaction) -> Result<()> {
        let id = tx.id();
        let mut total: u64 = 0;
        for (index, output) in tx.outputs.iter().enumerate() {
            if output.value > MAX_SOMPI {
                return Err(RuleError::MalformedTransaction(id, format!("output {index} value {} is too high", output.value)).into());
            }
            total = total
                .checked_add(output.value)
                .filter(|total| *total <= MAX_SOMPI)
                .ok_or_else(|| RuleError::MalformedTransaction(id, "total output value is too high".to_string()))?;
        }
        Ok(())
    }

    fn check_inputs(&self, tx: &Transaction) -> Result<()> {
        let id = tx.id();
        if tx.is_coinbase() {
            if !tx.inputs.is_empty() {
                return Err(RuleError::MalformedTransaction(id, "coinbase has inputs".to_string()).into());
            }
            return Ok(());
        }
        if tx.inputs.is_empty() {
            return Err(RuleError::MalformedTransaction(id, "transaction has no inputs".to_string()).into());
        }
        let mut seen: HashSet<Outpoint> = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !seen.insert(input.previous_outpoint) {
                return Err(RuleError::MalformedTransaction(
                    id,
                    format!("outpoint {} is spent twice", input.previous_outpoint),
                )
                .into());
            }
        }
        let sig_ops: u64 = tx.inputs.iter().map(|input| input.sig_op_count as u64).sum();
        if sig_ops > MAX_TX_SIG_OPS {
            return Err(RuleError::TooManySigOps(id).into());
        }
        Ok(())
    }

    fn check_subnetwork(&self, tx: &Transaction) -> Result<()> {
        let id = tx.id();
        if tx.subnetwork_id == SubnetworkId::NATIVE && !tx.payload.is_empty() {
            return Err(RuleError::MalformedTransaction(id, "native transaction carries a payload".to_string()).into());
        }
        if (tx.subnetwork_id == SubnetworkId::NATIVE || tx.is_coinbase()) && tx.gas != 0 {
            return Err(RuleError::MalformedTransaction(id, "gas is only allowed on other subnetworks".to_string()).into());
        }
        Ok(())
    }

    fn check_lock_time(&self, tx: &Transaction, context: &TxValidationContext) -> Result<()> {
        if tx.lock_time == 0 {
            return Ok(());
        }
        let block_time = if tx.lock_time < LOCK_TIME_THRESHOLD {
            context.daa_score
        } else {
            context.past_median_time.max(0) as u64
        };
        if tx.lock_time < block_time {
            return Ok(());
        }
        // A pending lock time is ignored when every input opted out
        if tx.inputs.iter().all(|input| input.sequence == MAX_TX_IN_SEQUENCE_NUM) {
            return Ok(());
        }
        Err(RuleError::TxNotFinalized(tx.id()).into())
    }
}

impl TransactionValidator for DefaultTransactionValidator {
    fn validate_in_isolation(&self, tx: &Transaction) -> Result<()> {
        if tx.version > TX_VERSION {
            return Err(RuleError::MalformedTransaction(tx.id(), format!("unknown version {}", tx.version)).into());
        }
        self.check_inputs(tx)?;
        self.check_outputs(tx)?;
        self.check_subnetwork(tx)?;
        let mass = self.calculate_mass(tx);
        if mass > self.max_tx_mass {
            return Err(RuleError::TxMassTooHigh(tx.id(), mass).into());
        }
        Ok(())
    }

    fn validate_in_context(&self, tx: &Transaction, context: &TxValidationContext) -> Result<u64> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let id = tx.id();
        let missing: Vec<Outpoint> =
            tx.inputs.iter().filter(|input| input.utxo_entry.is_none()).map(|input| input.previous_outpoint).collect();
        if !missing.is_empty() {
            return Err(RuleError::MissingTxOut(missing).into());
        }

        let mut total_in: u64 = 0;
        for input in &tx.inputs {
            let Some(entry) = &input.utxo_entry else { continue };
            if entry.is_coinbase && context.blue_score < entry.block_blue_score.saturating_add(self.coinbase_maturity) {
                return Err(RuleError::ImmatureCoinbaseSpend(id, input.previous_outpoint).into());
            }
            if entry.amount > MAX_SOMPI {
                return Err(RuleError::MalformedTransaction(id, format!("input {} amount is too high", input.previous_outpoint)).into());
            }
            total_in = total_in
                .checked_add(entry.amount)
                .filter(|total| *total <= MAX_SOMPI)
                .ok_or_else(|| RuleError::MalformedTransaction(id, "total input value is too high".to_string()))?;
        }
        let total_out: u64 = tx.outputs.iter().map(|output| output.value).sum();
        if total_in < total_out {
            return Err(RuleError::SpendTooHigh(id, total_out, total_in).into());
        }

        self.check_lock_time(tx, context)?;
        let mass = self.calculate_mass(tx);
        if mass > self.max_tx_mass {
            return Err(RuleError::TxMassTooHigh(id, mass).into());
        }
        self.verify_scripts(tx)?;
        Ok(total_in - total_out)
    }

    /// Serialized size, plus output script bytes and declared sig ops at their own rates
    fn calculate_mass(&self, tx: &Transaction) -> u64 {
        let size = serialized_size(tx);
        let size_mass = size * self.mass_per_tx_byte;
        if tx.is_coinbase() {
            return size_mass;
        }
        let script_bytes: u64 =
            tx.outputs.iter().map(|output| 2 + output.script_public_key.script.len() as u64).sum();
        let sig_ops: u64 = tx.inputs.iter().map(|input| input.sig_op_count as u64).sum();
        size_mass + script_bytes * self.mass_per_script_pub_key_byte + sig_ops * self.mass_per_sig_op
    }
}

/// Size of the consensus encoding, which leaves out populated entries, fee and mass
pub fn serialized_size(tx: &Transaction) -> u64 {
    let mut buf = Vec::new();
    encode_transaction_for_hashing(tx, true, &mut buf);
    buf.len() as u64
}
