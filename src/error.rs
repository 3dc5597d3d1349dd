//! Error types for the consensus engine

use thiserror::Error;

use crate::types::{Hash, Outpoint, TransactionId};

/// Consensus rule violations.
///
/// A rule error means the offending block (or transaction) breaks consensus.
/// The block is marked `Invalid` or `DisqualifiedFromChain` and the error is
/// handed back to the caller so the relaying peer can be penalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("block has no transactions")]
    NoTransactions,

    #[error("first transaction is not a coinbase")]
    FirstTxNotCoinbase,

    #[error("transaction at index {0} is a coinbase but is not the first transaction")]
    MultipleCoinbases(usize),

    #[error("block hash merkle root is {actual} but {expected} was expected")]
    BadMerkleRoot { expected: Hash, actual: Hash },

    #[error("block accepted id merkle root is {actual} but {expected} was expected")]
    BadAcceptedIdMerkleRoot { expected: Hash, actual: Hash },

    #[error("block utxo commitment is {actual} but {expected} was expected")]
    BadUtxoCommitment { expected: Hash, actual: Hash },

    #[error("outpoint {0} is spent twice in the same block")]
    DoubleSpendInSameBlock(Outpoint),

    #[error("transaction {0} appears more than once in the block")]
    DuplicateTransactions(TransactionId),

    #[error("bad coinbase transaction: {0}")]
    BadCoinbaseTransaction(String),

    #[error("missing transaction outputs: {0:?}")]
    MissingTxOut(Vec<Outpoint>),

    #[error("header pruning point is {actual} but {expected} was expected")]
    UnexpectedPruningPoint { expected: Hash, actual: Hash },

    #[error("suggested pruning point {0} violates finality")]
    SuggestedPruningViolatesFinality(Hash),

    #[error("imported pruning point utxo set multiset hash {actual} does not match the header commitment {expected}")]
    BadPruningPointUtxoSet { expected: Hash, actual: Hash },

    #[error("pruning point {0} is not the current pruning point")]
    WrongPruningPointHash(Hash),

    #[error("malformed utxo: {0}")]
    MalformedUtxo(String),

    #[error("block is missing parents: {0:?}")]
    MissingParents(Vec<Hash>),

    #[error("block has no parents")]
    NoParents,

    #[error("block has {0} parents which exceeds the limit")]
    TooManyParents(usize),

    #[error("block lists parent {0} more than once")]
    DuplicateParents(Hash),

    #[error("block has invalid ancestor {0}")]
    InvalidAncestor(Hash),

    #[error("block {0} is known to be invalid")]
    KnownInvalid(Hash),

    #[error("block {0} already exists")]
    DuplicateBlock(Hash),

    #[error("merge set has {0} blocks which exceeds the limit")]
    MergeSetTooBig(u64),

    #[error("header blue score is {actual} but {expected} was expected")]
    UnexpectedBlueScore { expected: u64, actual: u64 },

    #[error("header blue work does not match the calculated blue work")]
    UnexpectedBlueWork,

    #[error("header DAA score is {actual} but {expected} was expected")]
    UnexpectedDaaScore { expected: u64, actual: u64 },

    #[error("block timestamp {timestamp} is not after past median time {past_median_time}")]
    TimeTooOld { timestamp: i64, past_median_time: i64 },

    #[error("block mass {0} exceeds the maximum")]
    BlockMassTooHigh(u64),

    #[error("transaction {0} mass {1} exceeds the maximum")]
    TxMassTooHigh(TransactionId, u64),

    #[error("transaction {0} is not finalized")]
    TxNotFinalized(TransactionId),

    #[error("transaction {0} spends immature coinbase output {1}")]
    ImmatureCoinbaseSpend(TransactionId, Outpoint),

    #[error("transaction {0} spends {1} but its inputs only provide {2}")]
    SpendTooHigh(TransactionId, u64, u64),

    #[error("transaction {0} exceeds its sig-op budget")]
    TooManySigOps(TransactionId),

    #[error("transaction {0} is malformed: {1}")]
    MalformedTransaction(TransactionId, String),

    #[error("transaction {0} failed script verification")]
    ScriptVerification(TransactionId),
}

/// Errors surfaced by the consensus engine
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("consensus rule violation: {0}")]
    Rule(#[from] RuleError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("iterator used after it was closed")]
    IteratorClosed,

    #[error("block {0} is not in the selected parent chain of {1}")]
    NotInSelectedChain(Hash, Hash),
}

impl ConsensusError {
    /// Returns the rule error if this is a consensus rule violation
    pub fn as_rule_error(&self) -> Option<&RuleError> {
        match self {
            ConsensusError::Rule(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsensusError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
