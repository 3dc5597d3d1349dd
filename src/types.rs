//! Core block-DAG types shared by every consensus component

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{HASH_SIZE, SUBNETWORK_ID_SIZE};
use crate::error::{ConsensusError, RuleError};

pub use crate::reachability::interval::Interval;

/// 256-bit opaque identifier of blocks and transactions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let array: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            ConsensusError::Deserialization(format!("hash must be {} bytes, got {}", HASH_SIZE, bytes.len()))
        })?;
        Ok(Hash(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Convenience for tests and fixtures: a hash whose last 8 bytes hold `value`
    pub fn from_u64_word(value: u64) -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[HASH_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
        Hash(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ConsensusError> {
        let bytes = hex::decode(s).map_err(|e| ConsensusError::Deserialization(format!("bad hash hex: {e}")))?;
        Hash::from_slice(&bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Transaction identifiers are structurally hashes
pub type TransactionId = Hash;

/// Accumulated proof-of-work, unbounded
pub type BlueWork = BigUint;

/// GHOSTDAG K parameter type
pub type KType = u16;

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub transaction_id: TransactionId,
    pub index: u32,
}

impl Outpoint {
    pub fn new(transaction_id: TransactionId, index: u32) -> Self {
        Self { transaction_id, index }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScriptPublicKey {
    pub version: u16,
    pub script: Vec<u8>,
}

impl ScriptPublicKey {
    pub fn new(version: u16, script: Vec<u8>) -> Self {
        Self { version, script }
    }
}

/// An unspent output as seen from some point of the DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub amount: u64,
    pub script_public_key: ScriptPublicKey,
    pub block_blue_score: u64,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn new(amount: u64, script_public_key: ScriptPublicKey, block_blue_score: u64, is_coinbase: bool) -> Self {
        Self { amount, script_public_key, block_blue_score, is_coinbase }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubnetworkId([u8; SUBNETWORK_ID_SIZE]);

impl SubnetworkId {
    pub const NATIVE: SubnetworkId = SubnetworkId([0u8; SUBNETWORK_ID_SIZE]);
    pub const COINBASE: SubnetworkId =
        SubnetworkId([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

    pub const fn from_bytes(bytes: [u8; SUBNETWORK_ID_SIZE]) -> Self {
        SubnetworkId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SUBNETWORK_ID_SIZE] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_outpoint: Outpoint,
    pub signature_script: Vec<u8>,
    pub sequence: u64,
    pub sig_op_count: u8,
    /// The entry this input spends, populated before contextual validation
    pub utxo_entry: Option<UtxoEntry>,
}

impl TransactionInput {
    pub fn new(previous_outpoint: Outpoint, signature_script: Vec<u8>, sequence: u64, sig_op_count: u8) -> Self {
        Self { previous_outpoint, signature_script, sequence, sig_op_count, utxo_entry: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: u64,
    pub script_public_key: ScriptPublicKey,
}

impl TransactionOutput {
    pub fn new(value: u64, script_public_key: ScriptPublicKey) -> Self {
        Self { value, script_public_key }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u64,
    pub subnetwork_id: SubnetworkId,
    pub gas: u64,
    pub payload: Vec<u8>,
    /// Populated during validation, not part of the id or hash
    pub fee: u64,
    /// Populated during validation, not part of the id or hash
    pub mass: u64,
}

impl Transaction {
    pub fn new(
        version: u16,
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        lock_time: u64,
        subnetwork_id: SubnetworkId,
        gas: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self { version, inputs, outputs, lock_time, subnetwork_id, gas, payload, fee: 0, mass: 0 }
    }

    pub fn is_coinbase(&self) -> bool {
        self.subnetwork_id == SubnetworkId::COINBASE
    }

    pub fn id(&self) -> TransactionId {
        crate::hashing::transaction_id(self)
    }

    pub fn hash(&self) -> Hash {
        crate::hashing::transaction_hash(self)
    }
}

/// Block header. Immutable once built; see [`MutableBlockHeader`] for mining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u16,
    /// Parent hashes grouped by block level; level 0 holds the direct parents
    pub parents: Vec<Vec<Hash>>,
    pub hash_merkle_root: Hash,
    pub accepted_id_merkle_root: Hash,
    pub utxo_commitment: Hash,
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_score: u64,
    pub blue_work: BlueWork,
    pub pruning_point: Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        crate::hashing::header_hash(self)
    }

    pub fn direct_parents(&self) -> &[Hash] {
        self.parents.first().map(|p| p.as_slice()).unwrap_or(&[])
    }
}

/// A header under construction. Only the nonce and timestamp may change.
#[derive(Debug, Clone)]
pub struct MutableBlockHeader {
    header: BlockHeader,
}

impl MutableBlockHeader {
    pub fn new(header: BlockHeader) -> Self {
        Self { header }
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.header.nonce = nonce;
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.header.timestamp = timestamp;
    }

    pub fn nonce(&self) -> u64 {
        self.header.nonce
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn to_immutable(&self) -> BlockHeader {
        self.header.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn is_header_only(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Output of the GHOSTDAG protocol for a single block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostdagData {
    pub blue_score: u64,
    pub blue_work: BlueWork,
    pub selected_parent: Option<Hash>,
    pub merge_set_blues: Vec<Hash>,
    pub merge_set_reds: Vec<Hash>,
    pub blues_anticone_sizes: BTreeMap<Hash, KType>,
}

impl GhostdagData {
    pub fn genesis() -> Self {
        Self {
            blue_score: 0,
            blue_work: BlueWork::default(),
            selected_parent: None,
            merge_set_blues: Vec::new(),
            merge_set_reds: Vec::new(),
            blues_anticone_sizes: BTreeMap::new(),
        }
    }

    /// Starts a new block's data: the selected parent is the first blue
    pub fn new_with_selected_parent(selected_parent: Hash) -> Self {
        let mut blues_anticone_sizes = BTreeMap::new();
        blues_anticone_sizes.insert(selected_parent, 0);
        Self {
            blue_score: 0,
            blue_work: BlueWork::default(),
            selected_parent: Some(selected_parent),
            merge_set_blues: vec![selected_parent],
            merge_set_reds: Vec::new(),
            blues_anticone_sizes,
        }
    }

    pub fn add_blue(&mut self, block: Hash, anticone_size: KType, blues_anticone_sizes: &BTreeMap<Hash, KType>) {
        self.merge_set_blues.push(block);
        self.blues_anticone_sizes.insert(block, anticone_size);
        for (blue, size) in blues_anticone_sizes {
            self.blues_anticone_sizes.insert(*blue, size + 1);
        }
    }

    pub fn add_red(&mut self, block: Hash) {
        self.merge_set_reds.push(block);
    }

    pub fn merge_set(&self) -> impl Iterator<Item = &Hash> {
        self.merge_set_blues.iter().chain(self.merge_set_reds.iter())
    }

    pub fn merge_set_size(&self) -> usize {
        self.merge_set_blues.len() + self.merge_set_reds.len()
    }

    pub fn to_sortable(&self, hash: Hash) -> crate::dag_traversal::SortableBlock {
        crate::dag_traversal::SortableBlock::new(hash, self.blue_work.clone(), self.blue_score)
    }
}

/// Reachability tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityData {
    pub parent: Option<Hash>,
    pub children: Vec<Hash>,
    pub interval: Interval,
    pub future_covering_set: Vec<Hash>,
    pub height: u64,
}

impl ReachabilityData {
    pub fn new(parent: Option<Hash>, interval: Interval, height: u64) -> Self {
        Self { parent, children: Vec::new(), interval, future_covering_set: Vec::new(), height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockStatus {
    Invalid = 0,
    Valid = 1,
    UtxoPendingVerification = 2,
    DisqualifiedFromChain = 3,
    HeaderOnly = 4,
}

impl BlockStatus {
    pub fn from_u8(value: u8) -> Result<Self, ConsensusError> {
        match value {
            0 => Ok(BlockStatus::Invalid),
            1 => Ok(BlockStatus::Valid),
            2 => Ok(BlockStatus::UtxoPendingVerification),
            3 => Ok(BlockStatus::DisqualifiedFromChain),
            4 => Ok(BlockStatus::HeaderOnly),
            other => Err(ConsensusError::Deserialization(format!("unknown block status {other}"))),
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, BlockStatus::HeaderOnly | BlockStatus::Invalid)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Invalid => "Invalid",
            BlockStatus::Valid => "Valid",
            BlockStatus::UtxoPendingVerification => "UTXOPendingVerification",
            BlockStatus::DisqualifiedFromChain => "DisqualifiedFromChain",
            BlockStatus::HeaderOnly => "HeaderOnly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockRelations {
    pub parents: Vec<Hash>,
    pub children: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAcceptanceData {
    pub transaction: Transaction,
    pub fee: u64,
    pub is_accepted: bool,
    pub transaction_input_utxo_entries: Vec<UtxoEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAcceptanceData {
    pub block_hash: Hash,
    pub transaction_acceptance_data: Vec<TransactionAcceptanceData>,
}

/// One entry per merge-set blue, selected parent first
pub type AcceptanceData = Vec<BlockAcceptanceData>;

/// Miner payout information carried in the coinbase payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MinerData {
    pub script_public_key: ScriptPublicKey,
    pub extra_data: Vec<u8>,
}

impl MinerData {
    pub fn new(script_public_key: ScriptPublicKey, extra_data: Vec<u8>) -> Self {
        Self { script_public_key, extra_data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub exists: bool,
    pub status: Option<BlockStatus>,
    pub blue_score: u64,
    pub blue_work: BlueWork,
    pub selected_parent: Option<Hash>,
    pub merge_set_blues: Vec<Hash>,
    pub merge_set_reds: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    pub header_count: usize,
    pub block_count: usize,
    pub headers_selected_tip: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualInfo {
    pub parent_hashes: Vec<Hash>,
    pub bits: u32,
    pub past_median_time: i64,
    pub blue_score: u64,
    pub daa_score: u64,
}

/// Selected-parent-chain changes between two virtual states
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectedChainPath {
    /// Blocks leaving the chain, top-down
    pub removed: Vec<Hash>,
    /// Blocks joining the chain, bottom-up
    pub added: Vec<Hash>,
}

impl SelectedChainPath {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInsertionResult {
    pub virtual_selected_parent_chain_changes: Option<SelectedChainPath>,
    pub status: BlockStatus,
    /// Set when UTXO verification disqualified the block from the chain
    pub disqualification: Option<RuleError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGhostdagDataHashPair {
    pub hash: Hash,
    pub ghostdag_data: GhostdagData,
}

/// A block sent during pruning-point sync along with the data a fresh node
/// cannot compute on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWithTrustedData {
    pub block: Block,
    /// GHOSTDAG data of the block and its selected-chain ancestors
    pub ghostdag_data: Vec<BlockGhostdagDataHashPair>,
    /// Headers of the blocks in the block's past-median-time window
    pub window_headers: Vec<BlockHeader>,
}

/// Side-channel notifications, buffered until drained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    BlockAdded { hash: Hash, status: BlockStatus },
    VirtualChanged { chain_changes: SelectedChainPath, virtual_parents: Vec<Hash> },
    FinalityConflictDetected { violating_block: Hash, finality_point: Hash },
    PruningPointMoved { pruning_point: Hash, index: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_round_trip_and_display() {
        let hash = Hash::from_u64_word(0xdead_beef);
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.ends_with("deadbeef"));
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
        assert!(Hash::from_hex("zz").is_err());
        assert!(Hash::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_hash_serde_uses_hex_strings() {
        let hash = Hash::from_u64_word(7);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_ghostdag_add_blue_updates_anticone_sizes() {
        let sp = Hash::from_u64_word(1);
        let other = Hash::from_u64_word(2);
        let mut data = GhostdagData::new_with_selected_parent(sp);
        let mut sizes = BTreeMap::new();
        sizes.insert(sp, 0);
        data.add_blue(other, 1, &sizes);
        assert_eq!(data.merge_set_blues, vec![sp, other]);
        assert_eq!(data.blues_anticone_sizes[&other], 1);
        assert_eq!(data.blues_anticone_sizes[&sp], 1);
        data.add_red(Hash::from_u64_word(3));
        assert_eq!(data.merge_set_size(), 3);
    }

    #[test]
    fn test_block_status_from_u8() {
        for status in [
            BlockStatus::Invalid,
            BlockStatus::Valid,
            BlockStatus::UtxoPendingVerification,
            BlockStatus::DisqualifiedFromChain,
            BlockStatus::HeaderOnly,
        ] {
            assert_eq!(BlockStatus::from_u8(status as u8).unwrap(), status);
        }
        assert!(BlockStatus::from_u8(9).is_err());
    }

    #[test]
    fn test_mutable_header_only_touches_nonce_and_timestamp() {
        let header = BlockHeader {
            version: 1,
            parents: vec![vec![Hash::from_u64_word(1)]],
            hash_merkle_root: Hash::default(),
            accepted_id_merkle_root: Hash::default(),
            utxo_commitment: Hash::default(),
            timestamp: 10,
            bits: 0x207fffff,
            nonce: 0,
            daa_score: 1,
            blue_score: 1,
            blue_work: BlueWork::from(2u32),
            pruning_point: Hash::default(),
        };
        let mut mutable = MutableBlockHeader::new(header.clone());
        mutable.set_nonce(42);
        mutable.set_timestamp(99);
        let built = mutable.to_immutable();
        assert_eq!(built.nonce, 42);
        assert_eq!(built.timestamp, 99);
        assert_eq!(built.parents, header.parents);
        assert_ne!(built.hash(), header.hash());
    }
}
