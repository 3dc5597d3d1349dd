//! Protocol constants that are not configurable per network

use crate::types::Hash;

/// Size of block and transaction hashes in bytes
pub const HASH_SIZE: usize = 32;

/// Size of a subnetwork id in bytes
pub const SUBNETWORK_ID_SIZE: usize = 20;

/// All-zero hash, used as "no hash" in headers and Merkle padding
pub const ZERO_HASH: Hash = Hash::from_bytes([0u8; HASH_SIZE]);

/// The ephemeral virtual block. Never persisted as a real block.
pub const VIRTUAL_BLOCK_HASH: Hash = Hash::from_bytes([0xff; HASH_SIZE]);

/// Synthetic root of the reachability tree, the tree parent of genesis
pub const VIRTUAL_GENESIS_BLOCK_HASH: Hash = Hash::from_bytes([0xfe; HASH_SIZE]);

/// Smallest unit per coin
pub const SOMPI_PER_COIN: u64 = 100_000_000;

/// Maximum amount a single output (or the sum of a transaction's outputs) may carry
pub const MAX_SOMPI: u64 = 29_000_000_000 * SOMPI_PER_COIN;

/// Lock times below this threshold are DAA scores, above it millisecond timestamps
pub const LOCK_TIME_THRESHOLD: u64 = 500_000_000_000;

/// An input with this sequence opts out of lock-time enforcement
pub const MAX_TX_IN_SEQUENCE_NUM: u64 = u64::MAX;

/// Upper bound on the declared signature operations of one transaction
pub const MAX_TX_SIG_OPS: u64 = 1_000;

/// Interval space of the reachability root
pub const REACHABILITY_INTERVAL_START: u64 = 1;
pub const REACHABILITY_INTERVAL_END: u64 = u64::MAX - 1;

/// Current block header version
pub const BLOCK_VERSION: u16 = 1;

/// Current transaction version
pub const TX_VERSION: u16 = 0;

/// Number of UTXO entries moved per write when swapping UTXO buckets
pub const UTXO_SWAP_CHUNK_SIZE: usize = 1_000;
