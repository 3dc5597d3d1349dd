//! Consensus parameters
//!
//! A [`Config`] is fixed when the engine is constructed and read-only after
//! that. Presets cover a mainnet-like parameter set and a small simnet used
//! by tests; anything else can be loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coinbase::{serialize_coinbase_payload, CoinbaseData};
use crate::constants::{BLOCK_VERSION, SOMPI_PER_COIN, TX_VERSION, ZERO_HASH};
use crate::error::{ConsensusError, Result};
use crate::hashing::calc_hash_merkle_root;
use crate::types::{Block, BlockHeader, BlueWork, Hash, KType, MinerData, SubnetworkId, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Network name, informational only
    pub name: String,
    pub genesis: Block,
    pub ghostdag_k: KType,
    pub finality_depth: u64,
    pub pruning_depth: u64,
    pub max_block_parents: usize,
    pub merge_set_size_limit: u64,
    pub max_block_mass: u64,
    /// Maximum mass of a single transaction accepted by a block
    pub max_tx_mass: u64,
    pub mass_per_tx_byte: u64,
    pub mass_per_script_pub_key_byte: u64,
    pub mass_per_sig_op: u64,
    pub coinbase_maturity: u64,
    pub base_subsidy: u64,
    pub subsidy_halving_interval: u64,
    pub max_coinbase_payload_script_len: usize,
    pub timestamp_deviation_tolerance: u64,
    pub reachability_reindex_depth: u64,
    pub reachability_reindex_slack: u64,
    /// Entries kept per cached store
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet_like()
    }
}

impl Config {
    pub fn mainnet_like() -> Self {
        Self {
            name: "mainnet-like".to_string(),
            genesis: build_genesis_block(1_637_609_671_037, 0x1e7fffff, b"blockdag genesis".to_vec()),
            ghostdag_k: 18,
            finality_depth: 86_400,
            pruning_depth: 185_798,
            max_block_parents: 10,
            merge_set_size_limit: 180,
            max_block_mass: 500_000,
            max_tx_mass: 100_000,
            mass_per_tx_byte: 1,
            mass_per_script_pub_key_byte: 10,
            mass_per_sig_op: 1_000,
            coinbase_maturity: 100,
            base_subsidy: 50 * SOMPI_PER_COIN,
            subsidy_halving_interval: 2_100_000,
            max_coinbase_payload_script_len: 150,
            timestamp_deviation_tolerance: 132,
            reachability_reindex_depth: 100,
            reachability_reindex_slack: 1 << 12,
            cache_size: 10_000,
        }
    }

    /// Small depths so tests can cross finality and pruning boundaries quickly
    pub fn simnet() -> Self {
        Self {
            name: "simnet".to_string(),
            genesis: build_genesis_block(1_600_000_000_000, 0x207fffff, b"simnet genesis".to_vec()),
            ghostdag_k: 3,
            finality_depth: 10,
            pruning_depth: 20,
            max_block_parents: 10,
            merge_set_size_limit: 30,
            max_block_mass: 500_000,
            max_tx_mass: 100_000,
            mass_per_tx_byte: 1,
            mass_per_script_pub_key_byte: 10,
            mass_per_sig_op: 1_000,
            coinbase_maturity: 2,
            base_subsidy: 50 * SOMPI_PER_COIN,
            subsidy_halving_interval: 1_000,
            max_coinbase_payload_script_len: 150,
            timestamp_deviation_tolerance: 5,
            reachability_reindex_depth: 100,
            reachability_reindex_slack: 1 << 12,
            cache_size: 1_000,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| ConsensusError::Config(format!("invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConsensusError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConsensusError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ghostdag_k == 0 {
            return Err(ConsensusError::Config("ghostdag_k must be positive".to_string()));
        }
        if self.finality_depth == 0 {
            return Err(ConsensusError::Config("finality_depth must be positive".to_string()));
        }
        if self.pruning_depth < self.finality_depth {
            return Err(ConsensusError::Config(format!(
                "pruning_depth {} is below finality_depth {}",
                self.pruning_depth, self.finality_depth
            )));
        }
        if self.max_block_parents == 0 {
            return Err(ConsensusError::Config("max_block_parents must be positive".to_string()));
        }
        if self.merge_set_size_limit <= self.ghostdag_k as u64 {
            return Err(ConsensusError::Config("merge_set_size_limit must exceed ghostdag_k".to_string()));
        }
        if self.timestamp_deviation_tolerance == 0 {
            return Err(ConsensusError::Config("timestamp_deviation_tolerance must be positive".to_string()));
        }
        if self.reachability_reindex_depth == 0 || self.reachability_reindex_slack == 0 {
            return Err(ConsensusError::Config("reachability reindex parameters must be positive".to_string()));
        }
        if self.subsidy_halving_interval == 0 {
            return Err(ConsensusError::Config("subsidy_halving_interval must be positive".to_string()));
        }
        if self.max_coinbase_payload_script_len > u8::MAX as usize {
            return Err(ConsensusError::Config("coinbase payload scripts are length-prefixed by one byte".to_string()));
        }
        if !self.genesis.header.direct_parents().is_empty() {
            return Err(ConsensusError::Config("genesis must not have parents".to_string()));
        }
        match self.genesis.transactions.first() {
            Some(tx) if tx.is_coinbase() => Ok(()),
            _ => Err(ConsensusError::Config("genesis must start with a coinbase".to_string())),
        }
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis.hash()
    }

    /// Size of the blue window used for past median time
    pub fn past_median_time_window_size(&self) -> usize {
        (2 * self.timestamp_deviation_tolerance - 1) as usize
    }
}

/// Builds a genesis block whose coinbase pays nothing
pub fn build_genesis_block(timestamp: i64, bits: u32, extra_data: Vec<u8>) -> Block {
    let payload = serialize_coinbase_payload(&CoinbaseData {
        blue_score: 0,
        subsidy: 0,
        miner_data: MinerData::new(Default::default(), extra_data),
    });
    let coinbase = Transaction::new(TX_VERSION, vec![], vec![], 0, SubnetworkId::COINBASE, 0, payload);
    let header = BlockHeader {
        version: BLOCK_VERSION,
        parents: vec![],
        hash_merkle_root: calc_hash_merkle_root(std::slice::from_ref(&coinbase)),
        accepted_id_merkle_root: ZERO_HASH,
        utxo_commitment: ZERO_HASH,
        timestamp,
        bits,
        nonce: 0,
        daa_score: 0,
        blue_score: 0,
        blue_work: BlueWork::default(),
        pruning_point: ZERO_HASH,
    };
    Block::new(header, vec![coinbase])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        Config::mainnet_like().validate().unwrap();
        Config::simnet().validate().unwrap();
        assert_eq!(Config::default(), Config::mainnet_like());
        assert_ne!(Config::simnet().genesis_hash(), Config::mainnet_like().genesis_hash());
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::simnet();
        let json = config.to_json_string().unwrap();
        let loaded = Config::from_json_str(&json).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.genesis_hash(), config.genesis_hash());
    }

    #[test]
    fn test_validate_rejects_bad_depths() {
        let mut config = Config::simnet();
        config.pruning_depth = config.finality_depth - 1;
        assert!(matches!(config.validate(), Err(ConsensusError::Config(_))));

        let mut config = Config::simnet();
        config.ghostdag_k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::simnet();
        config.merge_set_size_limit = config.ghostdag_k as u64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_str_reports_config_error() {
        let err = Config::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConsensusError::Config(_)));
    }

    #[test]
    fn test_past_median_time_window_size() {
        let config = Config::simnet();
        assert_eq!(config.past_median_time_window_size(), 9);
    }
}
