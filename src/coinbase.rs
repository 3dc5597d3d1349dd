//! Coinbase payloads, block subsidy and the expected coinbase transaction

use std::collections::HashMap;

use crate::constants::TX_VERSION;
use crate::error::{ConsensusError, Result, RuleError};
use crate::serialization::{write_u16, write_u64, write_u8, Reader};
use crate::staging::StagingArea;
use crate::stores::BlockStore;
use crate::types::{AcceptanceData, GhostdagData, Hash, MinerData, ScriptPublicKey, SubnetworkId, Transaction, TransactionOutput};

/// Decoded coinbase payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseData {
    pub blue_score: u64,
    pub subsidy: u64,
    pub miner_data: MinerData,
}

/// Layout: blue score (u64), subsidy (u64), script version (u16), script
/// length (u8), script, then free-form extra data
pub fn serialize_coinbase_payload(data: &CoinbaseData) -> Vec<u8> {
    let script = &data.miner_data.script_public_key.script;
    let mut payload = Vec::with_capacity(8 + 8 + 2 + 1 + script.len() + data.miner_data.extra_data.len());
    write_u64(&mut payload, data.blue_score);
    write_u64(&mut payload, data.subsidy);
    write_u16(&mut payload, data.miner_data.script_public_key.version);
    // Valid payload scripts are bounded by the configured limit, well below u8::MAX
    write_u8(&mut payload, script.len().min(u8::MAX as usize) as u8);
    payload.extend_from_slice(script);
    payload.extend_from_slice(&data.miner_data.extra_data);
    payload
}

fn bad_payload(reason: impl Into<String>) -> ConsensusError {
    RuleError::BadCoinbaseTransaction(reason.into()).into()
}

pub fn deserialize_coinbase_payload(payload: &[u8]) -> Result<CoinbaseData> {
    let mut reader = Reader::new(payload);
    let blue_score = reader.read_u64().map_err(|_| bad_payload("payload too short for blue score"))?;
    let subsidy = reader.read_u64().map_err(|_| bad_payload("payload too short for subsidy"))?;
    let version = reader.read_u16().map_err(|_| bad_payload("payload too short for script version"))?;
    let script_len = reader.read_u8().map_err(|_| bad_payload("payload too short for script length"))? as usize;
    let header_len = 8 + 8 + 2 + 1;
    if payload.len() < header_len + script_len {
        return Err(bad_payload(format!("script length {script_len} exceeds the payload")));
    }
    let script = payload[header_len..header_len + script_len].to_vec();
    let extra_data = payload[header_len + script_len..].to_vec();
    Ok(CoinbaseData {
        blue_score,
        subsidy,
        miner_data: MinerData::new(ScriptPublicKey::new(version, script), extra_data),
    })
}

#[derive(Clone)]
pub struct CoinbaseManager {
    base_subsidy: u64,
    subsidy_halving_interval: u64,
    max_coinbase_payload_script_len: usize,
    blocks: BlockStore,
}

impl CoinbaseManager {
    pub fn new(
        base_subsidy: u64,
        subsidy_halving_interval: u64,
        max_coinbase_payload_script_len: usize,
        blocks: BlockStore,
    ) -> Self {
        Self { base_subsidy, subsidy_halving_interval, max_coinbase_payload_script_len, blocks }
    }

    /// Subsidy at `blue_score`: the base subsidy halved once per
    /// `subsidy_halving_interval`, zero after 64 halvings
    pub fn calc_block_subsidy(&self, blue_score: u64) -> u64 {
        let halvings = blue_score / self.subsidy_halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.base_subsidy >> halvings
    }

    /// Checks that a coinbase payload parses and respects the script length limit
    pub fn validate_coinbase_payload_in_isolation(&self, coinbase: &Transaction) -> Result<CoinbaseData> {
        let data = deserialize_coinbase_payload(&coinbase.payload)?;
        if data.miner_data.script_public_key.script.len() > self.max_coinbase_payload_script_len {
            return Err(bad_payload(format!(
                "payload script is {} bytes, limit is {}",
                data.miner_data.script_public_key.script.len(),
                self.max_coinbase_payload_script_len
            )));
        }
        Ok(data)
    }

    /// Checks the payload's blue score and subsidy against the block being validated
    pub fn validate_coinbase_payload_in_context(&self, coinbase: &Transaction, blue_score: u64) -> Result<()> {
        let data = self.validate_coinbase_payload_in_isolation(coinbase)?;
        if data.blue_score != blue_score {
            return Err(bad_payload(format!("payload blue score {} but block has {blue_score}", data.blue_score)));
        }
        let expected_subsidy = self.calc_block_subsidy(blue_score);
        if data.subsidy != expected_subsidy {
            return Err(bad_payload(format!("payload subsidy {} but {expected_subsidy} was expected", data.subsidy)));
        }
        Ok(())
    }

    fn merged_block_coinbase_data(&self, area: &StagingArea, block: &Hash) -> Result<CoinbaseData> {
        let body = self.blocks.get(area, block)?;
        let coinbase = body
            .transactions
            .first()
            .ok_or_else(|| ConsensusError::Invariant(format!("stored block {block} has no coinbase")))?;
        deserialize_coinbase_payload(&coinbase.payload)
    }

    /// The only coinbase a block with `ghostdag_data` and `acceptance_data` may carry.
    ///
    /// Every merge-set blue is paid its subsidy plus the fees of its accepted
    /// transactions; the accepting block's miner collects the subsidies of the
    /// merge-set reds. Zero-value outputs are left out.
    pub fn expected_coinbase_transaction(
        &self,
        area: &StagingArea,
        ghostdag_data: &GhostdagData,
        acceptance_data: &AcceptanceData,
        miner_data: &MinerData,
    ) -> Result<Transaction> {
        let fees: HashMap<Hash, u64> = acceptance_data
            .iter()
            .map(|block| {
                let total = block
                    .transaction_acceptance_data
                    .iter()
                    .filter(|tx| tx.is_accepted)
                    .fold(0u64, |sum, tx| sum.saturating_add(tx.fee));
                (block.block_hash, total)
            })
            .collect();

        let mut outputs = Vec::with_capacity(ghostdag_data.merge_set_blues.len() + 1);
        for blue in &ghostdag_data.merge_set_blues {
            let data = self.merged_block_coinbase_data(area, blue)?;
            let reward = data.subsidy.saturating_add(fees.get(blue).copied().unwrap_or(0));
            if reward > 0 {
                outputs.push(TransactionOutput::new(reward, data.miner_data.script_public_key));
            }
        }

        let mut red_reward = 0u64;
        for red in &ghostdag_data.merge_set_reds {
            red_reward = red_reward.saturating_add(self.merged_block_coinbase_data(area, red)?.subsidy);
        }
        if red_reward > 0 {
            outputs.push(TransactionOutput::new(red_reward, miner_data.script_public_key.clone()));
        }

        let payload = serialize_coinbase_payload(&CoinbaseData {
            blue_score: ghostdag_data.blue_score,
            subsidy: self.calc_block_subsidy(ghostdag_data.blue_score),
            miner_data: miner_data.clone(),
        });
        Ok(Transaction::new(TX_VERSION, Vec::new(), outputs, 0, SubnetworkId::COINBASE, 0, payload))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::SOMPI_PER_COIN;
    use crate::database::{Database, MemoryDatabase};
    use crate::stores::CachedStore;

    fn manager() -> CoinbaseManager {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        CoinbaseManager::new(50 * SOMPI_PER_COIN, 1_000, 150, CachedStore::new("block", db, 10))
    }

    #[test]
    fn test_payload_layout() {
        let data = CoinbaseData {
            blue_score: 7,
            subsidy: 9,
            miner_data: MinerData::new(ScriptPublicKey::new(3, vec![0xaa, 0xbb]), b"hi".to_vec()),
        };
        let payload = serialize_coinbase_payload(&data);
        assert_eq!(payload.len(), 8 + 8 + 2 + 1 + 2 + 2);
        assert_eq!(&payload[..8], &7u64.to_le_bytes());
        assert_eq!(payload[18], 2);
        assert_eq!(deserialize_coinbase_payload(&payload).unwrap(), data);
    }

    #[test]
    fn test_truncated_payload_is_a_rule_error() {
        let err = deserialize_coinbase_payload(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err.as_rule_error(), Some(RuleError::BadCoinbaseTransaction(_))));

        let mut payload = serialize_coinbase_payload(&CoinbaseData {
            blue_score: 1,
            subsidy: 1,
            miner_data: MinerData::default(),
        });
        payload[18] = 40;
        assert!(deserialize_coinbase_payload(&payload).is_err());
    }

    #[test]
    fn test_subsidy_halves() {
        let manager = manager();
        assert_eq!(manager.calc_block_subsidy(0), 50 * SOMPI_PER_COIN);
        assert_eq!(manager.calc_block_subsidy(999), 50 * SOMPI_PER_COIN);
        assert_eq!(manager.calc_block_subsidy(1_000), 25 * SOMPI_PER_COIN);
        assert_eq!(manager.calc_block_subsidy(2_500), 50 * SOMPI_PER_COIN / 4);
        assert_eq!(manager.calc_block_subsidy(64_000), 0);
    }

    #[test]
    fn test_payload_context_checks() {
        let manager = manager();
        let payload = serialize_coinbase_payload(&CoinbaseData {
            blue_score: 5,
            subsidy: manager.calc_block_subsidy(5),
            miner_data: MinerData::default(),
        });
        let coinbase = Transaction::new(TX_VERSION, vec![], vec![], 0, SubnetworkId::COINBASE, 0, payload);
        manager.validate_coinbase_payload_in_context(&coinbase, 5).unwrap();
        assert!(manager.validate_coinbase_payload_in_context(&coinbase, 6).is_err());
    }
}
