//! # blockdag-consensus
//!
//! Consensus core for a proof-of-work block DAG ordered by GHOSTDAG.
//!
//! Blocks may have many parents. GHOSTDAG colors every block blue or red and
//! picks a selected parent, which yields a total order over the DAG and a
//! selected parent chain ending at the virtual block. The engine validates
//! and stores blocks, keeps the UTXO set of the virtual block current, moves
//! the finality and pruning points, and answers the queries peers need to
//! sync headers, blocks and pruning point state.
//!
//! ## Architecture
//!
//! - Storage: a [`database::Database`] capability, typed caching stores and a
//!   [`staging::StagingArea`] that makes every insertion a single atomic write
//! - DAG structure: reachability intervals, topology, traversal and GHOSTDAG
//! - Validation: block and transaction rules, coinbase and mass
//! - State: UTXO diffs per block, virtual resolution, finality and pruning
//! - Facade: [`Consensus`], the only entry point most callers need
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use blockdag_consensus::{Consensus, Config, MemoryDatabase, MinerData};
//!
//! let consensus = Consensus::new(Config::simnet(), Arc::new(MemoryDatabase::new())).unwrap();
//! let genesis = consensus.config().genesis_hash();
//! assert_eq!(consensus.tips().unwrap(), vec![genesis]);
//!
//! let block = consensus.build_block(&[genesis], &MinerData::default(), vec![]).unwrap();
//! let result = consensus.validate_and_insert_block(&block, true).unwrap();
//! assert_eq!(consensus.get_virtual_selected_parent().unwrap(), block.hash());
//! assert!(result.virtual_selected_parent_chain_changes.is_some());
//! ```

pub mod block_builder;
pub mod block_processor;
pub mod block_validator;
pub mod coinbase;
pub mod config;
pub mod consensus_state;
pub mod constants;
pub mod dag_topology;
pub mod dag_traversal;
pub mod database;
pub mod error;
pub mod ghostdag;
pub mod hashing;
pub mod multiset;
pub mod pow;
pub mod pruning;
pub mod reachability;
pub mod serialization;
pub mod staging;
pub mod stores;
pub mod sync;
pub mod transaction_validator;
pub mod types;
pub mod utxo;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::block_builder::BlockBuilder;
use crate::block_processor::{BlockProcessor, ProcessedBlock};
use crate::block_validator::BlockValidator;
use crate::coinbase::CoinbaseManager;
use crate::consensus_state::{populate_transaction_inputs, restore_past_utxo, ConsensusStateManager};
use crate::dag_topology::DagTopologyManager;
use crate::dag_traversal::DagTraversalManager;
use crate::ghostdag::GhostdagManager;
use crate::pruning::PruningManager;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::sync::SyncManager;
use crate::transaction_validator::{DefaultTransactionValidator, TransactionValidator};
use crate::utxo::{apply_diff, UtxoCollection};

// Re-export commonly used types
pub use config::Config;
pub use database::{Database, MemoryDatabase};
pub use error::{ConsensusError, Result, RuleError};
pub use multiset::{EcMultiset, Multiset};
pub use types::*;

/// Every manager of one engine instance. The managers share stores, so this
/// is cheap to build once and never mutated afterwards.
struct Engine<M: Multiset> {
    stores: Stores<M>,
    reachability: ReachabilityManager,
    topology: DagTopologyManager,
    ghostdag: GhostdagManager,
    traversal: DagTraversalManager,
    tx_validator: Arc<dyn TransactionValidator>,
    consensus_state: ConsensusStateManager<M>,
    pruning: PruningManager<M>,
    processor: BlockProcessor<M>,
    sync: SyncManager<M>,
    builder: BlockBuilder<M>,
}

/// The consensus engine.
///
/// Writers are serialized by an engine-wide lock; readers run concurrently
/// with each other and see only committed state. Notifications produced by
/// writes are buffered until [`Consensus::drain_events`] is called.
pub struct Consensus<M: Multiset = EcMultiset> {
    config: Arc<Config>,
    engine: RwLock<Engine<M>>,
    events: Mutex<Vec<ConsensusEvent>>,
}

impl Consensus<EcMultiset> {
    /// Opens an engine over `db`, adding genesis if the database is empty
    pub fn new(config: Config, db: Arc<dyn Database>) -> Result<Self> {
        Self::open(config, db, false)
    }
}

impl<M: Multiset> Consensus<M> {
    /// Opens an engine with the default transaction validator. With
    /// `skip_adding_genesis` an empty database stays empty, ready for a
    /// pruning point import.
    pub fn open(config: Config, db: Arc<dyn Database>, skip_adding_genesis: bool) -> Result<Self> {
        let tx_validator = Arc::new(DefaultTransactionValidator::from_config(&config));
        Self::with_transaction_validator(config, db, tx_validator, skip_adding_genesis)
    }

    pub fn with_transaction_validator(
        config: Config,
        db: Arc<dyn Database>,
        tx_validator: Arc<dyn TransactionValidator>,
        skip_adding_genesis: bool,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let genesis_hash = config.genesis_hash();

        let stores = Stores::<M>::new(db.clone(), config.cache_size);
        let reachability = ReachabilityManager::new(
            stores.reachability.clone(),
            stores.reindex_root.clone(),
            config.reachability_reindex_depth,
            config.reachability_reindex_slack,
        );
        let topology = DagTopologyManager::new(stores.relations.clone(), reachability.clone());
        let ghostdag = GhostdagManager::new(
            config.ghostdag_k,
            genesis_hash,
            stores.ghostdag.clone(),
            stores.headers.clone(),
            topology.clone(),
        );
        let traversal =
            DagTraversalManager::new(genesis_hash, stores.ghostdag.clone(), stores.headers.clone(), topology.clone());
        let coinbase = CoinbaseManager::new(
            config.base_subsidy,
            config.subsidy_halving_interval,
            config.max_coinbase_payload_script_len,
            stores.blocks.clone(),
        );
        let pruning = PruningManager::new(config.clone(), stores.clone(), reachability.clone(), traversal.clone());
        let consensus_state = ConsensusStateManager::new(
            config.clone(),
            db.clone(),
            stores.clone(),
            topology.clone(),
            ghostdag.clone(),
            traversal.clone(),
            coinbase.clone(),
            tx_validator.clone(),
            pruning.clone(),
        );
        let validator = BlockValidator::new(
            config.clone(),
            stores.clone(),
            reachability.clone(),
            traversal.clone(),
            coinbase.clone(),
            tx_validator.clone(),
            pruning.clone(),
        );
        let processor = BlockProcessor::new(
            config.clone(),
            db,
            stores.clone(),
            reachability.clone(),
            topology.clone(),
            ghostdag.clone(),
            traversal.clone(),
            validator,
            consensus_state.clone(),
            pruning.clone(),
        );
        let sync =
            SyncManager::new(config.clone(), stores.clone(), reachability.clone(), ghostdag.clone(), traversal.clone());
        let builder = BlockBuilder::new(
            config.clone(),
            stores.clone(),
            ghostdag.clone(),
            traversal.clone(),
            coinbase,
            consensus_state.clone(),
            pruning.clone(),
        );

        let events = processor.init(skip_adding_genesis)?;
        info!(network = %config.name, genesis = %genesis_hash, "consensus initialized");

        let engine = Engine {
            stores,
            reachability,
            topology,
            ghostdag,
            traversal,
            tx_validator,
            consensus_state,
            pruning,
            processor,
            sync,
            builder,
        };
        Ok(Self { config, engine: RwLock::new(engine), events: Mutex::new(events) })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Takes every notification produced since the last call
    pub fn drain_events(&self) -> Vec<ConsensusEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn record(&self, processed: ProcessedBlock) -> BlockInsertionResult {
        self.events.lock().extend(processed.events);
        processed.result
    }

    /// Validates `block` and adds it to the DAG.
    ///
    /// Without `should_validate_utxo` the block is stored and becomes a tip
    /// but its UTXO status stays pending until [`Consensus::resolve_virtual`].
    pub fn validate_and_insert_block(&self, block: &Block, should_validate_utxo: bool) -> Result<BlockInsertionResult> {
        let engine = self.engine.write();
        let processed = engine.processor.validate_and_insert_block(block, should_validate_utxo)?;
        Ok(self.record(processed))
    }

    /// Inserts a block received during pruning point sync, trusting the
    /// GHOSTDAG data and window headers sent with it
    pub fn validate_and_insert_block_with_trusted_data(
        &self,
        block: &BlockWithTrustedData,
        validate_utxo: bool,
    ) -> Result<BlockInsertionResult> {
        let engine = self.engine.write();
        let processed = engine.processor.validate_and_insert_block_with_trusted_data(block, validate_utxo)?;
        Ok(self.record(processed))
    }

    /// Resolves pending tips and moves the virtual onto the best of them
    pub fn resolve_virtual(&self) -> Result<()> {
        let engine = self.engine.write();
        let events = engine.processor.resolve_virtual()?;
        self.events.lock().extend(events);
        Ok(())
    }

    /// Checks `tx` against the virtual UTXO set as if the virtual accepted it,
    /// filling in its input entries, fee and mass
    pub fn validate_transaction_and_populate_with_consensus_data(&self, tx: &mut Transaction) -> Result<()> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        engine.tx_validator.validate_in_isolation(tx)?;
        let missing = {
            let view = engine.stores.virtual_utxo_set.view(&area);
            populate_transaction_inputs(tx, &view)?
        };
        if !missing.is_empty() {
            return Err(RuleError::MissingTxOut(missing).into());
        }
        let context = engine.consensus_state.virtual_tx_context(&area)?;
        let fee = engine.tx_validator.validate_in_context(tx, &context)?;
        engine.tx_validator.verify_scripts(tx)?;
        tx.fee = fee;
        tx.mass = engine.tx_validator.calculate_mass(tx);
        debug!(tx = %tx.id(), fee, mass = tx.mass, "validated transaction against the virtual");
        Ok(())
    }

    /// A valid block template over `parents`
    pub fn build_block(&self, parents: &[Hash], miner_data: &MinerData, transactions: Vec<Transaction>) -> Result<Block> {
        let engine = self.engine.read();
        engine.builder.build_block(&StagingArea::new(), parents, miner_data, transactions)
    }

    pub fn get_block(&self, hash: Hash) -> Result<Block> {
        let engine = self.engine.read();
        match engine.stores.blocks.try_get(&StagingArea::new(), &hash)? {
            Some(block) => Ok(block.as_ref().clone()),
            None => Err(ConsensusError::NotFound(format!("block {hash}"))),
        }
    }

    pub fn get_block_header(&self, hash: Hash) -> Result<BlockHeader> {
        let engine = self.engine.read();
        match engine.stores.headers.try_get(&StagingArea::new(), &hash)? {
            Some(header) => Ok(header.as_ref().clone()),
            None => Err(ConsensusError::NotFound(format!("header {hash}"))),
        }
    }

    /// Status and GHOSTDAG data of `hash`. Unknown blocks report `exists: false`.
    pub fn get_block_info(&self, hash: Hash) -> Result<BlockInfo> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let Some(status) = engine.stores.statuses.try_get(&area, &hash)? else {
            return Ok(BlockInfo {
                exists: false,
                status: None,
                blue_score: 0,
                blue_work: BlueWork::default(),
                selected_parent: None,
                merge_set_blues: Vec::new(),
                merge_set_reds: Vec::new(),
            });
        };
        let data = engine.stores.ghostdag.try_get(&area, &hash)?;
        Ok(BlockInfo {
            exists: true,
            status: Some(*status),
            blue_score: data.as_ref().map_or(0, |data| data.blue_score),
            blue_work: data.as_ref().map(|data| data.blue_work.clone()).unwrap_or_default(),
            selected_parent: data.as_ref().and_then(|data| data.selected_parent),
            merge_set_blues: data.as_ref().map(|data| data.merge_set_blues.clone()).unwrap_or_default(),
            merge_set_reds: data.as_ref().map(|data| data.merge_set_reds.clone()).unwrap_or_default(),
        })
    }

    pub fn get_block_relations(&self, hash: Hash) -> Result<BlockRelations> {
        let engine = self.engine.read();
        match engine.stores.relations.try_get(&StagingArea::new(), &hash)? {
            Some(relations) => Ok(relations.as_ref().clone()),
            None => Err(ConsensusError::NotFound(format!("relations of {hash}"))),
        }
    }

    /// Transactions of the merge set as accepted by `hash`, which must be valid
    pub fn get_block_acceptance_data(&self, hash: Hash) -> Result<AcceptanceData> {
        let engine = self.engine.read();
        match engine.stores.acceptance_data.try_get(&StagingArea::new(), &hash)? {
            Some(data) => Ok(data.as_ref().clone()),
            None => Err(ConsensusError::NotFound(format!("acceptance data of {hash}"))),
        }
    }

    /// The UTXO set of the past of `hash`, rebuilt from the virtual set and
    /// the block's chain of diffs
    pub fn restore_past_utxo_set(&self, hash: Hash) -> Result<UtxoCollection> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let diff = restore_past_utxo(&engine.stores, &area, hash)?;
        let mut set: UtxoCollection = engine.stores.virtual_utxo_set.entries(None, usize::MAX)?.into_iter().collect();
        apply_diff(&mut set, &diff);
        Ok(set)
    }

    /// Blocks in the past of `high` and not in the past of `low`, parents
    /// first, with `high` lowered so the blue score gap stays within
    /// `max_blue_score_difference` (zero for no bound). Returns the high used.
    pub fn get_hashes_between(&self, low: Hash, high: Hash, max_blue_score_difference: u64) -> Result<(Vec<Hash>, Hash)> {
        let engine = self.engine.read();
        engine.sync.get_hashes_between(&StagingArea::new(), low, high, max_blue_score_difference)
    }

    pub fn get_missing_block_body_hashes(&self, high: Hash) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.sync.missing_block_body_hashes(&StagingArea::new(), high)
    }

    /// A page of the pruning point UTXO set, after `from`
    pub fn get_pruning_point_utxos(
        &self,
        expected_pruning_point: Hash,
        from: Option<&Outpoint>,
        limit: usize,
    ) -> Result<Vec<(Outpoint, UtxoEntry)>> {
        let engine = self.engine.read();
        engine.pruning.pruning_point_utxos(&StagingArea::new(), expected_pruning_point, from, limit)
    }

    /// A page of the virtual UTXO set, after `from`
    pub fn get_virtual_utxos(&self, from: Option<&Outpoint>, limit: usize) -> Result<Vec<(Outpoint, UtxoEntry)>> {
        let engine = self.engine.read();
        engine.stores.virtual_utxo_set.entries(from, limit)
    }

    pub fn pruning_point(&self) -> Result<Hash> {
        let engine = self.engine.read();
        engine.pruning.pruning_point(&StagingArea::new())
    }

    /// Headers of every pruning point, genesis first
    pub fn pruning_point_headers(&self) -> Result<Vec<BlockHeader>> {
        let engine = self.engine.read();
        engine.pruning.pruning_point_headers(&StagingArea::new())
    }

    pub fn pruning_point_and_its_anticone_with_trusted_data(&self) -> Result<Vec<BlockWithTrustedData>> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let virtual_parents = engine.topology.virtual_parents(&area)?;
        engine.sync.pruning_point_and_its_anticone_with_trusted_data(&area, &virtual_parents)
    }

    /// Replaces the pruning point index with `headers`, oldest first
    pub fn import_pruning_points(&self, headers: &[BlockHeader]) -> Result<()> {
        let engine = self.engine.write();
        let mut area = StagingArea::new();
        engine.pruning.import_pruning_points(&mut area, headers)?;
        area.commit(engine.stores.headers.db().as_ref())
    }

    pub fn clear_imported_pruning_point_data(&self) -> Result<()> {
        let engine = self.engine.write();
        engine.consensus_state.clear_imported_pruning_point_data()
    }

    pub fn append_imported_pruning_point_utxos(&self, utxos: &[(Outpoint, UtxoEntry)]) -> Result<()> {
        let engine = self.engine.write();
        engine.consensus_state.append_imported_pruning_point_utxos(utxos)
    }

    /// Adopts the imported UTXO set as the state of `pruning_point` once it
    /// matches the point's UTXO commitment
    pub fn validate_and_insert_imported_pruning_point(&self, pruning_point: Hash) -> Result<()> {
        let engine = self.engine.write();
        engine.consensus_state.validate_and_insert_imported_pruning_point(pruning_point)
    }

    /// Whether an imported pruning point UTXO set is still being copied into place
    pub fn is_importing_pruning_point_utxo_set(&self) -> Result<bool> {
        let engine = self.engine.read();
        engine.stores.pruning.is_updating_utxo_set(&StagingArea::new())
    }

    /// Locator over the selected chain of `high`, down to `low`
    pub fn create_block_locator(&self, low: Hash, high: Hash, limit: usize) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.sync.create_block_locator(&StagingArea::new(), low, high, limit)
    }

    pub fn create_block_locator_from_pruning_point(&self, high: Hash, limit: usize) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.sync.create_block_locator_from_pruning_point(&StagingArea::new(), high, limit)
    }

    pub fn create_headers_selected_chain_block_locator(&self, low: Hash, high: Hash) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.sync.create_headers_selected_chain_block_locator(&StagingArea::new(), low, high)
    }

    pub fn create_full_headers_selected_chain_block_locator(&self) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.sync.create_full_headers_selected_chain_block_locator(&StagingArea::new())
    }

    pub fn get_virtual_selected_parent(&self) -> Result<Hash> {
        let engine = self.engine.read();
        engine.consensus_state.virtual_selected_parent(&StagingArea::new())
    }

    pub fn get_virtual_info(&self) -> Result<VirtualInfo> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let data = engine.consensus_state.virtual_ghostdag_data(&area)?;
        let past_median_time =
            engine.traversal.past_median_time(&area, &data, self.config.past_median_time_window_size())?;
        Ok(VirtualInfo {
            parent_hashes: engine.topology.virtual_parents(&area)?,
            bits: self.config.genesis.header.bits,
            past_median_time,
            blue_score: data.blue_score,
            daa_score: engine.consensus_state.daa_score(&area, &data)?,
        })
    }

    pub fn get_virtual_daa_score(&self) -> Result<u64> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let data = engine.consensus_state.virtual_ghostdag_data(&area)?;
        engine.consensus_state.daa_score(&area, &data)
    }

    /// Chain changes leading from `hash` to the current virtual selected parent
    pub fn get_virtual_selected_parent_chain_from_block(&self, hash: Hash) -> Result<SelectedChainPath> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let virtual_selected_parent = engine.consensus_state.virtual_selected_parent(&area)?;
        engine.traversal.calculate_chain_path(&area, hash, virtual_selected_parent)
    }

    pub fn tips(&self) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        engine.stores.tips(&StagingArea::new())
    }

    pub fn get_sync_info(&self) -> Result<SyncInfo> {
        let engine = self.engine.read();
        engine.sync.sync_info(&StagingArea::new())
    }

    pub fn is_valid_pruning_point(&self, hash: Hash) -> Result<bool> {
        let engine = self.engine.read();
        engine.pruning.is_valid_pruning_point(&StagingArea::new(), hash)
    }

    pub fn are_pruning_points_violating_finality(&self, pruning_points: &[Hash]) -> Result<bool> {
        let engine = self.engine.read();
        engine.pruning.are_pruning_points_violating_finality(&StagingArea::new(), pruning_points)
    }

    /// Whether `block` is on the selected parent chain of `other` (a block is
    /// on its own chain)
    pub fn is_in_selected_parent_chain_of(&self, block: Hash, other: Hash) -> Result<bool> {
        let engine = self.engine.read();
        engine.topology.is_in_selected_parent_chain_of(&StagingArea::new(), block, other)
    }

    /// Blocks that are neither ancestors nor descendants of `hash`
    pub fn anticone(&self, hash: Hash) -> Result<Vec<Hash>> {
        let engine = self.engine.read();
        let area = StagingArea::new();
        let virtual_parents = engine.topology.virtual_parents(&area)?;
        engine.traversal.anticone(&area, hash, &virtual_parents)
    }

    /// Hash rate implied by the blue work and timestamps of the `window_size`
    /// blue window below `start`, the virtual selected parent by default
    pub fn estimate_network_hashes_per_second(&self, start: Option<Hash>, window_size: usize) -> Result<u64> {
        if window_size == 0 {
            return Err(ConsensusError::Config("hash rate window must not be empty".to_string()));
        }
        let engine = self.engine.read();
        let area = StagingArea::new();
        let start = match start {
            Some(start) => start,
            None => engine.consensus_state.virtual_selected_parent(&area)?,
        };
        let data = engine.ghostdag.data(&area, &start)?;
        let window = engine.traversal.blue_window(&area, &data, window_size)?;

        let mut samples = Vec::with_capacity(window.len() + 1);
        let start_header = engine.stores.headers.get(&area, &start)?;
        samples.push((start_header.timestamp, start_header.blue_work.clone()));
        for block in window {
            let header = engine.stores.headers.get(&area, &block)?;
            samples.push((header.timestamp, header.blue_work.clone()));
        }
        Ok(pow::estimate_hashes_per_second(&samples))
    }

    /// Reachability reindex counters, for monitoring tree maintenance
    pub fn reachability_reallocations(&self) -> u64 {
        self.engine.read().reachability.stats().reallocations()
    }
}
