//! Block insertion
//!
//! Runs a block through validation, stores it, resolves its UTXO status and
//! moves the virtual. Every step stages into one [`StagingArea`] that is
//! committed once; a failure before the commit leaves the stores untouched.
//! The only later writes are the per-step commits of the UTXO diff reversal.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block_validator::BlockValidator;
use crate::config::Config;
use crate::constants::VIRTUAL_GENESIS_BLOCK_HASH;
use crate::consensus_state::{ConsensusStateManager, ResolveOutcome};
use crate::dag_topology::DagTopologyManager;
use crate::dag_traversal::DagTraversalManager;
use crate::database::Database;
use crate::error::{ConsensusError, Result, RuleError};
use crate::ghostdag::GhostdagManager;
use crate::multiset::Multiset;
use crate::pruning::PruningManager;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::Stores;
use crate::types::{
    Block, BlockInsertionResult, BlockStatus, BlockWithTrustedData, ConsensusEvent, GhostdagData, Hash,
    SelectedChainPath,
};
use crate::utxo::UtxoDiff;

/// Insertion result plus the notifications it produced
#[derive(Debug, Clone)]
pub struct ProcessedBlock {
    pub result: BlockInsertionResult,
    pub events: Vec<ConsensusEvent>,
}

#[derive(Clone)]
pub struct BlockProcessor<M: Multiset> {
    config: Arc<Config>,
    db: Arc<dyn Database>,
    stores: Stores<M>,
    reachability: ReachabilityManager,
    topology: DagTopologyManager,
    ghostdag: GhostdagManager,
    traversal: DagTraversalManager,
    validator: BlockValidator<M>,
    consensus_state: ConsensusStateManager<M>,
    pruning: PruningManager<M>,
}

impl<M: Multiset> BlockProcessor<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn Database>,
        stores: Stores<M>,
        reachability: ReachabilityManager,
        topology: DagTopologyManager,
        ghostdag: GhostdagManager,
        traversal: DagTraversalManager,
        validator: BlockValidator<M>,
        consensus_state: ConsensusStateManager<M>,
        pruning: PruningManager<M>,
    ) -> Self {
        Self { config, db, stores, reachability, topology, ghostdag, traversal, validator, consensus_state, pruning }
    }

    /// Prepares an empty database, or picks up an existing one.
    ///
    /// A fresh database gets genesis as its only block, tip and pruning
    /// point, unless `skip_adding_genesis` is set for a node that will import
    /// a pruning point instead. An interrupted UTXO set swap is finished first.
    pub fn init(&self, skip_adding_genesis: bool) -> Result<Vec<ConsensusEvent>> {
        let mut area = StagingArea::new();
        self.reachability.init(&mut area)?;
        area.commit(self.db.as_ref())?;
        if self.consensus_state.recover_interrupted_utxo_swap()? {
            info!("finished an interrupted pruning point utxo set swap");
        }

        let area = StagingArea::new();
        let genesis_hash = self.config.genesis_hash();
        if self.stores.has_block(&area, &genesis_hash)? || !self.stores.tips(&area)?.is_empty() {
            debug!("database already initialized");
            return Ok(Vec::new());
        }
        if skip_adding_genesis {
            return Ok(Vec::new());
        }
        self.add_genesis()
    }

    fn add_genesis(&self) -> Result<Vec<ConsensusEvent>> {
        let genesis = &self.config.genesis;
        let hash = genesis.hash();
        let mut area = StagingArea::new();

        self.stores.headers.stage(&mut area, hash, genesis.header.clone())?;
        self.stores.blocks.stage(&mut area, hash, genesis.clone())?;
        self.topology.set_parents(&mut area, hash, &[])?;
        self.stores.ghostdag.stage(&mut area, hash, self.ghostdag.genesis_ghostdag_data())?;
        self.reachability.add_block(&mut area, hash, VIRTUAL_GENESIS_BLOCK_HASH, &[], None)?;

        self.stores.statuses.stage(&mut area, hash, BlockStatus::Valid)?;
        self.stores.utxo_diffs.stage(&mut area, hash, UtxoDiff::default())?;
        self.stores.multisets.stage(&mut area, hash, M::empty())?;
        self.stores.acceptance_data.stage(&mut area, hash, Vec::new())?;
        self.stores.tips.stage(&mut area, (), vec![hash])?;
        self.stores.virtual_diff_parents.stage(&mut area, (), vec![hash])?;
        self.stores.headers_selected_tip.stage(&mut area, (), hash)?;
        self.stores.pruning.append_pruning_point(&mut area, hash)?;
        self.stores.pruning.candidate.stage(&mut area, (), hash)?;
        self.stores.pruning.candidate_multiset.stage(&mut area, (), M::empty())?;

        let update = self.consensus_state.update_virtual(&mut area, None)?;
        area.commit(self.db.as_ref())?;
        info!(genesis = %hash, "added genesis");
        Ok(vec![
            ConsensusEvent::BlockAdded { hash, status: BlockStatus::Valid },
            ConsensusEvent::VirtualChanged {
                chain_changes: update.chain_changes,
                virtual_parents: update.virtual_parents,
            },
        ])
    }

    /// Validates and stores `block`.
    ///
    /// 1. A known block is rejected, unless it is header-only and `block` brings its body
    /// 2. The header is checked in isolation, then against its parents and GHOSTDAG data
    /// 3. A body, if present, is checked in isolation and against its parents
    /// 4. The block is stored; a header-only block stops here
    /// 5. With `should_validate_utxo`, the block's selected chain is resolved and
    ///    the virtual moves; otherwise the block waits as a pending tip
    ///
    /// Rule violations mark the block `Invalid`, except missing parents and a
    /// body that does not match its header.
    pub fn validate_and_insert_block(&self, block: &Block, should_validate_utxo: bool) -> Result<ProcessedBlock> {
        let hash = block.hash();
        let mut area = StagingArea::new();

        let known_header = match self.stores.statuses.try_get(&area, &hash)?.map(|status| *status) {
            Some(BlockStatus::Invalid) => return Err(RuleError::KnownInvalid(hash).into()),
            Some(BlockStatus::HeaderOnly) if !block.is_header_only() => true,
            Some(_) => return Err(RuleError::DuplicateBlock(hash).into()),
            None => false,
        };

        let data = if known_header {
            self.traversal.ghostdag_data(&area, &hash)?.as_ref().clone()
        } else {
            let data = match self.validate_header(&area, block) {
                Ok(data) => data,
                Err(err) => return self.reject(hash, err),
            };
            self.stage_header(&mut area, hash, block, &data)?;
            data
        };

        if block.is_header_only() {
            self.stores.statuses.stage(&mut area, hash, BlockStatus::HeaderOnly)?;
            area.commit(self.db.as_ref())?;
            debug!(%hash, "inserted header");
            return Ok(ProcessedBlock {
                result: BlockInsertionResult {
                    virtual_selected_parent_chain_changes: None,
                    status: BlockStatus::HeaderOnly,
                    disqualification: None,
                },
                events: vec![ConsensusEvent::BlockAdded { hash, status: BlockStatus::HeaderOnly }],
            });
        }

        if let Err(err) = self.validate_body(&area, block, &data) {
            return self.reject(hash, err);
        }
        self.stores.blocks.stage(&mut area, hash, block.clone())?;
        self.stores.statuses.stage(&mut area, hash, BlockStatus::UtxoPendingVerification)?;
        self.process_body(area, hash, should_validate_utxo)
    }

    fn validate_header(&self, area: &StagingArea, block: &Block) -> Result<GhostdagData> {
        let header = &block.header;
        self.validator.validate_header_in_isolation(header)?;
        let missing = self.validator.missing_parents(area, header)?;
        if !missing.is_empty() {
            return Err(RuleError::MissingParents(missing).into());
        }
        self.validator.validate_parents_not_invalid(area, header)?;
        let data = self.ghostdag.ghostdag(area, header.direct_parents())?;
        self.validator.validate_header_in_context(area, header, &data)?;
        Ok(data)
    }

    fn validate_body(&self, area: &StagingArea, block: &Block, data: &GhostdagData) -> Result<()> {
        self.validator.validate_body_in_isolation(block)?;
        self.validator.validate_body_in_context(area, block, data)
    }

    /// Stores the header with its relations, GHOSTDAG data and reachability
    /// node, and moves the headers selected tip if the block is heavier
    fn stage_header(&self, area: &mut StagingArea, hash: Hash, block: &Block, data: &GhostdagData) -> Result<()> {
        let selected_parent = data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant(format!("non-genesis block {hash} has no selected parent")))?;
        self.stores.headers.stage(area, hash, block.header.clone())?;
        self.topology.set_parents(area, hash, block.header.direct_parents())?;
        self.stores.ghostdag.stage(area, hash, data.clone())?;

        let merge_set: Vec<Hash> = data.merge_set().copied().filter(|merged| *merged != selected_parent).collect();
        let headers_selected_tip = self.stores.headers_selected_tip.try_get(area, &())?.map(|tip| *tip);
        self.reachability.add_block(area, hash, selected_parent, &merge_set, headers_selected_tip)?;
        self.update_headers_selected_tip(area, hash, data, headers_selected_tip)
    }

    fn update_headers_selected_tip(
        &self,
        area: &mut StagingArea,
        hash: Hash,
        data: &GhostdagData,
        current: Option<Hash>,
    ) -> Result<()> {
        let is_heavier = match current {
            None => true,
            Some(tip) => data.to_sortable(hash) > self.traversal.sortable(area, tip)?,
        };
        if is_heavier {
            self.stores.headers_selected_tip.stage(area, (), hash)?;
        }
        Ok(())
    }

    fn process_body(&self, mut area: StagingArea, hash: Hash, should_validate_utxo: bool) -> Result<ProcessedBlock> {
        let parents = self.topology.parents(&area, &hash)?;
        let mut events = Vec::new();

        if !should_validate_utxo {
            self.consensus_state.add_tip(&mut area, hash, &parents)?;
            area.commit(self.db.as_ref())?;
            debug!(%hash, "inserted block, utxo verification deferred");
            events.push(ConsensusEvent::BlockAdded { hash, status: BlockStatus::UtxoPendingVerification });
            return Ok(ProcessedBlock {
                result: BlockInsertionResult {
                    virtual_selected_parent_chain_changes: None,
                    status: BlockStatus::UtxoPendingVerification,
                    disqualification: None,
                },
                events,
            });
        }

        self.consensus_state.add_tip(&mut area, hash, &parents)?;
        if self.pruning.is_violating_finality(&area, hash)? {
            let finality_point = self
                .pruning
                .finality_point(&area)?
                .ok_or_else(|| ConsensusError::Invariant("finality violation without a finality point".to_string()))?;
            // The block stays a pending tip, which the virtual never selects
            let update = self.consensus_state.update_virtual(&mut area, None)?;
            area.commit(self.db.as_ref())?;
            warn!(%hash, %finality_point, "block violates finality");
            events.push(ConsensusEvent::BlockAdded { hash, status: BlockStatus::UtxoPendingVerification });
            events.push(ConsensusEvent::FinalityConflictDetected { violating_block: hash, finality_point });
            if !update.chain_changes.is_empty() {
                events.push(ConsensusEvent::VirtualChanged {
                    chain_changes: update.chain_changes.clone(),
                    virtual_parents: update.virtual_parents,
                });
            }
            return Ok(ProcessedBlock {
                result: BlockInsertionResult {
                    virtual_selected_parent_chain_changes: Some(update.chain_changes),
                    status: BlockStatus::UtxoPendingVerification,
                    disqualification: None,
                },
                events,
            });
        }

        let outcome = self.consensus_state.resolve_block_status(&mut area, hash)?;
        let chain_changes = self.update_virtual_and_commit(area, &outcome, &mut events)?;
        events.insert(0, ConsensusEvent::BlockAdded { hash, status: outcome.status });
        debug!(%hash, status = %outcome.status, "inserted block");
        Ok(ProcessedBlock {
            result: BlockInsertionResult {
                virtual_selected_parent_chain_changes: Some(chain_changes),
                status: outcome.status,
                disqualification: outcome.disqualification,
            },
            events,
        })
    }

    /// Moves the virtual after a resolution, commits, then reverses the
    /// resolved chain's diffs
    fn update_virtual_and_commit(
        &self,
        mut area: StagingArea,
        outcome: &ResolveOutcome,
        events: &mut Vec<ConsensusEvent>,
    ) -> Result<SelectedChainPath> {
        let update = self.consensus_state.update_virtual(&mut area, outcome.resolved_tip.clone())?;
        area.commit(self.db.as_ref())?;
        if let Some(reversal) = outcome.reversal.clone() {
            self.consensus_state.reverse_utxo_diffs(reversal)?;
        }
        if !update.chain_changes.is_empty() {
            events.push(ConsensusEvent::VirtualChanged {
                chain_changes: update.chain_changes.clone(),
                virtual_parents: update.virtual_parents.clone(),
            });
        }
        if let Some(moved) = update.pruning_point_move {
            events.push(ConsensusEvent::PruningPointMoved { pruning_point: moved.pruning_point, index: moved.index });
        }
        Ok(update.chain_changes)
    }

    /// Resolves every tip still waiting for UTXO verification, heaviest
    /// first, and moves the virtual after each one
    pub fn resolve_virtual(&self) -> Result<Vec<ConsensusEvent>> {
        let mut events = Vec::new();
        let area = StagingArea::new();
        let mut pending = Vec::new();
        for tip in self.stores.tips(&area)? {
            if self.stores.status(&area, &tip)? == BlockStatus::UtxoPendingVerification {
                pending.push(self.traversal.sortable(&area, tip)?);
            }
        }
        pending.sort_by(|a, b| b.cmp(a));

        for tip in pending {
            let mut area = StagingArea::new();
            if self.stores.status(&area, &tip.hash)? != BlockStatus::UtxoPendingVerification {
                continue;
            }
            if self.pruning.is_violating_finality(&area, tip.hash)? {
                warn!(tip = %tip.hash, "pending tip violates finality, leaving it unresolved");
                continue;
            }
            let outcome = self.consensus_state.resolve_block_status(&mut area, tip.hash)?;
            self.update_virtual_and_commit(area, &outcome, &mut events)?;
            debug!(tip = %tip.hash, status = %outcome.status, "resolved pending tip");
        }
        Ok(events)
    }

    /// Inserts a block sent during pruning point sync.
    ///
    /// The block's parents may be below the sender's pruning point and thus
    /// unknown here, so its GHOSTDAG data and that of the blocks it needs for
    /// windows and pruning point checks are taken as given. The block is
    /// stored with its body and waits for the pruning point UTXO set import.
    /// A block whose selected parent is unknown cannot have its UTXO state
    /// derived and is disqualified from the chain right away. With
    /// `validate_utxo`, a block whose selected parent is already valid is
    /// resolved like any other block.
    pub fn validate_and_insert_block_with_trusted_data(
        &self,
        trusted: &BlockWithTrustedData,
        validate_utxo: bool,
    ) -> Result<ProcessedBlock> {
        let block = &trusted.block;
        let hash = block.hash();
        let mut area = StagingArea::new();
        match self.stores.statuses.try_get(&area, &hash)?.map(|status| *status) {
            Some(BlockStatus::Invalid) => return Err(RuleError::KnownInvalid(hash).into()),
            Some(_) => return Err(RuleError::DuplicateBlock(hash).into()),
            None => {}
        }
        if let Err(err) = self.validator.validate_body_in_isolation(block) {
            return self.reject(hash, err);
        }

        for header in &trusted.window_headers {
            let header_hash = header.hash();
            if !self.stores.headers.has(&area, &header_hash)? {
                self.stores.headers.stage(&mut area, header_hash, header.clone())?;
            }
        }
        let mut data = None;
        for pair in &trusted.ghostdag_data {
            if pair.hash == hash {
                data = Some(pair.ghostdag_data.clone());
            } else if !self.stores.ghostdag.has(&area, &pair.hash)? {
                self.stores.ghostdag.stage(&mut area, pair.hash, pair.ghostdag_data.clone())?;
            }
        }
        let data = data.ok_or_else(|| ConsensusError::NotFound(format!("trusted ghostdag data of {hash}")))?;
        let selected_parent = data
            .selected_parent
            .ok_or_else(|| ConsensusError::Invariant(format!("trusted block {hash} has no selected parent")))?;

        self.stores.headers.stage(&mut area, hash, block.header.clone())?;
        self.stores.blocks.stage(&mut area, hash, block.clone())?;
        self.topology.set_parents(&mut area, hash, block.header.direct_parents())?;
        self.stores.ghostdag.stage(&mut area, hash, data.clone())?;

        let selected_parent_known = self.reachability.has(&area, &selected_parent)?;
        let tree_parent = if selected_parent_known { selected_parent } else { VIRTUAL_GENESIS_BLOCK_HASH };
        let mut merge_set = Vec::new();
        for merged in data.merge_set() {
            if *merged != selected_parent && self.reachability.has(&area, merged)? {
                merge_set.push(*merged);
            }
        }
        let headers_selected_tip = self.stores.headers_selected_tip.try_get(&area, &())?.map(|tip| *tip);
        self.reachability.add_block(&mut area, hash, tree_parent, &merge_set, headers_selected_tip)?;
        self.update_headers_selected_tip(&mut area, hash, &data, headers_selected_tip)?;

        let is_pruning_point = self.stores.pruning.pruning_point.try_get(&area, &())?.map(|pp| *pp) == Some(hash);
        let status = if selected_parent_known || is_pruning_point {
            BlockStatus::UtxoPendingVerification
        } else {
            BlockStatus::DisqualifiedFromChain
        };
        self.stores.statuses.stage(&mut area, hash, status)?;
        let selected_parent_is_valid = selected_parent_known
            && self.stores.statuses.try_get(&area, &selected_parent)?.map(|s| *s) == Some(BlockStatus::Valid);
        if validate_utxo && status == BlockStatus::UtxoPendingVerification && selected_parent_is_valid {
            return self.process_body(area, hash, true);
        }
        area.commit(self.db.as_ref())?;
        debug!(%hash, %status, "inserted block with trusted data");
        Ok(ProcessedBlock {
            result: BlockInsertionResult { virtual_selected_parent_chain_changes: None, status, disqualification: None },
            events: vec![ConsensusEvent::BlockAdded { hash, status }],
        })
    }

    fn reject<T>(&self, hash: Hash, err: ConsensusError) -> Result<T> {
        if let Some(rule) = err.as_rule_error() {
            if !matches!(rule, RuleError::MissingParents(_) | RuleError::BadMerkleRoot { .. }) {
                warn!(%hash, %rule, "block rejected");
                let mut area = StagingArea::new();
                self.stores.statuses.stage(&mut area, hash, BlockStatus::Invalid)?;
                area.commit(self.db.as_ref())?;
            }
        }
        Err(err)
    }
}
