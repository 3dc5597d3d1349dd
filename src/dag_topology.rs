//! Parent/child relations of the block DAG
//!
//! Relations are stored per block. Ancestry questions are delegated to the
//! reachability index.

use crate::constants::VIRTUAL_BLOCK_HASH;
use crate::error::Result;
use crate::reachability::ReachabilityManager;
use crate::staging::StagingArea;
use crate::stores::RelationsStore;
use crate::types::{BlockRelations, Hash};

#[derive(Clone)]
pub struct DagTopologyManager {
    relations: RelationsStore,
    reachability: ReachabilityManager,
}

impl DagTopologyManager {
    pub fn new(relations: RelationsStore, reachability: ReachabilityManager) -> Self {
        Self { relations, reachability }
    }

    pub fn reachability(&self) -> &ReachabilityManager {
        &self.reachability
    }

    pub fn has_relations(&self, area: &StagingArea, block: &Hash) -> Result<bool> {
        self.relations.has(area, block)
    }

    pub fn parents(&self, area: &StagingArea, block: &Hash) -> Result<Vec<Hash>> {
        Ok(self.relations.get(area, block)?.parents.clone())
    }

    pub fn children(&self, area: &StagingArea, block: &Hash) -> Result<Vec<Hash>> {
        Ok(self.relations.get(area, block)?.children.clone())
    }

    pub fn is_parent_of(&self, area: &StagingArea, block: &Hash, other: &Hash) -> Result<bool> {
        Ok(self.relations.get(area, other)?.parents.contains(block))
    }

    pub fn is_child_of(&self, area: &StagingArea, block: &Hash, other: &Hash) -> Result<bool> {
        Ok(self.relations.get(area, other)?.children.contains(block))
    }

    /// Whether `block` is in the past of `other`. A block is not its own ancestor.
    pub fn is_ancestor_of(&self, area: &StagingArea, block: Hash, other: Hash) -> Result<bool> {
        Ok(block != other && self.reachability.is_dag_ancestor_of(area, block, other)?)
    }

    pub fn is_ancestor_of_any(&self, area: &StagingArea, block: Hash, others: &[Hash]) -> Result<bool> {
        for other in others {
            if self.is_ancestor_of(area, block, *other)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_any_ancestor_of(&self, area: &StagingArea, blocks: &[Hash], other: Hash) -> Result<bool> {
        for block in blocks {
            if self.is_ancestor_of(area, *block, other)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `block` lies on the selected parent chain of `other` (inclusive)
    pub fn is_in_selected_parent_chain_of(&self, area: &StagingArea, block: Hash, other: Hash) -> Result<bool> {
        self.reachability.is_chain_ancestor_of(area, block, other)
    }

    /// Records `block` with `parents` and registers it as a child of each known parent.
    /// Unknown parents (pruned or never seen) are left out.
    pub fn set_parents(&self, area: &mut StagingArea, block: Hash, parents: &[Hash]) -> Result<()> {
        let mut known = Vec::with_capacity(parents.len());
        for parent in parents {
            let Some(relations) = self.relations.try_get(area, parent)? else {
                continue;
            };
            let mut relations = relations.as_ref().clone();
            if !relations.children.contains(&block) {
                relations.children.push(block);
            }
            self.relations.stage(area, *parent, relations)?;
            known.push(*parent);
        }
        let children = match self.relations.try_get(area, &block)? {
            Some(existing) => existing.children.clone(),
            None => Vec::new(),
        };
        self.relations.stage(area, block, BlockRelations { parents: known, children })
    }

    /// The virtual is never registered as a child of its parents
    pub fn set_virtual_parents(&self, area: &mut StagingArea, parents: Vec<Hash>) -> Result<()> {
        self.relations.stage(area, VIRTUAL_BLOCK_HASH, BlockRelations { parents, children: Vec::new() })
    }

    pub fn virtual_parents(&self, area: &StagingArea) -> Result<Vec<Hash>> {
        Ok(self.relations.try_get(area, &VIRTUAL_BLOCK_HASH)?.map(|r| r.parents.clone()).unwrap_or_default())
    }
}
