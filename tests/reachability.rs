//! Reachability under heavy reindexing

use std::sync::Arc;

use blockdag_consensus::constants::VIRTUAL_GENESIS_BLOCK_HASH;
use blockdag_consensus::reachability::ReachabilityManager;
use blockdag_consensus::staging::StagingArea;
use blockdag_consensus::stores::CachedStore;
use blockdag_consensus::{Config, Database, Hash, MemoryDatabase};

const CHAIN_LEN: u64 = 10_000;
const FORK_HEIGHT: u64 = 5_000;
const BRANCHES: u64 = 1_000;
const BRANCH_ID_OFFSET: u64 = 1_000_000;

struct Tree {
    db: Arc<dyn Database>,
    manager: ReachabilityManager,
}

impl Tree {
    fn new() -> Self {
        let config = Config::simnet();
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let manager = ReachabilityManager::new(
            CachedStore::new("reachability-data", db.clone(), 20_000),
            CachedStore::new("reindex-root", db.clone(), 1),
            config.reachability_reindex_depth,
            config.reachability_reindex_slack,
        );
        let mut area = StagingArea::new();
        manager.init(&mut area).unwrap();
        area.commit(db.as_ref()).unwrap();
        Self { db, manager }
    }

    fn add(&self, block: Hash, parent: Hash, hint: Hash) {
        let mut area = StagingArea::new();
        self.manager.add_block(&mut area, block, parent, &[], Some(hint)).unwrap();
        area.commit(self.db.as_ref()).unwrap();
    }

    fn is_ancestor(&self, a: Hash, b: Hash) -> bool {
        self.manager.is_dag_ancestor_of(&StagingArea::new(), a, b).unwrap()
    }
}

fn chain_block(height: u64) -> Hash {
    Hash::from_u64_word(height)
}

fn branch_block(index: u64) -> Hash {
    Hash::from_u64_word(BRANCH_ID_OFFSET + index)
}

#[test]
fn test_long_chain_with_side_branches_below_the_reindex_root() {
    let tree = Tree::new();

    let mut parent = VIRTUAL_GENESIS_BLOCK_HASH;
    for height in 1..=CHAIN_LEN {
        let block = chain_block(height);
        tree.add(block, parent, block);
        parent = block;
    }
    let tip = chain_block(CHAIN_LEN);
    let root = tree.manager.reindex_root(&StagingArea::new()).unwrap();
    assert!(tree.is_ancestor(chain_block(FORK_HEIGHT), root), "the reindex root should be far above the fork");

    for index in 0..BRANCHES {
        tree.add(branch_block(index), chain_block(FORK_HEIGHT), tip);
    }

    // Chain ancestry, sampled across the whole chain
    for a in (1..=CHAIN_LEN).step_by(397) {
        for b in (1..=CHAIN_LEN).step_by(211) {
            assert_eq!(tree.is_ancestor(chain_block(a), chain_block(b)), a <= b, "a={a} b={b}");
        }
    }

    // Every branch hangs off the fork block and nothing else
    for index in (0..BRANCHES).step_by(7) {
        let branch = branch_block(index);
        assert!(tree.is_ancestor(chain_block(1), branch));
        assert!(tree.is_ancestor(chain_block(FORK_HEIGHT), branch));
        assert!(!tree.is_ancestor(chain_block(FORK_HEIGHT + 1), branch));
        assert!(!tree.is_ancestor(branch, tip));
        assert!(!tree.is_ancestor(branch, chain_block(FORK_HEIGHT + 1)));
        assert!(!tree.is_ancestor(tip, branch));
        let sibling = branch_block((index + 1) % BRANCHES);
        assert!(!tree.is_ancestor(branch, sibling));
        assert!(!tree.is_ancestor(sibling, branch));
    }

    // Amortized O(n log n) interval work over all insertions
    let n = CHAIN_LEN + BRANCHES;
    let log_n = 64 - n.leading_zeros() as u64;
    let reallocations = tree.manager.stats().reallocations();
    assert!(reallocations <= n * log_n, "{reallocations} reallocations for {n} blocks");
}

#[test]
fn test_branch_children_extend_their_branch_only() {
    let tree = Tree::new();
    let mut parent = VIRTUAL_GENESIS_BLOCK_HASH;
    for height in 1..=400 {
        let block = chain_block(height);
        tree.add(block, parent, block);
        parent = block;
    }
    let tip = chain_block(400);

    // A side chain of 30 blocks growing from block 100
    let mut side_parent = chain_block(100);
    for index in 0..30 {
        let block = branch_block(index);
        tree.add(block, side_parent, tip);
        side_parent = block;
    }

    for index in 0..30 {
        let block = branch_block(index);
        assert!(tree.is_ancestor(chain_block(100), block));
        assert!(!tree.is_ancestor(chain_block(101), block));
        assert!(!tree.is_ancestor(block, tip));
        if index > 0 {
            assert!(tree.is_ancestor(branch_block(index - 1), block));
            assert!(!tree.is_ancestor(block, branch_block(index - 1)));
        }
    }
}
