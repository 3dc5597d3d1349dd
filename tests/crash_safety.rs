//! Interrupted writes leave a store that reopens consistently

mod common;

use std::sync::Arc;

use blockdag_consensus::*;
use common::*;

/// A node on a short chain that also holds a longer competing chain, all
/// but its last block inserted without UTXO validation
fn reorg_setup() -> (Arc<MemoryDatabase>, Vec<Hash>, Vec<Hash>, Block) {
    let (node, db) = simnet();
    let (other, _other_db) = simnet();
    let genesis = node.config().genesis.hash();
    let short = mine_chain(&node, genesis, 5, "short");
    let long = mine_chain(&other, genesis, 6, "long");
    for hash in &long[..5] {
        node.validate_and_insert_block(&other.get_block(*hash).unwrap(), false).unwrap();
    }
    let last = other.get_block(long[5]).unwrap();
    (db, short, long, last)
}

fn reopen(db: &MemoryDatabase) -> Consensus {
    Consensus::new(Config::simnet(), Arc::new(db.snapshot())).unwrap()
}

#[test]
fn test_interrupted_reorg_recovers_on_reopen() {
    let (pre_state, short, long, last) = reorg_setup();
    let all: Vec<Hash> = short.iter().chain(long.iter()).copied().collect();

    for limit in 0..=8 {
        let db = Arc::new(pre_state.snapshot());
        let node = Consensus::new(Config::simnet(), db.clone()).unwrap();
        db.set_write_limit(Some(limit));
        let interrupted = node.validate_and_insert_block(&last, true);
        db.set_write_limit(None);
        drop(node);

        let reopened = reopen(&db);
        assert_commitments_hold(&reopened, &all);

        match reopened.get_block_info(last.hash()).unwrap().status {
            None => {
                assert!(interrupted.is_err(), "limit {limit}: block missing after a successful insert");
                let result = reopened.validate_and_insert_block(&last, true).unwrap();
                assert_eq!(result.status, BlockStatus::Valid);
            }
            Some(_) => reopened.resolve_virtual().unwrap(),
        }
        assert_eq!(reopened.get_virtual_selected_parent().unwrap(), last.hash(), "limit {limit}");
        assert_commitments_hold(&reopened, &all);
        for hash in &long {
            assert_eq!(reopened.get_block_info(*hash).unwrap().status, Some(BlockStatus::Valid), "limit {limit}");
        }
    }
}

#[test]
fn test_reopening_keeps_the_dag() -> anyhow::Result<()> {
    let (node, db) = simnet();
    let genesis = node.config().genesis.hash();
    let chain = mine_chain(&node, genesis, 8, "chain");
    let tips = node.tips()?;
    let virtual_utxos = all_virtual_utxos(&node);
    drop(node);

    let reopened = Consensus::new(Config::simnet(), Arc::new(db.snapshot()))?;
    assert_eq!(reopened.tips()?, tips);
    assert_eq!(reopened.get_virtual_selected_parent()?, chain[7]);
    assert_eq!(all_virtual_utxos(&reopened), virtual_utxos);
    assert_commitments_hold(&reopened, &chain);

    let next = mine(&reopened, &[chain[7]], "next");
    assert_eq!(reopened.get_virtual_selected_parent()?, next.hash());
    Ok(())
}

/// A node holding a peer's pruning point, its trusted blocks and its full
/// UTXO set, ready to adopt the set
fn import_setup() -> (Arc<MemoryDatabase>, Hash, Vec<(Outpoint, UtxoEntry)>) {
    let (source, _source_db) = simnet();
    let genesis = source.config().genesis.hash();
    mine_chain(&source, genesis, 45, "source");
    let pruning_point = source.pruning_point().unwrap();
    let utxos = source.get_pruning_point_utxos(pruning_point, None, usize::MAX).unwrap();

    let (node, db) = simnet();
    node.import_pruning_points(&source.pruning_point_headers().unwrap()).unwrap();
    for trusted in source.pruning_point_and_its_anticone_with_trusted_data().unwrap() {
        node.validate_and_insert_block_with_trusted_data(&trusted, false).unwrap();
    }
    node.clear_imported_pruning_point_data().unwrap();
    node.append_imported_pruning_point_utxos(&utxos).unwrap();
    (db, pruning_point, utxos)
}

#[test]
fn test_interrupted_utxo_set_import_finishes_on_reopen() {
    let (pre_state, pruning_point, utxos) = import_setup();
    let tips_before = reopen(&pre_state).tips().unwrap();

    let mut finished = false;
    for limit in 0..64 {
        let db = Arc::new(pre_state.snapshot());
        let node = Consensus::new(Config::simnet(), db.clone()).unwrap();
        db.set_write_limit(Some(limit));
        let interrupted = node.validate_and_insert_imported_pruning_point(pruning_point);
        db.set_write_limit(None);
        drop(node);

        let reopened = reopen(&db);
        assert!(!reopened.is_importing_pruning_point_utxo_set().unwrap(), "limit {limit}");
        if reopened.tips().unwrap() == vec![pruning_point] {
            assert_eq!(all_virtual_utxos(&reopened), utxos, "limit {limit}");
            assert_eq!(reopened.get_pruning_point_utxos(pruning_point, None, usize::MAX).unwrap(), utxos);
        } else {
            // Nothing was adopted, and the staged set is still there to retry
            assert!(interrupted.is_err(), "limit {limit}");
            assert_eq!(reopened.tips().unwrap(), tips_before);
            reopened.validate_and_insert_imported_pruning_point(pruning_point).unwrap();
            assert_eq!(all_virtual_utxos(&reopened), utxos, "limit {limit}");
        }

        if interrupted.is_ok() {
            finished = true;
            break;
        }
    }
    assert!(finished, "the import never completed within the write limits tried");
}

#[test]
fn test_clearing_imported_data_is_all_or_nothing() -> anyhow::Result<()> {
    let (pre_state, pruning_point, utxos) = import_setup();

    // A failed clear keeps the bucket and its multiset in step
    let db = Arc::new(pre_state.snapshot());
    let node = Consensus::new(Config::simnet(), db.clone())?;
    db.set_write_limit(Some(0));
    assert!(node.clear_imported_pruning_point_data().is_err());
    db.set_write_limit(None);
    drop(node);
    let reopened = reopen(&db);
    reopened.validate_and_insert_imported_pruning_point(pruning_point)?;
    assert_eq!(all_virtual_utxos(&reopened), utxos);

    // A completed clear leaves room to import the set again from scratch
    let db = Arc::new(pre_state.snapshot());
    let node = Consensus::new(Config::simnet(), db)?;
    node.clear_imported_pruning_point_data()?;
    let err = node.validate_and_insert_imported_pruning_point(pruning_point).unwrap_err();
    assert!(matches!(err.as_rule_error(), Some(RuleError::BadPruningPointUtxoSet { .. })));
    for chunk in utxos.chunks(5) {
        node.append_imported_pruning_point_utxos(chunk)?;
    }
    node.validate_and_insert_imported_pruning_point(pruning_point)?;
    assert_eq!(all_virtual_utxos(&node), utxos);
    Ok(())
}
