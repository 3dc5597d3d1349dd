//! Syncing a fresh node from a peer's pruning point

mod common;

use blockdag_consensus::*;
use common::*;

struct Source {
    consensus: Consensus,
    chain: Vec<Hash>,
    pruning_point: Hash,
    utxos: Vec<(Outpoint, UtxoEntry)>,
}

fn source() -> Source {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();
    let chain = mine_chain(&consensus, genesis, 45, "source");
    let pruning_point = consensus.pruning_point().unwrap();
    let utxos = consensus.get_pruning_point_utxos(pruning_point, None, usize::MAX).unwrap();
    Source { consensus, chain, pruning_point, utxos }
}

/// A fresh node holding the source's pruning point headers and trusted blocks
fn importing_node(source: &Source) -> Consensus {
    let (node, _db) = simnet();
    node.import_pruning_points(&source.consensus.pruning_point_headers().unwrap()).unwrap();
    for trusted in source.consensus.pruning_point_and_its_anticone_with_trusted_data().unwrap() {
        node.validate_and_insert_block_with_trusted_data(&trusted, false).unwrap();
    }
    node.clear_imported_pruning_point_data().unwrap();
    node
}

#[test]
fn test_pruning_point_moves_in_finality_steps() {
    let source = source();
    let genesis = source.consensus.config().genesis.hash();
    assert_eq!(source.pruning_point, source.chain[19]);

    let headers: Vec<Hash> = source.consensus.pruning_point_headers().unwrap().iter().map(BlockHeader::hash).collect();
    assert_eq!(headers, vec![genesis, source.chain[9], source.chain[19]]);
    assert!(source.consensus.is_valid_pruning_point(source.pruning_point).unwrap());
    assert!(!source.consensus.are_pruning_points_violating_finality(&headers).unwrap());

    let mut pruning_point_set = utxo::UtxoCollection::new();
    pruning_point_set.extend(source.utxos.iter().cloned());
    let header = source.consensus.get_block_header(source.pruning_point).unwrap();
    assert_eq!(multiset_hash(&pruning_point_set), header.utxo_commitment);

    // Paging returns the same set in order
    let first = source.consensus.get_pruning_point_utxos(source.pruning_point, None, 3).unwrap();
    let rest = source.consensus.get_pruning_point_utxos(source.pruning_point, Some(&first[2].0), usize::MAX).unwrap();
    let paged: Vec<_> = first.into_iter().chain(rest).collect();
    assert_eq!(paged, source.utxos);
}

#[test]
fn test_fresh_node_syncs_from_the_pruning_point() {
    let source = source();
    let node = importing_node(&source);

    for chunk in source.utxos.chunks(4) {
        node.append_imported_pruning_point_utxos(chunk).unwrap();
    }
    node.validate_and_insert_imported_pruning_point(source.pruning_point).unwrap();

    assert_eq!(node.pruning_point().unwrap(), source.pruning_point);
    assert_eq!(node.tips().unwrap(), vec![source.pruning_point]);
    assert_eq!(node.get_virtual_info().unwrap().parent_hashes, vec![source.pruning_point]);
    assert_eq!(all_virtual_utxos(&node), source.utxos);

    let source_tip = source.consensus.get_virtual_selected_parent().unwrap();
    let (hashes, high) = source.consensus.get_hashes_between(source.pruning_point, source_tip, 0).unwrap();
    assert_eq!(high, source_tip);
    assert_eq!(hashes, source.chain[20..].to_vec());
    for hash in &hashes {
        let block = source.consensus.get_block(*hash).unwrap();
        let result = node.validate_and_insert_block(&block, true).unwrap();
        assert_eq!(result.status, BlockStatus::Valid);
    }

    assert_eq!(node.get_virtual_selected_parent().unwrap(), source_tip);
    assert_eq!(all_virtual_utxos(&node), all_virtual_utxos(&source.consensus));
    assert_commitments_hold(&node, &hashes);
}

#[test]
fn test_tampered_pruning_point_utxo_set_is_rejected() {
    let source = source();
    let node = importing_node(&source);

    let pruning_point_before = node.pruning_point().unwrap();
    let tips_before = node.tips().unwrap();
    let virtual_before = all_virtual_utxos(&node);

    let mut tampered = source.utxos.clone();
    tampered[0].1.amount += 1;
    node.append_imported_pruning_point_utxos(&tampered).unwrap();
    let err = node.validate_and_insert_imported_pruning_point(source.pruning_point).unwrap_err();
    assert!(matches!(err.as_rule_error(), Some(RuleError::BadPruningPointUtxoSet { .. })));

    assert_eq!(node.pruning_point().unwrap(), pruning_point_before);
    assert_eq!(node.tips().unwrap(), tips_before);
    assert_eq!(all_virtual_utxos(&node), virtual_before);

    // Importing the same outpoint twice is refused
    node.clear_imported_pruning_point_data().unwrap();
    node.append_imported_pruning_point_utxos(&source.utxos[..1]).unwrap();
    let err = node.append_imported_pruning_point_utxos(&source.utxos[..1]).unwrap_err();
    assert!(matches!(err.as_rule_error(), Some(RuleError::MalformedUtxo(_))));
}
