//! Rule violations caught while inserting blocks

mod common;

use blockdag_consensus::hashing::calc_hash_merkle_root;
use blockdag_consensus::*;
use common::*;

fn template(consensus: &Consensus, parents: &[Hash], tag: &str) -> Block {
    consensus.build_block(parents, &miner(tag), vec![]).unwrap()
}

fn rule_error(consensus: &Consensus, block: &Block) -> RuleError {
    match consensus.validate_and_insert_block(block, true) {
        Err(ConsensusError::Rule(rule)) => rule,
        other => panic!("expected a rule error, got {other:?}"),
    }
}

fn status(consensus: &Consensus, hash: Hash) -> Option<BlockStatus> {
    consensus.get_block_info(hash).unwrap().status
}

#[test]
fn test_parent_rules() {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();

    let mut no_parents = template(&consensus, &[genesis], "none");
    no_parents.header.parents = vec![vec![]];
    assert!(matches!(rule_error(&consensus, &no_parents), RuleError::NoParents));
    assert_eq!(status(&consensus, no_parents.hash()), Some(BlockStatus::Invalid));

    let mut duplicate = template(&consensus, &[genesis], "dup");
    duplicate.header.parents = vec![vec![genesis, genesis]];
    assert!(matches!(rule_error(&consensus, &duplicate), RuleError::DuplicateParents(parent) if parent == genesis));

    let mut too_many = template(&consensus, &[genesis], "many");
    too_many.header.parents = vec![(0..11).map(Hash::from_u64_word).collect()];
    assert!(matches!(rule_error(&consensus, &too_many), RuleError::TooManyParents(11)));

    // A child of an invalid block inherits the verdict
    let mut child = template(&consensus, &[genesis], "child");
    child.header.parents = vec![vec![no_parents.hash()]];
    assert!(matches!(rule_error(&consensus, &child), RuleError::InvalidAncestor(parent) if parent == no_parents.hash()));
    assert_eq!(status(&consensus, child.hash()), Some(BlockStatus::Invalid));
}

#[test]
fn test_header_must_match_its_ghostdag_data() {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();
    let parent = mine(&consensus, &[genesis], "parent").hash();

    let mut blue_score = template(&consensus, &[parent], "score");
    blue_score.header.blue_score += 1;
    assert!(matches!(
        rule_error(&consensus, &blue_score),
        RuleError::UnexpectedBlueScore { expected, actual } if actual == expected + 1
    ));

    let mut old = template(&consensus, &[parent], "old");
    old.header.timestamp = consensus.config().genesis.header.timestamp;
    assert!(matches!(rule_error(&consensus, &old), RuleError::TimeTooOld { .. }));

    let mut pruning_point = template(&consensus, &[parent], "pp");
    pruning_point.header.pruning_point = parent;
    assert!(matches!(rule_error(&consensus, &pruning_point), RuleError::UnexpectedPruningPoint { .. }));

    // None of that touched the virtual
    assert_eq!(consensus.get_virtual_selected_parent().unwrap(), parent);
}

#[test]
fn test_bad_merkle_root_does_not_poison_the_hash() {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();
    let block = template(&consensus, &[genesis], "block");

    let mut stripped = block.clone();
    stripped.transactions[0].payload.push(0);
    assert!(matches!(rule_error(&consensus, &stripped), RuleError::BadMerkleRoot { .. }));
    assert_eq!(stripped.hash(), block.hash());
    assert_eq!(status(&consensus, block.hash()), None);

    // The same header with the right body is still accepted
    let result = consensus.validate_and_insert_block(&block, true).unwrap();
    assert_eq!(result.status, BlockStatus::Valid);
    assert!(matches!(rule_error(&consensus, &block), RuleError::DuplicateBlock(hash) if hash == block.hash()));
}

#[test]
fn test_coinbase_rules() {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();
    let parent = mine(&consensus, &[genesis], "parent").hash();

    let mut no_coinbase = template(&consensus, &[parent], "no-coinbase");
    let coinbase_outpoint = Outpoint::new(no_coinbase.transactions[0].id(), 0);
    no_coinbase.transactions[0] = spend(coinbase_outpoint, 10, 1, "first");
    no_coinbase.header.hash_merkle_root = calc_hash_merkle_root(&no_coinbase.transactions);
    assert!(matches!(rule_error(&consensus, &no_coinbase), RuleError::FirstTxNotCoinbase));

    // Coinbase payload claiming the wrong blue score
    let mut payload = template(&consensus, &[parent], "payload");
    payload.transactions[0].payload[0] ^= 1;
    payload.header.hash_merkle_root = calc_hash_merkle_root(&payload.transactions);
    assert!(matches!(rule_error(&consensus, &payload), RuleError::BadCoinbaseTransaction(_)));
    assert_eq!(status(&consensus, payload.hash()), Some(BlockStatus::Invalid));

    // Overpaying the merge set is only visible against the UTXO set
    let mut greedy = template(&consensus, &[parent], "greedy");
    greedy.transactions[0].outputs[0].value += 1;
    greedy.header.hash_merkle_root = calc_hash_merkle_root(&greedy.transactions);
    let result = consensus.validate_and_insert_block(&greedy, true).unwrap();
    assert_eq!(result.status, BlockStatus::DisqualifiedFromChain);
    assert!(matches!(result.disqualification, Some(RuleError::BadCoinbaseTransaction(_))));
    assert_eq!(consensus.get_virtual_selected_parent().unwrap(), parent);
}

#[test]
fn test_header_only_blocks_wait_for_their_body() {
    let (consensus, _db) = simnet();
    let genesis = consensus.config().genesis.hash();
    let block = template(&consensus, &[genesis], "block");

    let header_only = Block::new(block.header.clone(), vec![]);
    let result = consensus.validate_and_insert_block(&header_only, true).unwrap();
    assert_eq!(result.status, BlockStatus::HeaderOnly);
    assert_eq!(consensus.get_missing_block_body_hashes(block.hash()).unwrap(), vec![block.hash()]);
    assert_eq!(consensus.get_sync_info().unwrap().headers_selected_tip, Some(block.hash()));

    let result = consensus.validate_and_insert_block(&block, true).unwrap();
    assert_eq!(result.status, BlockStatus::Valid);
    assert!(consensus.get_missing_block_body_hashes(block.hash()).unwrap().is_empty());
}
