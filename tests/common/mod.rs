//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use blockdag_consensus::multiset::Multiset;
use blockdag_consensus::utxo::UtxoCollection;
use blockdag_consensus::*;

pub fn simnet() -> (Consensus, Arc<MemoryDatabase>) {
    let db = Arc::new(MemoryDatabase::new());
    let consensus = Consensus::new(Config::simnet(), db.clone()).unwrap();
    (consensus, db)
}

/// Miner data whose extra data makes blocks over the same parents distinct
pub fn miner(tag: &str) -> MinerData {
    MinerData::new(ScriptPublicKey::new(0, tag.as_bytes().to_vec()), tag.as_bytes().to_vec())
}

/// Builds a block over `parents` and inserts it with UTXO validation
pub fn mine(consensus: &Consensus, parents: &[Hash], tag: &str) -> Block {
    mine_with(consensus, parents, tag, vec![])
}

pub fn mine_with(consensus: &Consensus, parents: &[Hash], tag: &str, transactions: Vec<Transaction>) -> Block {
    let block = consensus.build_block(parents, &miner(tag), transactions).unwrap();
    consensus.validate_and_insert_block(&block, true).unwrap();
    block
}

/// A selected chain of `len` blocks on top of `from`, bottom-up
pub fn mine_chain(consensus: &Consensus, from: Hash, len: usize, tag: &str) -> Vec<Hash> {
    let mut chain = Vec::with_capacity(len);
    let mut tip = from;
    for _ in 0..len {
        tip = mine(consensus, &[tip], tag).hash();
        chain.push(tip);
    }
    chain
}

pub fn all_virtual_utxos(consensus: &Consensus) -> Vec<(Outpoint, UtxoEntry)> {
    consensus.get_virtual_utxos(None, usize::MAX).unwrap()
}

pub fn multiset_hash(set: &UtxoCollection) -> Hash {
    let mut multiset = EcMultiset::empty();
    for (outpoint, entry) in set {
        multiset.add_utxo(outpoint, entry);
    }
    multiset.hash()
}

/// Asserts that the restored past UTXO set of every valid block in
/// `blocks` hashes to the commitment in its header
pub fn assert_commitments_hold(consensus: &Consensus, blocks: &[Hash]) {
    for hash in blocks {
        let info = consensus.get_block_info(*hash).unwrap();
        if info.status != Some(BlockStatus::Valid) {
            continue;
        }
        let past = consensus.restore_past_utxo_set(*hash).unwrap();
        let header = consensus.get_block_header(*hash).unwrap();
        assert_eq!(multiset_hash(&past), header.utxo_commitment, "commitment of {hash} does not match its past");
    }
}

/// Every block reachable from `from` through parent links, `from` excluded
pub fn past_of(consensus: &Consensus, from: Hash) -> HashSet<Hash> {
    walk(from, |hash| consensus.get_block_relations(hash).unwrap().parents)
}

/// Every block reachable from `from` through child links, `from` excluded
pub fn future_of(consensus: &Consensus, from: Hash) -> HashSet<Hash> {
    walk(from, |hash| consensus.get_block_relations(hash).unwrap().children)
}

fn walk(from: Hash, next: impl Fn(Hash) -> Vec<Hash>) -> HashSet<Hash> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<Hash> = next(from).into();
    while let Some(hash) = queue.pop_front() {
        if seen.insert(hash) {
            queue.extend(next(hash));
        }
    }
    seen
}

/// A transaction spending `outpoint`, worth `amount`, to a fresh script
pub fn spend(outpoint: Outpoint, amount: u64, fee: u64, tag: &str) -> Transaction {
    Transaction::new(
        constants::TX_VERSION,
        vec![TransactionInput::new(outpoint, vec![], 0, 1)],
        vec![TransactionOutput::new(amount - fee, ScriptPublicKey::new(0, tag.as_bytes().to_vec()))],
        0,
        SubnetworkId::NATIVE,
        0,
        vec![],
    )
}
