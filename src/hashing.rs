//! Block, transaction and Merkle hashing

use bitcoin_hashes::{sha256d, Hash as _};
use sha2::{Digest, Sha256};

use crate::constants::ZERO_HASH;
use crate::serialization::{encode_transaction_for_hashing, Encode};
use crate::types::{BlockHeader, Hash, Transaction, TransactionId};

pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Hash::from_bytes(bytes)
}

pub fn header_hash(header: &BlockHeader) -> Hash {
    sha256(&header.encode())
}

/// Id of a transaction: excludes signature scripts so it is malleability-free
pub fn transaction_id(tx: &Transaction) -> TransactionId {
    let mut buf = Vec::new();
    encode_transaction_for_hashing(tx, false, &mut buf);
    sha256(&buf)
}

pub fn transaction_hash(tx: &Transaction) -> Hash {
    let mut buf = Vec::new();
    encode_transaction_for_hashing(tx, true, &mut buf);
    sha256(&buf)
}

fn merkle_branch(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash::from_bytes(sha256d::Hash::hash(&data).into_inner())
}

/// Merkle root over `leaves`. An odd node at any level is paired with the zero hash.
pub fn calc_merkle_root(leaves: impl IntoIterator<Item = Hash>) -> Hash {
    let mut level: Vec<Hash> = leaves.into_iter().collect();
    if level.is_empty() {
        return ZERO_HASH;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => merkle_branch(left, right),
                [single] => merkle_branch(single, &ZERO_HASH),
                _ => ZERO_HASH,
            })
            .collect();
    }
    level[0]
}

pub fn calc_hash_merkle_root(transactions: &[Transaction]) -> Hash {
    calc_merkle_root(transactions.iter().map(transaction_hash))
}

/// Root committed to by `accepted_id_merkle_root`: accepted ids sorted ascending
pub fn calc_accepted_id_merkle_root(mut accepted_ids: Vec<TransactionId>) -> Hash {
    accepted_ids.sort();
    calc_merkle_root(accepted_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_merkle_root_is_zero() {
        assert_eq!(calc_merkle_root(Vec::new()), ZERO_HASH);
    }

    #[test]
    fn test_single_leaf_merkle_root_is_leaf() {
        let leaf = Hash::from_u64_word(5);
        assert_eq!(calc_merkle_root(vec![leaf]), leaf);
    }

    #[test]
    fn test_odd_leaf_paired_with_zero() {
        let a = Hash::from_u64_word(1);
        let b = Hash::from_u64_word(2);
        let c = Hash::from_u64_word(3);
        let expected = merkle_branch(&merkle_branch(&a, &b), &merkle_branch(&c, &ZERO_HASH));
        assert_eq!(calc_merkle_root(vec![a, b, c]), expected);
    }

    #[test]
    fn test_accepted_id_root_is_order_independent() {
        let ids = vec![Hash::from_u64_word(9), Hash::from_u64_word(1), Hash::from_u64_word(4)];
        let mut reversed = ids.clone();
        reversed.reverse();
        assert_eq!(calc_accepted_id_merkle_root(ids), calc_accepted_id_merkle_root(reversed));
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
