//! Commutative multiset hashing over UTXO sets
//!
//! The UTXO commitment of a block is the hash of a multiset accumulator over
//! its past UTXO set. Elements are hashed onto secp256k1 and summed, so the
//! result is independent of insertion order and removal is point negation.

use std::fmt;

use secp256k1::{PublicKey, SECP256K1};

use crate::constants::ZERO_HASH;
use crate::error::{ConsensusError, Result};
use crate::hashing::sha256;
use crate::serialization::{Decode, Encode, Reader};
use crate::types::{Hash, Outpoint, UtxoEntry};

/// Order-independent accumulator. The backend is pluggable so tests can swap it.
pub trait Multiset: Clone + fmt::Debug + PartialEq + Send + Sync + Encode + Decode + 'static {
    fn empty() -> Self;

    fn add(&mut self, element: &[u8]);

    fn remove(&mut self, element: &[u8]);

    /// Adds every element of `other`
    fn combine(&mut self, other: &Self);

    fn hash(&self) -> Hash;

    fn add_utxo(&mut self, outpoint: &Outpoint, entry: &UtxoEntry) {
        self.add(&utxo_element(outpoint, entry));
    }

    fn remove_utxo(&mut self, outpoint: &Outpoint, entry: &UtxoEntry) {
        self.remove(&utxo_element(outpoint, entry));
    }
}

/// Serialized `(outpoint, entry)` pair as fed to the multiset
pub fn utxo_element(outpoint: &Outpoint, entry: &UtxoEntry) -> Vec<u8> {
    let mut buf = outpoint.encode();
    entry.encode_into(&mut buf);
    buf
}

/// Elliptic-curve multiset. `None` is the point at infinity (the empty set).
#[derive(Clone, PartialEq, Eq)]
pub struct EcMultiset {
    point: Option<PublicKey>,
}

impl fmt::Debug for EcMultiset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcMultiset({})", self.hash())
    }
}

impl EcMultiset {
    /// Try-and-increment: the first counter whose digest is a valid x coordinate wins
    fn hash_to_point(element: &[u8]) -> PublicKey {
        let mut counter: u64 = 0;
        loop {
            let mut preimage = Vec::with_capacity(element.len() + 8);
            preimage.extend_from_slice(&counter.to_le_bytes());
            preimage.extend_from_slice(element);
            let digest = sha256(&preimage);
            let mut compressed = [0u8; 33];
            compressed[0] = 0x02;
            compressed[1..].copy_from_slice(digest.as_bytes());
            if let Ok(point) = PublicKey::from_slice(&compressed) {
                return point;
            }
            counter += 1;
        }
    }

    fn add_point(&mut self, point: PublicKey) {
        self.point = match self.point {
            None => Some(point),
            // Summing to infinity means the set became empty
            Some(current) => current.combine(&point).ok(),
        };
    }
}

impl Multiset for EcMultiset {
    fn empty() -> Self {
        EcMultiset { point: None }
    }

    fn add(&mut self, element: &[u8]) {
        self.add_point(Self::hash_to_point(element));
    }

    fn remove(&mut self, element: &[u8]) {
        let point = Self::hash_to_point(element).negate(SECP256K1);
        self.add_point(point);
    }

    fn combine(&mut self, other: &Self) {
        if let Some(point) = other.point {
            self.add_point(point);
        }
    }

    fn hash(&self) -> Hash {
        match &self.point {
            None => ZERO_HASH,
            Some(point) => sha256(&point.serialize_uncompressed()),
        }
    }
}

impl Encode for EcMultiset {
    fn encode_into(&self, w: &mut Vec<u8>) {
        match &self.point {
            None => w.push(0),
            Some(point) => {
                w.push(1);
                w.extend_from_slice(&point.serialize());
            }
        }
    }
}

impl Decode for EcMultiset {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(EcMultiset::empty()),
            1 => {
                let bytes = r.read_exact_array::<33>()?;
                let point = PublicKey::from_slice(&bytes)
                    .map_err(|e| ConsensusError::Deserialization(format!("invalid multiset point: {e}")))?;
                Ok(EcMultiset { point: Some(point) })
            }
            tag => Err(ConsensusError::Deserialization(format!("invalid multiset tag {tag}"))),
        }
    }
}
