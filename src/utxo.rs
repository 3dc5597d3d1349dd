//! UTXO collections and the diff algebra used to move between UTXO sets
//!
//! A [`UtxoDiff`] describes how to get from a base UTXO set to a target one.
//! Stored diffs are immutable; [`MutableUtxoDiff`] is used while a block's
//! past UTXO is being accumulated and is frozen once the block is resolved.

use std::collections::BTreeMap;

use crate::error::{ConsensusError, Result};
use crate::serialization::{Decode, Encode, Reader};
use crate::types::{Outpoint, Transaction, UtxoEntry};

pub type UtxoCollection = BTreeMap<Outpoint, UtxoEntry>;

/// Read access to some UTXO set
pub trait UtxoView {
    fn get_utxo(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>>;
}

impl UtxoView for UtxoCollection {
    fn get_utxo(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>> {
        Ok(self.get(outpoint).cloned())
    }
}

fn contains_same(collection: &UtxoCollection, outpoint: &Outpoint, entry: &UtxoEntry) -> bool {
    collection.get(outpoint) == Some(entry)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UtxoDiff {
    to_add: UtxoCollection,
    to_remove: UtxoCollection,
}

impl UtxoDiff {
    pub fn new(to_add: UtxoCollection, to_remove: UtxoCollection) -> Self {
        Self { to_add, to_remove }
    }

    pub fn to_add(&self) -> &UtxoCollection {
        &self.to_add
    }

    pub fn to_remove(&self) -> &UtxoCollection {
        &self.to_remove
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// The diff that undoes this one
    pub fn reversed(&self) -> UtxoDiff {
        UtxoDiff { to_add: self.to_remove.clone(), to_remove: self.to_add.clone() }
    }

    /// Composes `self` followed by `other`, both expressed against consecutive bases
    pub fn with_diff(&self, other: &UtxoDiff) -> Result<UtxoDiff> {
        let mut result = MutableUtxoDiff::from(self.clone());
        result.with_diff_in_place(other)?;
        Ok(result.into_immutable())
    }

    /// Given `self` and `other` relative to the same base, returns the diff
    /// leading from `self`'s target set to `other`'s.
    pub fn diff_from(&self, other: &UtxoDiff) -> Result<UtxoDiff> {
        self.reversed().with_diff(other)
    }

    pub fn into_mutable(self) -> MutableUtxoDiff {
        MutableUtxoDiff { inner: self }
    }
}

/// A diff under construction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutableUtxoDiff {
    inner: UtxoDiff,
}

impl From<UtxoDiff> for MutableUtxoDiff {
    fn from(inner: UtxoDiff) -> Self {
        Self { inner }
    }
}

impl MutableUtxoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_immutable(&self) -> &UtxoDiff {
        &self.inner
    }

    pub fn into_immutable(self) -> UtxoDiff {
        self.inner
    }

    pub fn add_entry(&mut self, outpoint: Outpoint, entry: UtxoEntry) -> Result<()> {
        if contains_same(&self.inner.to_remove, &outpoint, &entry) {
            self.inner.to_remove.remove(&outpoint);
        } else if self.inner.to_add.contains_key(&outpoint) {
            return Err(ConsensusError::Invariant(format!("outpoint {outpoint} added twice to a utxo diff")));
        } else {
            self.inner.to_add.insert(outpoint, entry);
        }
        Ok(())
    }

    pub fn remove_entry(&mut self, outpoint: Outpoint, entry: UtxoEntry) -> Result<()> {
        if contains_same(&self.inner.to_add, &outpoint, &entry) {
            self.inner.to_add.remove(&outpoint);
        } else if self.inner.to_remove.contains_key(&outpoint) {
            return Err(ConsensusError::Invariant(format!("outpoint {outpoint} removed twice from a utxo diff")));
        } else {
            self.inner.to_remove.insert(outpoint, entry);
        }
        Ok(())
    }

    /// Spends the transaction's (populated) inputs and creates its outputs at `block_blue_score`
    pub fn add_transaction(&mut self, tx: &Transaction, block_blue_score: u64) -> Result<()> {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let entry = input.utxo_entry.clone().ok_or_else(|| {
                    ConsensusError::Invariant(format!("input {} was not populated", input.previous_outpoint))
                })?;
                self.remove_entry(input.previous_outpoint, entry)?;
            }
        }
        let id = tx.id();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            let entry = UtxoEntry::new(output.value, output.script_public_key.clone(), block_blue_score, is_coinbase);
            self.add_entry(Outpoint::new(id, index as u32), entry)?;
        }
        Ok(())
    }

    pub fn with_diff_in_place(&mut self, other: &UtxoDiff) -> Result<()> {
        for (outpoint, entry) in &other.to_remove {
            match self.inner.to_add.get(outpoint) {
                Some(existing) if existing == entry => {
                    self.inner.to_add.remove(outpoint);
                }
                Some(_) => {
                    return Err(ConsensusError::Invariant(format!(
                        "outpoint {outpoint} removed with a different entry than the one added"
                    )))
                }
                None if self.inner.to_remove.contains_key(outpoint) => {
                    return Err(ConsensusError::Invariant(format!("outpoint {outpoint} removed by both diffs")))
                }
                None => {
                    self.inner.to_remove.insert(*outpoint, entry.clone());
                }
            }
        }
        for (outpoint, entry) in &other.to_add {
            if contains_same(&self.inner.to_remove, outpoint, entry) && !other.to_remove.contains_key(outpoint) {
                self.inner.to_remove.remove(outpoint);
            } else if self.inner.to_add.contains_key(outpoint) {
                return Err(ConsensusError::Invariant(format!("outpoint {outpoint} added by both diffs")));
            } else {
                self.inner.to_add.insert(*outpoint, entry.clone());
            }
        }
        Ok(())
    }
}

/// A diff layered over a base set. Entries the diff adds win, entries it removes are gone.
pub struct DiffView<'a, V: UtxoView + ?Sized> {
    diff: &'a UtxoDiff,
    base: &'a V,
}

impl<'a, V: UtxoView + ?Sized> DiffView<'a, V> {
    pub fn new(diff: &'a UtxoDiff, base: &'a V) -> Self {
        Self { diff, base }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for DiffView<'_, V> {
    fn get_utxo(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>> {
        if let Some(entry) = self.diff.to_add.get(outpoint) {
            return Ok(Some(entry.clone()));
        }
        if self.diff.to_remove.contains_key(outpoint) {
            return Ok(None);
        }
        self.base.get_utxo(outpoint)
    }
}

/// Applies `diff` to a materialized set
pub fn apply_diff(set: &mut UtxoCollection, diff: &UtxoDiff) {
    for outpoint in diff.to_remove.keys() {
        set.remove(outpoint);
    }
    for (outpoint, entry) in &diff.to_add {
        set.insert(*outpoint, entry.clone());
    }
}

fn encode_collection(collection: &UtxoCollection, w: &mut Vec<u8>) {
    crate::serialization::write_u64(w, collection.len() as u64);
    for (outpoint, entry) in collection {
        outpoint.encode_into(w);
        entry.encode_into(w);
    }
}

fn decode_collection(r: &mut Reader<'_>) -> Result<UtxoCollection> {
    // outpoint (36) + the fixed part of an entry (8 + 8 + 1 + 8 + 2)
    let len = r.read_len(63)?;
    let mut collection = UtxoCollection::new();
    for _ in 0..len {
        let outpoint = Outpoint::decode_from(r)?;
        let entry = UtxoEntry::decode_from(r)?;
        collection.insert(outpoint, entry);
    }
    Ok(collection)
}

impl Encode for UtxoDiff {
    fn encode_into(&self, w: &mut Vec<u8>) {
        encode_collection(&self.to_add, w);
        encode_collection(&self.to_remove, w);
    }
}

impl Decode for UtxoDiff {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(UtxoDiff { to_add: decode_collection(r)?, to_remove: decode_collection(r)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, ScriptPublicKey, SubnetworkId, TransactionInput, TransactionOutput};

    fn op(i: u64) -> Outpoint {
        Outpoint::new(Hash::from_u64_word(i), 0)
    }

    fn entry(amount: u64) -> UtxoEntry {
        UtxoEntry::new(amount, ScriptPublicKey::new(0, vec![0x51]), 1, false)
    }

    fn collection(items: &[(u64, u64)]) -> UtxoCollection {
        items.iter().map(|(i, amount)| (op(*i), entry(*amount))).collect()
    }

    #[test]
    fn test_with_diff_cancels_add_then_remove() {
        let first = UtxoDiff::new(collection(&[(1, 10)]), UtxoCollection::new());
        let second = UtxoDiff::new(collection(&[(2, 20)]), collection(&[(1, 10)]));
        let combined = first.with_diff(&second).unwrap();
        assert_eq!(combined.to_add(), &collection(&[(2, 20)]));
        assert!(combined.to_remove().is_empty());
    }

    #[test]
    fn test_with_diff_rejects_double_removal() {
        let first = UtxoDiff::new(UtxoCollection::new(), collection(&[(1, 10)]));
        let second = UtxoDiff::new(UtxoCollection::new(), collection(&[(1, 10)]));
        assert!(matches!(first.with_diff(&second), Err(ConsensusError::Invariant(_))));
    }

    #[test]
    fn test_with_diff_rejects_double_add() {
        let first = UtxoDiff::new(collection(&[(1, 10)]), UtxoCollection::new());
        assert!(first.with_diff(&first).is_err());
    }

    #[test]
    fn test_diff_from_moves_between_targets() {
        let base = collection(&[(1, 10), (2, 20), (3, 30)]);
        // A: spend 1, create 4. B: spend 2, create 5.
        let a = UtxoDiff::new(collection(&[(4, 40)]), collection(&[(1, 10)]));
        let b = UtxoDiff::new(collection(&[(5, 50)]), collection(&[(2, 20)]));

        let mut set_a = base.clone();
        apply_diff(&mut set_a, &a);
        let mut set_b = base.clone();
        apply_diff(&mut set_b, &b);

        let a_to_b = a.diff_from(&b).unwrap();
        let mut moved = set_a.clone();
        apply_diff(&mut moved, &a_to_b);
        assert_eq!(moved, set_b);

        let b_to_a = b.diff_from(&a).unwrap();
        assert_eq!(b_to_a, a_to_b.reversed());
    }

    #[test]
    fn test_diff_from_with_shared_entries_is_minimal() {
        let a = UtxoDiff::new(collection(&[(4, 40), (6, 60)]), collection(&[(1, 10)]));
        let b = UtxoDiff::new(collection(&[(4, 40)]), collection(&[(1, 10), (2, 20)]));
        let diff = a.diff_from(&b).unwrap();
        assert_eq!(diff.to_add(), &UtxoCollection::new());
        assert_eq!(diff.to_remove(), &collection(&[(2, 20), (6, 60)]));
    }

    #[test]
    fn test_diff_view_lookup_order() {
        let base = collection(&[(1, 10), (2, 20)]);
        let diff = UtxoDiff::new(collection(&[(3, 30)]), collection(&[(1, 10)]));
        let view = DiffView::new(&diff, &base);
        assert_eq!(view.get_utxo(&op(1)).unwrap(), None);
        assert_eq!(view.get_utxo(&op(2)).unwrap(), Some(entry(20)));
        assert_eq!(view.get_utxo(&op(3)).unwrap(), Some(entry(30)));
        assert_eq!(view.get_utxo(&op(4)).unwrap(), None);
    }

    #[test]
    fn test_add_transaction_spends_and_creates() {
        let spent = entry(100);
        let mut input = TransactionInput::new(op(1), vec![], 0, 1);
        input.utxo_entry = Some(spent.clone());
        let tx = Transaction::new(
            0,
            vec![input],
            vec![TransactionOutput::new(90, ScriptPublicKey::new(0, vec![0x52]))],
            0,
            SubnetworkId::NATIVE,
            0,
            vec![],
        );
        let mut diff = MutableUtxoDiff::new();
        diff.add_transaction(&tx, 7).unwrap();
        let diff = diff.into_immutable();
        assert_eq!(diff.to_remove().get(&op(1)), Some(&spent));
        let created = diff.to_add().get(&Outpoint::new(tx.id(), 0)).unwrap();
        assert_eq!(created.amount, 90);
        assert_eq!(created.block_blue_score, 7);
        assert!(!created.is_coinbase);
    }

    #[test]
    fn test_add_transaction_requires_populated_inputs() {
        let tx = Transaction::new(
            0,
            vec![TransactionInput::new(op(1), vec![], 0, 1)],
            vec![],
            0,
            SubnetworkId::NATIVE,
            0,
            vec![],
        );
        assert!(MutableUtxoDiff::new().add_transaction(&tx, 1).is_err());
    }

    #[test]
    fn test_encoding_round_trip() {
        let diff = UtxoDiff::new(collection(&[(1, 10), (2, 20)]), collection(&[(3, 30)]));
        assert_eq!(UtxoDiff::decode(&diff.encode()).unwrap(), diff);
    }
}
