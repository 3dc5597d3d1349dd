//! Binary encoding of everything the engine persists
//!
//! Length-prefixed and little-endian throughout: variable-length fields carry
//! a `u64` length, optional fields a one-byte presence tag, and unbounded
//! integers are stored as big-endian byte strings. Every stored value type
//! implements [`Encode`] and [`Decode`].

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use num_bigint::BigUint;

use crate::constants::{HASH_SIZE, SUBNETWORK_ID_SIZE};
use crate::error::{ConsensusError, Result};
use crate::types::*;

pub trait Encode {
    fn encode_into(&self, w: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

pub trait Decode: Sized {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self>;

    /// Decodes a complete value; trailing bytes are an error
    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

/// Cursor over an encoded buffer
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(what: &str) -> ConsensusError {
    ConsensusError::Deserialization(format!("unexpected end of input while reading {what}"))
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(bytes) }
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ConsensusError::Deserialization(format!("{n} trailing bytes"))),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| truncated("u8"))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.cursor.read_u16::<LittleEndian>().map_err(|_| truncated("u16"))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.cursor.read_u32::<LittleEndian>().map_err(|_| truncated("u32"))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.cursor.read_u64::<LittleEndian>().map_err(|_| truncated("u64"))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.cursor.read_i64::<LittleEndian>().map_err(|_| truncated("i64"))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ConsensusError::Deserialization(format!("invalid bool byte {other}"))),
        }
    }

    /// Reads a length prefix and makes sure the buffer can hold that many items
    pub fn read_len(&mut self, min_item_size: usize) -> Result<usize> {
        let len = self.read_u64()?;
        let needed = len.checked_mul(min_item_size.max(1) as u64);
        match needed {
            Some(needed) if needed <= self.remaining() as u64 || min_item_size == 0 => Ok(len as usize),
            _ => Err(ConsensusError::Deserialization(format!("length prefix {len} exceeds the remaining input"))),
        }
    }

    pub fn read_exact_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.cursor.read_exact(&mut buf).map_err(|_| truncated("fixed-size array"))?;
        Ok(buf)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len(1)?;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(|_| truncated("byte string"))?;
        Ok(buf)
    }
}

pub fn write_u8(w: &mut Vec<u8>, v: u8) {
    w.push(v);
}

pub fn write_u16(w: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, v);
    w.extend_from_slice(&buf);
}

pub fn write_u32(w: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    w.extend_from_slice(&buf);
}

pub fn write_u64(w: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    w.extend_from_slice(&buf);
}

pub fn write_i64(w: &mut Vec<u8>, v: i64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_i64(&mut buf, v);
    w.extend_from_slice(&buf);
}

pub fn write_bool(w: &mut Vec<u8>, v: bool) {
    w.push(v as u8);
}

pub fn write_var_bytes(w: &mut Vec<u8>, bytes: &[u8]) {
    write_u64(w, bytes.len() as u64);
    w.extend_from_slice(bytes);
}

macro_rules! impl_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode_into(&self, w: &mut Vec<u8>) {
                $write(w, *self);
            }
        }

        impl Decode for $ty {
            fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
                r.$read()
            }
        }
    };
}

impl_primitive!(u8, write_u8, read_u8);
impl_primitive!(u16, write_u16, read_u16);
impl_primitive!(u32, write_u32, read_u32);
impl_primitive!(u64, write_u64, read_u64);
impl_primitive!(i64, write_i64, read_i64);
impl_primitive!(bool, write_bool, read_bool);

impl<T: Encode> Encode for Vec<T> {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u64(w, self.len() as u64);
        for item in self {
            item.encode_into(w);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        let len = r.read_len(1)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode_from(r)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode_into(&self, w: &mut Vec<u8>) {
        match self {
            Some(value) => {
                write_u8(w, 1);
                value.encode_into(w);
            }
            None => write_u8(w, 0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode_from(r)?)),
            tag => Err(ConsensusError::Deserialization(format!("invalid presence tag {tag}"))),
        }
    }
}

impl Encode for Hash {
    fn encode_into(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.as_bytes());
    }
}

impl Decode for Hash {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Hash::from_bytes(r.read_exact_array::<HASH_SIZE>()?))
    }
}

impl Encode for BigUint {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_var_bytes(w, &self.to_bytes_be());
    }
}

impl Decode for BigUint {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(BigUint::from_bytes_be(&r.read_var_bytes()?))
    }
}

impl Encode for Outpoint {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.transaction_id.encode_into(w);
        write_u32(w, self.index);
    }
}

impl Decode for Outpoint {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Outpoint { transaction_id: Hash::decode_from(r)?, index: r.read_u32()? })
    }
}

impl Encode for ScriptPublicKey {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u16(w, self.version);
        write_var_bytes(w, &self.script);
    }
}

impl Decode for ScriptPublicKey {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(ScriptPublicKey { version: r.read_u16()?, script: r.read_var_bytes()? })
    }
}

/// The script public key is stored as one length-prefixed blob: version then script.
impl Encode for UtxoEntry {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u64(w, self.block_blue_score);
        write_u64(w, self.amount);
        write_bool(w, self.is_coinbase);
        write_u64(w, (self.script_public_key.script.len() + 2) as u64);
        write_u16(w, self.script_public_key.version);
        w.extend_from_slice(&self.script_public_key.script);
    }
}

impl Decode for UtxoEntry {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        let block_blue_score = r.read_u64()?;
        let amount = r.read_u64()?;
        let is_coinbase = r.read_bool()?;
        let blob = r.read_var_bytes()?;
        if blob.len() < 2 {
            return Err(ConsensusError::Deserialization("script public key blob shorter than its version".to_string()));
        }
        let version = LittleEndian::read_u16(&blob[..2]);
        let script_public_key = ScriptPublicKey { version, script: blob[2..].to_vec() };
        Ok(UtxoEntry { amount, script_public_key, block_blue_score, is_coinbase })
    }
}

impl Encode for SubnetworkId {
    fn encode_into(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.as_bytes());
    }
}

impl Decode for SubnetworkId {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(SubnetworkId::from_bytes(r.read_exact_array::<SUBNETWORK_ID_SIZE>()?))
    }
}

impl Encode for TransactionInput {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.previous_outpoint.encode_into(w);
        write_var_bytes(w, &self.signature_script);
        write_u64(w, self.sequence);
        write_u8(w, self.sig_op_count);
        self.utxo_entry.encode_into(w);
    }
}

impl Decode for TransactionInput {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionInput {
            previous_outpoint: Outpoint::decode_from(r)?,
            signature_script: r.read_var_bytes()?,
            sequence: r.read_u64()?,
            sig_op_count: r.read_u8()?,
            utxo_entry: Option::<UtxoEntry>::decode_from(r)?,
        })
    }
}

impl Encode for TransactionOutput {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u64(w, self.value);
        self.script_public_key.encode_into(w);
    }
}

impl Decode for TransactionOutput {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionOutput { value: r.read_u64()?, script_public_key: ScriptPublicKey::decode_from(r)? })
    }
}

impl Encode for Transaction {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u16(w, self.version);
        self.inputs.encode_into(w);
        self.outputs.encode_into(w);
        write_u64(w, self.lock_time);
        self.subnetwork_id.encode_into(w);
        write_u64(w, self.gas);
        write_var_bytes(w, &self.payload);
        write_u64(w, self.fee);
        write_u64(w, self.mass);
    }
}

impl Decode for Transaction {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Transaction {
            version: r.read_u16()?,
            inputs: Vec::decode_from(r)?,
            outputs: Vec::decode_from(r)?,
            lock_time: r.read_u64()?,
            subnetwork_id: SubnetworkId::decode_from(r)?,
            gas: r.read_u64()?,
            payload: r.read_var_bytes()?,
            fee: r.read_u64()?,
            mass: r.read_u64()?,
        })
    }
}

/// Consensus-relevant transaction bytes: no fee, mass or populated entries.
/// Signature scripts are omitted for the transaction id.
pub fn encode_transaction_for_hashing(tx: &Transaction, include_signature_scripts: bool, w: &mut Vec<u8>) {
    write_u16(w, tx.version);
    write_u64(w, tx.inputs.len() as u64);
    for input in &tx.inputs {
        input.previous_outpoint.encode_into(w);
        if include_signature_scripts {
            write_var_bytes(w, &input.signature_script);
        } else {
            write_var_bytes(w, &[]);
        }
        write_u64(w, input.sequence);
        write_u8(w, input.sig_op_count);
    }
    tx.outputs.encode_into(w);
    write_u64(w, tx.lock_time);
    tx.subnetwork_id.encode_into(w);
    write_u64(w, tx.gas);
    write_var_bytes(w, &tx.payload);
}

impl Encode for BlockHeader {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u16(w, self.version);
        self.parents.encode_into(w);
        self.hash_merkle_root.encode_into(w);
        self.accepted_id_merkle_root.encode_into(w);
        self.utxo_commitment.encode_into(w);
        write_i64(w, self.timestamp);
        write_u32(w, self.bits);
        write_u64(w, self.nonce);
        write_u64(w, self.daa_score);
        write_u64(w, self.blue_score);
        self.blue_work.encode_into(w);
        self.pruning_point.encode_into(w);
    }
}

impl Decode for BlockHeader {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockHeader {
            version: r.read_u16()?,
            parents: Vec::decode_from(r)?,
            hash_merkle_root: Hash::decode_from(r)?,
            accepted_id_merkle_root: Hash::decode_from(r)?,
            utxo_commitment: Hash::decode_from(r)?,
            timestamp: r.read_i64()?,
            bits: r.read_u32()?,
            nonce: r.read_u64()?,
            daa_score: r.read_u64()?,
            blue_score: r.read_u64()?,
            blue_work: BigUint::decode_from(r)?,
            pruning_point: Hash::decode_from(r)?,
        })
    }
}

impl Encode for Block {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.header.encode_into(w);
        self.transactions.encode_into(w);
    }
}

impl Decode for Block {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Block { header: BlockHeader::decode_from(r)?, transactions: Vec::decode_from(r)? })
    }
}

impl Encode for GhostdagData {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u64(w, self.blue_score);
        self.blue_work.encode_into(w);
        self.selected_parent.encode_into(w);
        self.merge_set_blues.encode_into(w);
        self.merge_set_reds.encode_into(w);
        write_u64(w, self.blues_anticone_sizes.len() as u64);
        for (hash, size) in &self.blues_anticone_sizes {
            hash.encode_into(w);
            write_u16(w, *size);
        }
    }
}

impl Decode for GhostdagData {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        let blue_score = r.read_u64()?;
        let blue_work = BigUint::decode_from(r)?;
        let selected_parent = Option::<Hash>::decode_from(r)?;
        let merge_set_blues = Vec::decode_from(r)?;
        let merge_set_reds = Vec::decode_from(r)?;
        let len = r.read_len(HASH_SIZE + 2)?;
        let mut blues_anticone_sizes = std::collections::BTreeMap::new();
        for _ in 0..len {
            let hash = Hash::decode_from(r)?;
            blues_anticone_sizes.insert(hash, r.read_u16()?);
        }
        Ok(GhostdagData { blue_score, blue_work, selected_parent, merge_set_blues, merge_set_reds, blues_anticone_sizes })
    }
}

impl Encode for Interval {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u64(w, self.start);
        write_u64(w, self.end);
    }
}

impl Decode for Interval {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Interval::new(r.read_u64()?, r.read_u64()?))
    }
}

impl Encode for ReachabilityData {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.parent.encode_into(w);
        self.children.encode_into(w);
        self.interval.encode_into(w);
        self.future_covering_set.encode_into(w);
        write_u64(w, self.height);
    }
}

impl Decode for ReachabilityData {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(ReachabilityData {
            parent: Option::<Hash>::decode_from(r)?,
            children: Vec::decode_from(r)?,
            interval: Interval::decode_from(r)?,
            future_covering_set: Vec::decode_from(r)?,
            height: r.read_u64()?,
        })
    }
}

impl Encode for BlockStatus {
    fn encode_into(&self, w: &mut Vec<u8>) {
        write_u8(w, *self as u8);
    }
}

impl Decode for BlockStatus {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        BlockStatus::from_u8(r.read_u8()?)
    }
}

impl Encode for BlockRelations {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.parents.encode_into(w);
        self.children.encode_into(w);
    }
}

impl Decode for BlockRelations {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockRelations { parents: Vec::decode_from(r)?, children: Vec::decode_from(r)? })
    }
}

impl Encode for TransactionAcceptanceData {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.transaction.encode_into(w);
        write_u64(w, self.fee);
        write_bool(w, self.is_accepted);
        self.transaction_input_utxo_entries.encode_into(w);
    }
}

impl Decode for TransactionAcceptanceData {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionAcceptanceData {
            transaction: Transaction::decode_from(r)?,
            fee: r.read_u64()?,
            is_accepted: r.read_bool()?,
            transaction_input_utxo_entries: Vec::decode_from(r)?,
        })
    }
}

impl Encode for BlockAcceptanceData {
    fn encode_into(&self, w: &mut Vec<u8>) {
        self.block_hash.encode_into(w);
        self.transaction_acceptance_data.encode_into(w);
    }
}

impl Decode for BlockAcceptanceData {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockAcceptanceData { block_hash: Hash::decode_from(r)?, transaction_acceptance_data: Vec::decode_from(r)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_entry() -> UtxoEntry {
        UtxoEntry::new(5_000, ScriptPublicKey::new(0, vec![0x51, 0x52]), 17, true)
    }

    #[test]
    fn test_utxo_entry_layout() {
        let bytes = sample_entry().encode();
        // blue score, amount, coinbase flag, blob length, version, script
        assert_eq!(&bytes[0..8], &17u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &5_000u64.to_le_bytes());
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..25], &4u64.to_le_bytes());
        assert_eq!(&bytes[25..27], &0u16.to_le_bytes());
        assert_eq!(&bytes[27..], &[0x51, 0x52]);
        assert_eq!(UtxoEntry::decode(&bytes).unwrap(), sample_entry());
    }

    #[test]
    fn test_outpoint_layout() {
        let outpoint = Outpoint::new(Hash::from_u64_word(3), 0x0102_0304);
        let bytes = outpoint.encode();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[32..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_ghostdag_data_round_trip_keeps_anticone_sizes() {
        let mut sizes = BTreeMap::new();
        sizes.insert(Hash::from_u64_word(1), 0);
        sizes.insert(Hash::from_u64_word(2), 3);
        let data = GhostdagData {
            blue_score: 9,
            blue_work: BigUint::from(123_456_789u64) << 200,
            selected_parent: Some(Hash::from_u64_word(1)),
            merge_set_blues: vec![Hash::from_u64_word(1), Hash::from_u64_word(2)],
            merge_set_reds: vec![Hash::from_u64_word(4)],
            blues_anticone_sizes: sizes,
        };
        assert_eq!(GhostdagData::decode(&data.encode()).unwrap(), data);
    }

    #[test]
    fn test_truncated_input_is_deserialization_error() {
        let bytes = sample_entry().encode();
        let err = UtxoEntry::decode(&bytes[..10]).unwrap_err();
        assert!(matches!(err, ConsensusError::Deserialization(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Hash::from_u64_word(1).encode();
        bytes.push(0);
        assert!(Hash::decode(&bytes).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut bytes = Vec::new();
        write_u64(&mut bytes, u64::MAX);
        assert!(Vec::<Hash>::decode(&bytes).is_err());
        assert!(Vec::<u8>::decode(&bytes).is_err());
    }

    #[test]
    fn test_invalid_presence_tag() {
        assert!(Option::<u64>::decode(&[7]).is_err());
    }

    #[test]
    fn test_transaction_id_ignores_signature_scripts() {
        let mut with_sig = Vec::new();
        let mut tx = Transaction::new(
            0,
            vec![TransactionInput::new(Outpoint::new(Hash::from_u64_word(1), 0), vec![1, 2, 3], 0, 1)],
            vec![TransactionOutput::new(10, ScriptPublicKey::new(0, vec![0x51]))],
            0,
            SubnetworkId::NATIVE,
            0,
            vec![],
        );
        encode_transaction_for_hashing(&tx, false, &mut with_sig);
        tx.inputs[0].signature_script = vec![9, 9];
        let mut other = Vec::new();
        encode_transaction_for_hashing(&tx, false, &mut other);
        assert_eq!(with_sig, other);
    }

    mod strategies {
        use super::*;
        use proptest::collection::vec;
        use proptest::prelude::*;

        pub fn hash() -> impl Strategy<Value = Hash> {
            any::<[u8; HASH_SIZE]>().prop_map(Hash::from_bytes)
        }

        fn script() -> impl Strategy<Value = ScriptPublicKey> {
            (any::<u16>(), vec(any::<u8>(), 0..40)).prop_map(|(version, script)| ScriptPublicKey::new(version, script))
        }

        fn utxo_entry() -> impl Strategy<Value = UtxoEntry> {
            (any::<u64>(), script(), any::<u64>(), any::<bool>())
                .prop_map(|(amount, script, blue_score, coinbase)| UtxoEntry::new(amount, script, blue_score, coinbase))
        }

        fn input() -> impl Strategy<Value = TransactionInput> {
            (hash(), any::<u32>(), vec(any::<u8>(), 0..70), any::<u64>(), any::<u8>(), proptest::option::of(utxo_entry()))
                .prop_map(|(id, index, signature_script, sequence, sig_op_count, utxo_entry)| TransactionInput {
                    previous_outpoint: Outpoint::new(id, index),
                    signature_script,
                    sequence,
                    sig_op_count,
                    utxo_entry,
                })
        }

        pub fn transaction() -> impl Strategy<Value = Transaction> {
            (
                any::<u16>(),
                vec(input(), 0..4),
                vec((any::<u64>(), script()).prop_map(|(value, spk)| TransactionOutput::new(value, spk)), 0..4),
                any::<u64>(),
                any::<[u8; SUBNETWORK_ID_SIZE]>(),
                any::<u64>(),
                vec(any::<u8>(), 0..60),
                any::<u64>(),
                any::<u64>(),
            )
                .prop_map(|(version, inputs, outputs, lock_time, subnetwork, gas, payload, fee, mass)| Transaction {
                    version,
                    inputs,
                    outputs,
                    lock_time,
                    subnetwork_id: SubnetworkId::from_bytes(subnetwork),
                    gas,
                    payload,
                    fee,
                    mass,
                })
        }

        pub fn header() -> impl Strategy<Value = BlockHeader> {
            (
                any::<u16>(),
                vec(vec(hash(), 0..5), 0..3),
                proptest::array::uniform4(hash()),
                any::<i64>(),
                any::<u32>(),
                any::<u64>(),
                any::<u64>(),
                any::<u64>(),
                vec(any::<u8>(), 0..24),
            )
                .prop_map(|(version, parents, roots, timestamp, bits, nonce, daa_score, blue_score, work)| {
                    let [hash_merkle_root, accepted_id_merkle_root, utxo_commitment, pruning_point] = roots;
                    BlockHeader {
                        version,
                        parents,
                        hash_merkle_root,
                        accepted_id_merkle_root,
                        utxo_commitment,
                        timestamp,
                        bits,
                        nonce,
                        daa_score,
                        blue_score,
                        blue_work: BigUint::from_bytes_le(&work),
                        pruning_point,
                    }
                })
        }

        pub fn reachability_data() -> impl Strategy<Value = ReachabilityData> {
            (proptest::option::of(hash()), vec(hash(), 0..6), any::<u64>(), any::<u64>(), vec(hash(), 0..6), any::<u64>())
                .prop_map(|(parent, children, start, end, future_covering_set, height)| ReachabilityData {
                    parent,
                    children,
                    interval: Interval::new(start, end),
                    future_covering_set,
                    height,
                })
        }

        pub fn acceptance_data() -> impl Strategy<Value = AcceptanceData> {
            let tx_data = (transaction(), any::<u64>(), any::<bool>(), vec(utxo_entry(), 0..3)).prop_map(
                |(transaction, fee, is_accepted, transaction_input_utxo_entries)| TransactionAcceptanceData {
                    transaction,
                    fee,
                    is_accepted,
                    transaction_input_utxo_entries,
                },
            );
            vec(
                (hash(), vec(tx_data, 0..3)).prop_map(|(block_hash, transaction_acceptance_data)| BlockAcceptanceData {
                    block_hash,
                    transaction_acceptance_data,
                }),
                0..3,
            )
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn test_header_round_trip(header in strategies::header()) {
            let bytes = header.encode();
            let decoded = BlockHeader::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(decoded.hash(), header.hash());
            proptest::prop_assert_eq!(decoded, header);
        }

        #[test]
        fn test_transaction_round_trip(tx in strategies::transaction()) {
            let decoded = Transaction::decode(&tx.encode()).unwrap();
            proptest::prop_assert_eq!(decoded.id(), tx.id());
            proptest::prop_assert_eq!(decoded, tx);
        }

        #[test]
        fn test_reachability_data_round_trip(data in strategies::reachability_data()) {
            proptest::prop_assert_eq!(ReachabilityData::decode(&data.encode()).unwrap(), data);
        }

        #[test]
        fn test_acceptance_data_round_trip(data in strategies::acceptance_data()) {
            let bytes = data.encode();
            proptest::prop_assert_eq!(AcceptanceData::decode(&bytes).unwrap(), data);
            // Any strict prefix is a decoding error, never a shorter value
            if !bytes.is_empty() {
                proptest::prop_assert!(AcceptanceData::decode(&bytes[..bytes.len() - 1]).is_err());
            }
        }
    }
}
