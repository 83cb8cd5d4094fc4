//! Shreds are the smallest unit of block propagation: a slot's entry
//! stream is sliced into data shreds, and each erasure set of data shreds
//! is protected by Reed-Solomon coding shreds generated over the full
//! data payloads.
//!
//! Wire layout, common to every shred:
//!
//!   signature(64) | shred_variant(1) | slot(8) | index(4) | version(2) | fec_set_index(4)
//!
//! Data shreds append `parent_slot_offset(2) | flags(1) | size(2)` and the
//! entry bytes; coding shreds append `num_data(2) | num_code(2) |
//! position(2)` and the parity block. Merkle variants carry a 32-byte
//! Merkle root at the payload tail, followed for chained variants by a
//! 32-byte chained root committing to the previous erasure set.

use lru::LruCache;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use solana_clock::Slot;
use solana_hash::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub const MAX_DATA_SHREDS_PER_SLOT: usize = 32_768;
/// Maximum number of data shreds the shredder places in one erasure set.
pub const DATA_SHREDS_PER_FEC_BLOCK: usize = 32;

pub const SIZE_OF_SIGNATURE: usize = 64;
pub const SIZE_OF_COMMON_SHRED_HEADER: usize = 83;
pub const SIZE_OF_DATA_SHRED_HEADERS: usize = 88;
pub const SIZE_OF_CODING_SHRED_HEADERS: usize = 89;
pub const SIZE_OF_MERKLE_ROOT: usize = 32;

/// Every data shred payload is exactly this long; it is also the
/// Reed-Solomon shard size, so recovered data shreds come back
/// byte-identical, signature included.
pub const DATA_SHRED_PAYLOAD_SIZE: usize = 1228;
pub const ERASURE_SHARD_SIZE: usize = DATA_SHRED_PAYLOAD_SIZE;

pub(crate) const OFFSET_OF_SHRED_VARIANT: usize = SIZE_OF_SIGNATURE;
pub(crate) const OFFSET_OF_SHRED_SLOT: usize = 65;
pub(crate) const OFFSET_OF_SHRED_INDEX: usize = 73;
pub(crate) const OFFSET_OF_SHRED_VERSION: usize = 77;
pub(crate) const OFFSET_OF_FEC_SET_INDEX: usize = 79;
pub(crate) const OFFSET_OF_PARENT_OFFSET: usize = 83;
pub(crate) const OFFSET_OF_DATA_FLAGS: usize = 85;
pub(crate) const OFFSET_OF_DATA_SIZE: usize = 86;
pub(crate) const OFFSET_OF_NUM_DATA_SHREDS: usize = 83;
pub(crate) const OFFSET_OF_NUM_CODING_SHREDS: usize = 85;
pub(crate) const OFFSET_OF_CODING_POSITION: usize = 87;

pub type Payload = Vec<u8>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid data size: {size}, payload: {payload}")]
    InvalidDataSize { size: u16, payload: usize },
    #[error("Invalid erasure config: {num_data} data, {num_coding} coding")]
    InvalidErasureConfig { num_data: usize, num_coding: usize },
    #[error("Invalid parent offset: {parent_offset}, slot: {slot}")]
    InvalidParentOffset { slot: Slot, parent_offset: u16 },
    #[error("Invalid parent slot: {parent_slot}, slot: {slot}")]
    InvalidParentSlot { slot: Slot, parent_slot: Slot },
    #[error("Invalid payload size: {0}")]
    InvalidPayloadSize(usize),
    #[error("Invalid recovered shred")]
    InvalidRecoveredShred,
    #[error("Invalid shred flags: {0:#010b}")]
    InvalidShredFlags(u8),
    #[error("Invalid shred index: {0}")]
    InvalidShredIndex(u32),
    #[error("Invalid shred type")]
    InvalidShredType,
    #[error("Invalid shred variant: {0:#04x}")]
    InvalidShredVariant(u8),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error(transparent)]
    ErasureError(#[from] reed_solomon_erasure::Error),
    #[error("Too few shards present")]
    TooFewShardsPresent,
}

#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, IntoPrimitive, Serialize, TryFromPrimitive,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum ShredType {
    Data = 0b1010_0101,
    Code = 0b0101_1010,
}

/// The variant byte at offset 64. Legacy discriminants double as the
/// [`ShredType`] values; Merkle variants use the high nibble.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShredVariant {
    LegacyData,
    LegacyCode,
    MerkleData { chained: bool },
    MerkleCode { chained: bool },
}

impl From<ShredVariant> for u8 {
    fn from(shred_variant: ShredVariant) -> u8 {
        match shred_variant {
            ShredVariant::LegacyData => u8::from(ShredType::Data),
            ShredVariant::LegacyCode => u8::from(ShredType::Code),
            ShredVariant::MerkleData { chained: false } => 0x80,
            ShredVariant::MerkleData { chained: true } => 0x90,
            ShredVariant::MerkleCode { chained: false } => 0x40,
            ShredVariant::MerkleCode { chained: true } => 0x60,
        }
    }
}

impl TryFrom<u8> for ShredVariant {
    type Error = Error;
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0xa5 => Ok(ShredVariant::LegacyData),
            0x5a => Ok(ShredVariant::LegacyCode),
            0x80 => Ok(ShredVariant::MerkleData { chained: false }),
            0x90 => Ok(ShredVariant::MerkleData { chained: true }),
            0x40 => Ok(ShredVariant::MerkleCode { chained: false }),
            0x60 => Ok(ShredVariant::MerkleCode { chained: true }),
            other => Err(Error::InvalidShredVariant(other)),
        }
    }
}

impl From<ShredVariant> for ShredType {
    fn from(shred_variant: ShredVariant) -> Self {
        match shred_variant {
            ShredVariant::LegacyData | ShredVariant::MerkleData { .. } => ShredType::Data,
            ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. } => ShredType::Code,
        }
    }
}

impl ShredVariant {
    /// Size of the Merkle root appendix at the payload tail.
    pub(crate) fn merkle_appendix_size(self) -> usize {
        match self {
            ShredVariant::LegacyData | ShredVariant::LegacyCode => 0,
            ShredVariant::MerkleData { chained } | ShredVariant::MerkleCode { chained } => {
                SIZE_OF_MERKLE_ROOT + if chained { SIZE_OF_MERKLE_ROOT } else { 0 }
            }
        }
    }

    pub(crate) fn expected_payload_size(self) -> usize {
        match self {
            ShredVariant::LegacyData | ShredVariant::MerkleData { .. } => DATA_SHRED_PAYLOAD_SIZE,
            ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. } => {
                SIZE_OF_CODING_SHRED_HEADERS + ERASURE_SHARD_SIZE + self.merkle_appendix_size()
            }
        }
    }

    fn is_chained(self) -> bool {
        matches!(
            self,
            ShredVariant::MerkleData { chained: true } | ShredVariant::MerkleCode { chained: true }
        )
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ShredFlags: u8 {
        const SHRED_TICK_REFERENCE_MASK = 0b0011_1111;
        const DATA_COMPLETE_SHRED       = 0b0100_0000;
        const LAST_SHRED_IN_SLOT        = 0b1100_0000;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShredCommonHeader {
    pub(crate) signature: Signature,
    pub(crate) shred_variant: ShredVariant,
    pub(crate) slot: Slot,
    pub(crate) index: u32,
    pub(crate) version: u16,
    pub(crate) fec_set_index: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DataShredHeader {
    pub(crate) parent_offset: u16,
    pub(crate) flags: ShredFlags,
    pub(crate) size: u16,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CodingShredHeader {
    pub(crate) num_data_shreds: u16,
    pub(crate) num_coding_shreds: u16,
    pub(crate) position: u16,
}

/// Unique identifier of a shred: (slot, index, type).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ShredId(Slot, /*shred index:*/ u32, ShredType);

impl ShredId {
    pub fn new(slot: Slot, index: u32, shred_type: ShredType) -> ShredId {
        ShredId(slot, index, shred_type)
    }

    pub fn slot(&self) -> Slot {
        self.0
    }

    pub fn index(&self) -> u32 {
        self.1
    }

    pub fn shred_type(&self) -> ShredType {
        self.2
    }
}

/// Identifier of an erasure set: (slot, fec_set_index). The `Ord` impl is
/// significant: working sets keyed by `ErasureSetId` iterate the sets of
/// one slot in ascending fec-set order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ErasureSetId(Slot, /*fec_set_index:*/ u32);

impl ErasureSetId {
    pub fn new(slot: Slot, fec_set_index: u32) -> Self {
        ErasureSetId(slot, fec_set_index)
    }

    pub fn slot(&self) -> Slot {
        self.0
    }

    pub fn fec_set_index(&self) -> u32 {
        self.1
    }

    // Storage key for ErasureMeta and MerkleRootMeta in blockstore db.
    pub(crate) fn store_key(&self) -> (Slot, u32) {
        (self.0, self.1)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Shred {
    common_header: ShredCommonHeader,
    data_header: DataShredHeader,
    coding_header: CodingShredHeader,
    payload: Payload,
}

impl Shred {
    /// Parses and sanitizes a shred from its wire bytes, taking ownership
    /// of the payload.
    pub fn new_from_serialized_shred(payload: Payload) -> Result<Self, Error> {
        let Some(&variant_byte) = payload.get(OFFSET_OF_SHRED_VARIANT) else {
            return Err(Error::InvalidPayloadSize(payload.len()));
        };
        let shred_variant = ShredVariant::try_from(variant_byte)?;
        if payload.len() != shred_variant.expected_payload_size() {
            return Err(Error::InvalidPayloadSize(payload.len()));
        }
        let signature = Signature::try_from(&payload[..SIZE_OF_SIGNATURE])
            .map_err(|_| Error::InvalidSignature)?;
        let common_header = ShredCommonHeader {
            signature,
            shred_variant,
            slot: get_u64(&payload, OFFSET_OF_SHRED_SLOT),
            index: get_u32(&payload, OFFSET_OF_SHRED_INDEX),
            version: get_u16(&payload, OFFSET_OF_SHRED_VERSION),
            fec_set_index: get_u32(&payload, OFFSET_OF_FEC_SET_INDEX),
        };
        let mut data_header = DataShredHeader::default();
        let mut coding_header = CodingShredHeader::default();
        match ShredType::from(shred_variant) {
            ShredType::Data => {
                data_header = DataShredHeader {
                    parent_offset: get_u16(&payload, OFFSET_OF_PARENT_OFFSET),
                    flags: ShredFlags::from_bits_retain(payload[OFFSET_OF_DATA_FLAGS]),
                    size: get_u16(&payload, OFFSET_OF_DATA_SIZE),
                };
            }
            ShredType::Code => {
                coding_header = CodingShredHeader {
                    num_data_shreds: get_u16(&payload, OFFSET_OF_NUM_DATA_SHREDS),
                    num_coding_shreds: get_u16(&payload, OFFSET_OF_NUM_CODING_SHREDS),
                    position: get_u16(&payload, OFFSET_OF_CODING_POSITION),
                };
            }
        }
        let shred = Self {
            common_header,
            data_header,
            coding_header,
            payload,
        };
        shred.sanitize()?;
        Ok(shred)
    }

    pub fn sanitize(&self) -> Result<(), Error> {
        if self.common_header.index as usize >= MAX_DATA_SHREDS_PER_SLOT {
            return Err(Error::InvalidShredIndex(self.common_header.index));
        }
        match self.shred_type() {
            ShredType::Data => {
                let size = usize::from(self.data_header.size);
                let capacity_end =
                    self.payload.len() - self.common_header.shred_variant.merkle_appendix_size();
                if size < SIZE_OF_DATA_SHRED_HEADERS || size > capacity_end {
                    return Err(Error::InvalidDataSize {
                        size: self.data_header.size,
                        payload: self.payload.len(),
                    });
                }
                let flags = self.data_header.flags;
                if flags.intersects(ShredFlags::LAST_SHRED_IN_SLOT)
                    && !flags.contains(ShredFlags::DATA_COMPLETE_SHRED)
                {
                    return Err(Error::InvalidShredFlags(flags.bits()));
                }
                // A zero parent offset is only meaningful for slot zero.
                let parent_offset = self.data_header.parent_offset;
                if (parent_offset == 0 && self.slot() != 0)
                    || u64::from(parent_offset) > self.slot()
                {
                    return Err(Error::InvalidParentOffset {
                        slot: self.slot(),
                        parent_offset,
                    });
                }
            }
            ShredType::Code => {
                let num_data = usize::from(self.coding_header.num_data_shreds);
                let num_coding = usize::from(self.coding_header.num_coding_shreds);
                if num_data == 0 || num_coding == 0 || num_data + num_coding > 255 {
                    return Err(Error::InvalidErasureConfig {
                        num_data,
                        num_coding,
                    });
                }
                if usize::from(self.coding_header.position) >= num_coding
                    || self.first_coding_index().is_none()
                {
                    return Err(Error::InvalidShredIndex(self.common_header.index));
                }
            }
        }
        Ok(())
    }

    pub fn slot(&self) -> Slot {
        self.common_header.slot
    }

    pub fn index(&self) -> u32 {
        self.common_header.index
    }

    pub fn version(&self) -> u16 {
        self.common_header.version
    }

    pub fn fec_set_index(&self) -> u32 {
        self.common_header.fec_set_index
    }

    pub fn signature(&self) -> &Signature {
        &self.common_header.signature
    }

    pub fn shred_type(&self) -> ShredType {
        ShredType::from(self.common_header.shred_variant)
    }

    pub fn is_data(&self) -> bool {
        self.shred_type() == ShredType::Data
    }

    pub fn is_code(&self) -> bool {
        self.shred_type() == ShredType::Code
    }

    pub fn id(&self) -> ShredId {
        ShredId(self.slot(), self.index(), self.shred_type())
    }

    pub fn erasure_set(&self) -> ErasureSetId {
        ErasureSetId(self.slot(), self.fec_set_index())
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn last_in_slot(&self) -> bool {
        self.is_data() && self.data_header.flags.contains(ShredFlags::LAST_SHRED_IN_SLOT)
    }

    pub fn data_complete(&self) -> bool {
        self.is_data() && self.data_header.flags.contains(ShredFlags::DATA_COMPLETE_SHRED)
    }

    pub fn reference_tick(&self) -> u8 {
        if self.is_data() {
            (self.data_header.flags & ShredFlags::SHRED_TICK_REFERENCE_MASK).bits()
        } else {
            0
        }
    }

    /// The slot this shred's block derives from; data shreds only.
    pub fn parent(&self) -> Result<Slot, Error> {
        match self.shred_type() {
            ShredType::Data => {
                let slot = self.slot();
                let parent_offset = self.data_header.parent_offset;
                if parent_offset == 0 && slot != 0 {
                    return Err(Error::InvalidParentOffset {
                        slot,
                        parent_offset,
                    });
                }
                slot.checked_sub(Slot::from(parent_offset))
                    .ok_or(Error::InvalidParentOffset {
                        slot,
                        parent_offset,
                    })
            }
            ShredType::Code => Err(Error::InvalidShredType),
        }
    }

    /// Entry bytes carried by a data shred.
    pub fn data(&self) -> Result<&[u8], Error> {
        match self.shred_type() {
            ShredType::Data => {
                let size = usize::from(self.data_header.size);
                self.payload
                    .get(SIZE_OF_DATA_SHRED_HEADERS..size)
                    .ok_or(Error::InvalidDataSize {
                        size: self.data_header.size,
                        payload: self.payload.len(),
                    })
            }
            ShredType::Code => Err(Error::InvalidShredType),
        }
    }

    /// Merkle root of this shred's erasure set; `None` for legacy shreds.
    pub fn merkle_root(&self) -> Option<Hash> {
        let appendix = self.common_header.shred_variant.merkle_appendix_size();
        if appendix == 0 {
            return None;
        }
        let offset = self.payload.len() - appendix;
        read_hash(&self.payload[offset..offset + SIZE_OF_MERKLE_ROOT])
    }

    /// Merkle root of the preceding erasure set; chained variants only.
    pub fn chained_merkle_root(&self) -> Option<Hash> {
        if !self.common_header.shred_variant.is_chained() {
            return None;
        }
        let offset = self.payload.len() - SIZE_OF_MERKLE_ROOT;
        read_hash(&self.payload[offset..])
    }

    /// Index of the first coding shred in this shred's erasure set.
    pub fn first_coding_index(&self) -> Option<u32> {
        match self.shred_type() {
            ShredType::Data => None,
            ShredType::Code => self
                .common_header
                .index
                .checked_sub(u32::from(self.coding_header.position)),
        }
    }

    pub(crate) fn num_data_shreds(&self) -> u16 {
        self.coding_header.num_data_shreds
    }

    pub(crate) fn num_coding_shreds(&self) -> u16 {
        self.coding_header.num_coding_shreds
    }

    /// The Reed-Solomon shard this shred contributes to its erasure set.
    pub(crate) fn erasure_shard(&self) -> Result<Vec<u8>, Error> {
        match self.shred_type() {
            ShredType::Data => Ok(self.payload.clone()),
            ShredType::Code => self
                .payload
                .get(
                    SIZE_OF_CODING_SHRED_HEADERS
                        ..SIZE_OF_CODING_SHRED_HEADERS + ERASURE_SHARD_SIZE,
                )
                .map(<[u8]>::to_vec)
                .ok_or(Error::InvalidPayloadSize(self.payload.len())),
        }
    }

    /// Verifies the leader's signature. Merkle shreds sign the Merkle
    /// root; legacy shreds sign everything after the signature itself.
    pub fn verify(&self, pubkey: &Pubkey) -> bool {
        match self.merkle_root() {
            Some(root) => self
                .common_header
                .signature
                .verify(pubkey.as_ref(), root.as_ref()),
            None => self
                .common_header
                .signature
                .verify(pubkey.as_ref(), &self.payload[SIZE_OF_SIGNATURE..]),
        }
    }
}

fn get_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn get_u32(payload: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&payload[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(payload: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_hash(bytes: &[u8]) -> Option<Hash> {
    <[u8; SIZE_OF_MERKLE_ROOT]>::try_from(bytes)
        .ok()
        .map(Hash::new_from_array)
}

/// Helpers reading fields straight off serialized payloads, without
/// deserializing a full [`Shred`].
pub mod layout {
    use super::*;

    /// Merkle root of the shred's erasure set; `None` for legacy shreds.
    pub fn get_merkle_root(payload: &[u8]) -> Option<Hash> {
        let variant = ShredVariant::try_from(*payload.get(OFFSET_OF_SHRED_VARIANT)?).ok()?;
        let appendix = variant.merkle_appendix_size();
        if appendix == 0 {
            return None;
        }
        let offset = payload.len().checked_sub(appendix)?;
        read_hash(payload.get(offset..offset + SIZE_OF_MERKLE_ROOT)?)
    }

    /// Merkle root of the preceding erasure set; chained variants only.
    pub fn get_chained_merkle_root(payload: &[u8]) -> Option<Hash> {
        let variant = ShredVariant::try_from(*payload.get(OFFSET_OF_SHRED_VARIANT)?).ok()?;
        if !variant.is_chained() {
            return None;
        }
        let offset = payload.len().checked_sub(SIZE_OF_MERKLE_ROOT)?;
        read_hash(payload.get(offset..)?)
    }
}

/// Accepts shreds for (slot, parent, root) only when the chain is
/// plausible: the parent must be at or past the root and strictly older
/// than the slot. The all-zero triple is genesis.
pub fn verify_shred_slots(slot: Slot, parent: Slot, root: Slot) -> bool {
    if slot == 0 && parent == 0 && root == 0 {
        return true; // valid write to slot zero.
    }
    // Ignore shreds that chain to slots before the root,
    // or have invalid parent >= slot.
    root <= parent && parent < slot
}

/// Caches Reed-Solomon instances keyed by erasure config; building one is
/// quadratic in the number of shards.
pub struct ReedSolomonCache(
    Mutex<LruCache</*(data_shards, parity_shards):*/ (usize, usize), Arc<ReedSolomon>>>,
);

impl ReedSolomonCache {
    const CAPACITY: NonZeroUsize = NonZeroUsize::new(4 * DATA_SHREDS_PER_FEC_BLOCK).unwrap();

    pub(crate) fn get(
        &self,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<Arc<ReedSolomon>, reed_solomon_erasure::Error> {
        let key = (data_shards, parity_shards);
        if let Some(entry) = self.0.lock().unwrap().get(&key) {
            return Ok(entry.clone());
        }
        let entry = Arc::new(ReedSolomon::new(data_shards, parity_shards)?);
        self.0.lock().unwrap().put(key, entry.clone());
        Ok(entry)
    }
}

impl Default for ReedSolomonCache {
    fn default() -> Self {
        Self(Mutex::new(LruCache::new(Self::CAPACITY)))
    }
}

/// Reconstructs the missing shreds of one erasure set.
///
/// `shreds` is the union of whatever data and coding shreds of the set
/// are available, in any order. The erasure config is read off a coding
/// shred (there must be at least one, otherwise recovery would not be
/// needed). Returns only the shreds that were absent from the input:
/// missing data shreds always come back byte-identical; missing coding
/// shreds are rebuilt for Merkle variants, whose signature and Merkle
/// appendix are shared across the set. A legacy coding shred signs its
/// own payload, so the leader's signature for a missing one cannot be
/// rebuilt from parity and only its data siblings are returned.
pub fn recover(
    shreds: Vec<Shred>,
    reed_solomon_cache: &ReedSolomonCache,
) -> Result<Vec<Shred>, Error> {
    let Some(code_shred) = shreds.iter().find(|shred| shred.is_code()) else {
        return Err(Error::TooFewShardsPresent);
    };
    let slot = code_shred.slot();
    let fec_set_index = code_shred.fec_set_index();
    let num_data = usize::from(code_shred.num_data_shreds());
    let num_coding = usize::from(code_shred.num_coding_shreds());
    let Some(first_coding_index) = code_shred.first_coding_index() else {
        return Err(Error::InvalidShredIndex(code_shred.index()));
    };
    let rebuild_coding_shreds = matches!(
        code_shred.common_header.shred_variant,
        ShredVariant::MerkleCode { .. }
    );
    let num_shards = num_data + num_coding;
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; num_shards];
    let mut mask = vec![false; num_shards];
    for shred in &shreds {
        if shred.slot() != slot || shred.fec_set_index() != fec_set_index {
            return Err(Error::InvalidRecoveredShred);
        }
        let position = match shred.shred_type() {
            ShredType::Data => {
                let Some(position) = shred.index().checked_sub(fec_set_index) else {
                    return Err(Error::InvalidShredIndex(shred.index()));
                };
                position as usize
            }
            ShredType::Code => {
                let Some(position) = shred.index().checked_sub(first_coding_index) else {
                    return Err(Error::InvalidShredIndex(shred.index()));
                };
                num_data + position as usize
            }
        };
        if position >= num_shards {
            return Err(Error::InvalidShredIndex(shred.index()));
        }
        mask[position] = true;
        shards[position] = Some(shred.erasure_shard()?);
    }
    reed_solomon_cache
        .get(num_data, num_coding)?
        .reconstruct(&mut shards)?;
    let mut recovered_shreds = Vec::new();
    for ((position, shard), was_present) in shards.into_iter().enumerate().zip(mask) {
        if was_present {
            continue;
        }
        let shard = shard.ok_or(Error::TooFewShardsPresent)?;
        let shred = if position < num_data {
            let shred = Shred::new_from_serialized_shred(shard)
                .map_err(|_| Error::InvalidRecoveredShred)?;
            if !shred.is_data() {
                return Err(Error::InvalidRecoveredShred);
            }
            shred
        } else if rebuild_coding_shreds {
            let position = position - num_data;
            let index = first_coding_index + position as u32;
            let mut payload = code_shred.payload().clone();
            payload[OFFSET_OF_SHRED_INDEX..OFFSET_OF_SHRED_INDEX + 4]
                .copy_from_slice(&index.to_le_bytes());
            payload[OFFSET_OF_CODING_POSITION..OFFSET_OF_CODING_POSITION + 2]
                .copy_from_slice(&(position as u16).to_le_bytes());
            payload[SIZE_OF_CODING_SHRED_HEADERS..SIZE_OF_CODING_SHRED_HEADERS + ERASURE_SHARD_SIZE]
                .copy_from_slice(&shard);
            Shred::new_from_serialized_shred(payload).map_err(|_| Error::InvalidRecoveredShred)?
        } else {
            continue;
        };
        if shred.slot() != slot || shred.fec_set_index() != fec_set_index {
            return Err(Error::InvalidRecoveredShred);
        }
        recovered_shreds.push(shred);
    }
    Ok(recovered_shreds)
}
