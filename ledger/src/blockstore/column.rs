//! Typed descriptions of the blockstore's column families.
//!
//! Keys are serialized big-endian so that rocksdb's lexicographic byte
//! order matches numeric order; composite keys sort primarily by slot.
//! Values are encoded with bincode through [`TypedColumn`].

use crate::blockstore_meta;
use crate::shred::ErasureSetId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use solana_clock::Slot;

pub trait Column {
    type Index;
    type Key: AsRef<[u8]>;

    fn key(index: &Self::Index) -> Self::Key;
    fn index(key: &[u8]) -> Self::Index;
    // The slot portion of this column's index, used by slot-ranged
    // cleanup.
    fn slot(index: Self::Index) -> Slot;
    // The lowest index of `slot` in this column.
    fn as_index(slot: Slot) -> Self::Index;
}

pub trait ColumnName {
    const NAME: &'static str;
}

pub trait TypedColumn: Column {
    type Type: Serialize + DeserializeOwned;

    fn serialize(value: &Self::Type) -> bincode::Result<Vec<u8>> {
        bincode::serialize(value)
    }

    fn deserialize(data: &[u8]) -> bincode::Result<Self::Type> {
        bincode::deserialize(data)
    }
}

/// Marker trait for columns keyed by a plain slot.
pub trait SlotColumn {}

impl<T: SlotColumn> Column for T {
    type Index = Slot;
    type Key = [u8; 8];

    fn key(slot: &Slot) -> Self::Key {
        slot.to_be_bytes()
    }

    fn index(key: &[u8]) -> Slot {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&key[..8]);
        Slot::from_be_bytes(bytes)
    }

    fn slot(index: Self::Index) -> Slot {
        index
    }

    fn as_index(slot: Slot) -> Self::Index {
        slot
    }
}

pub mod columns {
    /// The slot metadata column: slot -> SlotMeta
    #[derive(Debug)]
    pub struct SlotMeta;

    /// The dead slots column: slot -> bool
    #[derive(Debug)]
    pub struct DeadSlots;

    /// The duplicate slots column: slot -> DuplicateSlotProof
    #[derive(Debug)]
    pub struct DuplicateSlots;

    /// The erasure meta column: (slot, fec_set_index) -> ErasureMeta
    #[derive(Debug)]
    pub struct ErasureMeta;

    /// The orphans column: slot -> bool
    #[derive(Debug)]
    pub struct Orphans;

    /// The root column: slot -> bool
    #[derive(Debug)]
    pub struct Root;

    /// The shred index column: slot -> Index
    #[derive(Debug)]
    pub struct Index;

    /// The data shred column: (slot, index) -> payload bytes
    #[derive(Debug)]
    pub struct ShredData;

    /// The code shred column: (slot, index) -> payload bytes
    #[derive(Debug)]
    pub struct ShredCode;

    /// The merkle root meta column: (slot, fec_set_index) -> MerkleRootMeta
    #[derive(Debug)]
    pub struct MerkleRootMeta;
}

impl SlotColumn for columns::SlotMeta {}
impl ColumnName for columns::SlotMeta {
    const NAME: &'static str = "meta";
}
impl TypedColumn for columns::SlotMeta {
    type Type = blockstore_meta::SlotMeta;
}

impl SlotColumn for columns::DeadSlots {}
impl ColumnName for columns::DeadSlots {
    const NAME: &'static str = "dead_slots";
}
impl TypedColumn for columns::DeadSlots {
    type Type = bool;
}

impl SlotColumn for columns::DuplicateSlots {}
impl ColumnName for columns::DuplicateSlots {
    const NAME: &'static str = "duplicate_slots";
}
impl TypedColumn for columns::DuplicateSlots {
    type Type = blockstore_meta::DuplicateSlotProof;
}

impl SlotColumn for columns::Orphans {}
impl ColumnName for columns::Orphans {
    const NAME: &'static str = "orphans";
}
impl TypedColumn for columns::Orphans {
    type Type = bool;
}

impl SlotColumn for columns::Root {}
impl ColumnName for columns::Root {
    const NAME: &'static str = "root";
}
impl TypedColumn for columns::Root {
    type Type = bool;
}

impl SlotColumn for columns::Index {}
impl ColumnName for columns::Index {
    const NAME: &'static str = "index";
}
impl TypedColumn for columns::Index {
    type Type = blockstore_meta::Index;
}

impl Column for columns::ShredData {
    type Index = (Slot, u64);
    type Key = [u8; 16];

    fn key((slot, index): &Self::Index) -> Self::Key {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&slot.to_be_bytes());
        key[8..].copy_from_slice(&index.to_be_bytes());
        key
    }

    fn index(key: &[u8]) -> Self::Index {
        let mut slot_bytes = [0u8; 8];
        let mut index_bytes = [0u8; 8];
        slot_bytes.copy_from_slice(&key[..8]);
        index_bytes.copy_from_slice(&key[8..16]);
        (
            Slot::from_be_bytes(slot_bytes),
            u64::from_be_bytes(index_bytes),
        )
    }

    fn slot(index: Self::Index) -> Slot {
        index.0
    }

    fn as_index(slot: Slot) -> Self::Index {
        (slot, 0)
    }
}
impl ColumnName for columns::ShredData {
    const NAME: &'static str = "data_shred";
}

impl Column for columns::ShredCode {
    type Index = (Slot, u64);
    type Key = [u8; 16];

    fn key(index: &Self::Index) -> Self::Key {
        columns::ShredData::key(index)
    }

    fn index(key: &[u8]) -> Self::Index {
        columns::ShredData::index(key)
    }

    fn slot(index: Self::Index) -> Slot {
        index.0
    }

    fn as_index(slot: Slot) -> Self::Index {
        (slot, 0)
    }
}
impl ColumnName for columns::ShredCode {
    const NAME: &'static str = "code_shred";
}

fn erasure_set_key(erasure_set: &ErasureSetId) -> [u8; 12] {
    let (slot, fec_set_index) = erasure_set.store_key();
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&slot.to_be_bytes());
    key[8..].copy_from_slice(&fec_set_index.to_be_bytes());
    key
}

fn erasure_set_index(key: &[u8]) -> ErasureSetId {
    let mut slot_bytes = [0u8; 8];
    let mut fec_set_index_bytes = [0u8; 4];
    slot_bytes.copy_from_slice(&key[..8]);
    fec_set_index_bytes.copy_from_slice(&key[8..12]);
    ErasureSetId::new(
        Slot::from_be_bytes(slot_bytes),
        u32::from_be_bytes(fec_set_index_bytes),
    )
}

impl Column for columns::ErasureMeta {
    type Index = ErasureSetId;
    type Key = [u8; 12];

    fn key(erasure_set: &Self::Index) -> Self::Key {
        erasure_set_key(erasure_set)
    }

    fn index(key: &[u8]) -> Self::Index {
        erasure_set_index(key)
    }

    fn slot(index: Self::Index) -> Slot {
        index.slot()
    }

    fn as_index(slot: Slot) -> Self::Index {
        ErasureSetId::new(slot, 0)
    }
}
impl ColumnName for columns::ErasureMeta {
    const NAME: &'static str = "erasure_meta";
}
impl TypedColumn for columns::ErasureMeta {
    type Type = blockstore_meta::ErasureMeta;
}

impl Column for columns::MerkleRootMeta {
    type Index = ErasureSetId;
    type Key = [u8; 12];

    fn key(erasure_set: &Self::Index) -> Self::Key {
        erasure_set_key(erasure_set)
    }

    fn index(key: &[u8]) -> Self::Index {
        erasure_set_index(key)
    }

    fn slot(index: Self::Index) -> Slot {
        index.slot()
    }

    fn as_index(slot: Slot) -> Self::Index {
        ErasureSetId::new(slot, 0)
    }
}
impl ColumnName for columns::MerkleRootMeta {
    const NAME: &'static str = "merkle_root_meta";
}
impl TypedColumn for columns::MerkleRootMeta {
    type Type = blockstore_meta::MerkleRootMeta;
}
