//! The blockstore: the validator's ledger store, keyed by slot and backed
//! by a rocksdb instance with typed column families.
//!
//! The heart of this module is the shred insertion pipeline
//! ([`Blockstore::do_insert_shreds`]): it admits erasure-coded shreds
//! arriving out of order from the network, validates them against per-slot
//! metadata, recovers missing data shreds per erasure set, detects leader
//! equivocation, maintains the parent/child slot graph, and commits all
//! resulting column updates as one atomic write batch.

use crate::blockstore::column::columns as cf;
use crate::blockstore_db::{IteratorDirection, IteratorMode, LedgerColumn, Rocks, WriteBatch};
use crate::blockstore_meta::{
    CompletedDataIndexes, DuplicateSlotProof, ErasureMeta, ErasureMetaStatus, Index,
    MerkleRootMeta, ShredIndex, SlotMeta,
};
use crate::blockstore_metrics::ShredInsertionMetrics;
use crate::blockstore_options::{BlockstoreOptions, BLOCKSTORE_DIRECTORY_ROCKS_LEVEL};
use crate::shred::{
    self, verify_shred_slots, ErasureSetId, Payload, ReedSolomonCache, Shred, ShredId, ShredType,
};
use crate::slot_stats::{ShredSource, SlotsStats};
use bincode::deserialize;
use crossbeam_channel::Sender;
use log::{error, info, trace, warn};
use slate_measure::measure::Measure;
use solana_clock::{Slot, DEFAULT_TICKS_PER_SECOND};
use solana_hash::Hash;
use solana_pubkey::Pubkey;
use solana_time_utils::timestamp;
use std::borrow::Cow;
use std::cell::RefCell;
use std::cmp;
use std::collections::btree_map::Entry as BTreeMapEntry;
use std::collections::hash_map::Entry as HashMapEntry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
pub use {
    crate::blockstore::error::{BlockstoreError, Result},
    rocksdb::properties as RocksProperties,
};

pub mod column;
pub mod error;

pub type CompletedSlotsSender = Sender<Vec<Slot>>;
pub type CompletedSlotsReceiver = crossbeam_channel::Receiver<Vec<Slot>>;

/// A slot-leader lookup, used to verify recovered shreds.
pub type LeaderScheduleFn = dyn Fn(Slot) -> Option<Pubkey>;

/// A range of data shreds, all in one slot, carrying one complete data
/// set (an application-level entry boundary).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompletedDataSetInfo {
    pub slot: Slot,
    /// Data shred indices of the completed range, `[start, end)`.
    pub indices: Range<u32>,
}

/// Evidence of duplicate or conflicting shreds from the same leader,
/// collected while inserting and returned to the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PossibleDuplicateShred {
    /// Blockstore has another shred in this shred's spot
    Exists(Shred),
    /// The index of this shred conflicts with the slot's recorded last index
    LastIndexConflict(/* original */ Shred, /* conflict */ Payload),
    /// The erasure config of this coding shred conflicts with the config
    /// recorded for its erasure set
    ErasureConflict(Shred, Payload),
    /// The shred's Merkle root disagrees with its erasure set's recorded root
    MerkleRootConflict(Shred, Payload),
    /// The chained Merkle root disagrees with the adjacent erasure set's root
    ChainedMerkleRootConflict(Shred, Payload),
}

impl PossibleDuplicateShred {
    pub fn slot(&self) -> Slot {
        match self {
            Self::Exists(shred) => shred.slot(),
            Self::LastIndexConflict(shred, _) => shred.slot(),
            Self::ErasureConflict(shred, _) => shred.slot(),
            Self::MerkleRootConflict(shred, _) => shred.slot(),
            Self::ChainedMerkleRootConflict(shred, _) => shred.slot(),
        }
    }
}

pub struct InsertResults {
    pub completed_data_set_infos: Vec<CompletedDataSetInfo>,
    pub duplicates: Vec<PossibleDuplicateShred>,
}

#[derive(Debug, thiserror::Error)]
pub enum InsertDataShredError {
    #[error("Data shred already exists in Blockstore")]
    Exists,
    #[error("Invalid data shred")]
    InvalidShred,
    #[error(transparent)]
    BlockstoreError(#[from] BlockstoreError),
}

/// A working-set entry, tagged by whether it diverged from the backing
/// store. Only `Dirty` entries are flushed at commit time.
enum WorkingEntry<T> {
    // Value has been modified with respect to the blockstore column
    Dirty(T),
    // Value matches what is currently in the blockstore column
    Clean(T),
}

impl<T> WorkingEntry<T> {
    fn should_write(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }
}

impl<T> AsRef<T> for WorkingEntry<T> {
    fn as_ref(&self) -> &T {
        match self {
            Self::Dirty(value) => value,
            Self::Clean(value) => value,
        }
    }
}

// Struct to keep track of the current status of a slot's SlotMeta within
// one insert call.
struct SlotMetaWorkingSetEntry {
    // The dirty version of the `SlotMeta`
    new_slot_meta: Rc<RefCell<SlotMeta>>,
    // The old version of the `SlotMeta` before it was modified by this
    // batch of shreds
    old_slot_meta: Option<SlotMeta>,
    // True only if at least one shred for this SlotMeta was inserted since
    // this struct was created
    did_insert_occur: bool,
}

impl SlotMetaWorkingSetEntry {
    fn new(new_slot_meta: Rc<RefCell<SlotMeta>>, old_slot_meta: Option<SlotMeta>) -> Self {
        Self {
            new_slot_meta,
            old_slot_meta,
            did_insert_occur: false,
        }
    }
}

struct IndexMetaWorkingSetEntry {
    index: Index,
    // True only if at least one shred for this Index was inserted since
    // this struct was created
    did_insert_occur: bool,
}

/// Per-call scratch state of one insert call, layered over the store.
///
/// The erasure-meta map is ordered by erasure set id: both recovery and
/// the forward Merkle-chain pass walk the sets of a slot in ascending
/// fec-set order to reason about the "next" set.
struct ShredInsertionTracker<'a> {
    just_inserted_shreds: HashMap<ShredId, Shred>,
    erasure_metas: BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
    merkle_root_metas: HashMap<ErasureSetId, WorkingEntry<MerkleRootMeta>>,
    slot_meta_working_set: HashMap<u64, SlotMetaWorkingSetEntry>,
    index_working_set: HashMap<u64, IndexMetaWorkingSetEntry>,
    duplicate_shreds: Vec<PossibleDuplicateShred>,
    write_batch: WriteBatch<'a>,
    newly_completed_data_sets: Vec<CompletedDataSetInfo>,
}

impl<'a> ShredInsertionTracker<'a> {
    fn new(num_shreds: usize, write_batch: WriteBatch<'a>) -> Self {
        Self {
            just_inserted_shreds: HashMap::with_capacity(num_shreds),
            erasure_metas: BTreeMap::new(),
            merkle_root_metas: HashMap::new(),
            slot_meta_working_set: HashMap::new(),
            index_working_set: HashMap::new(),
            duplicate_shreds: vec![],
            write_batch,
            newly_completed_data_sets: vec![],
        }
    }
}

// ledger window
pub struct Blockstore {
    ledger_path: PathBuf,
    db: Arc<Rocks>,
    // Column families
    code_shred_cf: LedgerColumn<cf::ShredCode>,
    data_shred_cf: LedgerColumn<cf::ShredData>,
    dead_slots_cf: LedgerColumn<cf::DeadSlots>,
    duplicate_slots_cf: LedgerColumn<cf::DuplicateSlots>,
    erasure_meta_cf: LedgerColumn<cf::ErasureMeta>,
    index_cf: LedgerColumn<cf::Index>,
    merkle_root_meta_cf: LedgerColumn<cf::MerkleRootMeta>,
    meta_cf: LedgerColumn<cf::SlotMeta>,
    orphans_cf: LedgerColumn<cf::Orphans>,
    roots_cf: LedgerColumn<cf::Root>,

    max_root: AtomicU64,
    insert_shreds_lock: Mutex<()>,
    new_shreds_signals: Mutex<Vec<Sender<bool>>>,
    completed_slots_senders: Mutex<Vec<CompletedSlotsSender>>,
    pub lowest_cleanup_slot: RwLock<Slot>,
    pub slots_stats: SlotsStats,
    insert_metrics: ShredInsertionMetrics,
}

impl Blockstore {
    /// Opens a Ledger in directory, provides "infinite" window of shreds
    pub fn open(ledger_path: &Path) -> Result<Blockstore> {
        Self::do_open(ledger_path, BlockstoreOptions::default())
    }

    pub fn open_with_options(ledger_path: &Path, options: BlockstoreOptions) -> Result<Blockstore> {
        Self::do_open(ledger_path, options)
    }

    /// Deletes the blockstore at the specified path.
    pub fn destroy(ledger_path: &Path) -> Result<()> {
        // Database::destroy() fails if the root directory doesn't exist
        fs::create_dir_all(ledger_path)?;
        Rocks::destroy(&Path::new(ledger_path).join(BLOCKSTORE_DIRECTORY_ROCKS_LEVEL))
    }

    fn do_open(ledger_path: &Path, options: BlockstoreOptions) -> Result<Blockstore> {
        fs::create_dir_all(ledger_path)?;
        let blockstore_path = ledger_path.join(BLOCKSTORE_DIRECTORY_ROCKS_LEVEL);

        // Open the database
        let mut measure = Measure::start("blockstore open");
        info!("Opening blockstore at {blockstore_path:?}");
        let db = Arc::new(Rocks::open(blockstore_path, options)?);

        let code_shred_cf = db.column();
        let data_shred_cf = db.column();
        let dead_slots_cf = db.column();
        let duplicate_slots_cf = db.column();
        let erasure_meta_cf = db.column();
        let index_cf = db.column();
        let merkle_root_meta_cf = db.column();
        let meta_cf = db.column();
        let orphans_cf = db.column();
        let roots_cf: LedgerColumn<cf::Root> = db.column();

        // Get max root or 0 if it doesn't exist
        let max_root = roots_cf
            .iter(IteratorMode::End)?
            .next()
            .map(|(slot, _)| slot)
            .unwrap_or(0);
        let max_root = AtomicU64::new(max_root);

        measure.stop();
        info!("Opening blockstore done; {measure}");
        Ok(Blockstore {
            ledger_path: ledger_path.to_path_buf(),
            db,
            code_shred_cf,
            data_shred_cf,
            dead_slots_cf,
            duplicate_slots_cf,
            erasure_meta_cf,
            index_cf,
            merkle_root_meta_cf,
            meta_cf,
            orphans_cf,
            roots_cf,
            max_root,
            insert_shreds_lock: Mutex::<()>::default(),
            new_shreds_signals: Mutex::default(),
            completed_slots_senders: Mutex::default(),
            lowest_cleanup_slot: RwLock::<Slot>::default(),
            slots_stats: SlotsStats::default(),
            insert_metrics: ShredInsertionMetrics::default(),
        })
    }

    pub fn ledger_path(&self) -> &PathBuf {
        &self.ledger_path
    }

    /// Returns whether the blockstore has primary (read and write) access
    pub fn is_primary_access(&self) -> bool {
        self.db.is_primary_access()
    }

    pub fn shred_insertion_metrics(&self) -> &ShredInsertionMetrics {
        &self.insert_metrics
    }

    pub fn add_new_shred_signal(&self, signal: Sender<bool>) {
        self.new_shreds_signals.lock().unwrap().push(signal);
    }

    pub fn add_completed_slots_signal(&self, signal: CompletedSlotsSender) {
        self.completed_slots_senders.lock().unwrap().push(signal);
    }

    /// The highest rooted slot; updated by the external pruning subsystem
    /// through [`Blockstore::set_roots`] and only read by the inserter.
    pub fn max_root(&self) -> Slot {
        self.max_root.load(Ordering::Relaxed)
    }

    pub fn set_roots<'a>(&self, rooted_slots: impl Iterator<Item = &'a Slot>) -> Result<()> {
        let mut write_batch = self.db.batch();
        let mut max_new_rooted_slot = 0;
        for slot in rooted_slots {
            max_new_rooted_slot = cmp::max(max_new_rooted_slot, *slot);
            self.slots_stats.mark_rooted(*slot);
            write_batch.put::<cf::Root>(*slot, &true)?;
        }
        self.db.write(write_batch)?;
        self.max_root.fetch_max(max_new_rooted_slot, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_root(&self, slot: Slot) -> Result<bool> {
        self.roots_cf.contains(slot)
    }

    pub fn meta(&self, slot: Slot) -> Result<Option<SlotMeta>> {
        self.meta_cf.get(slot)
    }

    pub fn get_index(&self, slot: Slot) -> Result<Option<Index>> {
        self.index_cf.get(slot)
    }

    pub fn erasure_meta(&self, erasure_set: ErasureSetId) -> Result<Option<ErasureMeta>> {
        self.erasure_meta_cf.get(erasure_set)
    }

    pub fn merkle_root_meta(&self, erasure_set: ErasureSetId) -> Result<Option<MerkleRootMeta>> {
        self.merkle_root_meta_cf.get(erasure_set)
    }

    pub fn get_data_shred(&self, slot: Slot, index: u64) -> Result<Option<Vec<u8>>> {
        self.data_shred_cf.get_bytes((slot, index))
    }

    pub fn get_coding_shred(&self, slot: Slot, index: u64) -> Result<Option<Vec<u8>>> {
        self.code_shred_cf.get_bytes((slot, index))
    }

    pub fn is_dead(&self, slot: Slot) -> bool {
        matches!(self.dead_slots_cf.get(slot), Ok(Some(true)))
    }

    pub fn get_duplicate_slot(&self, slot: Slot) -> Result<Option<DuplicateSlotProof>> {
        self.duplicate_slots_cf.get(slot)
    }

    pub fn has_duplicate_shreds_in_slot(&self, slot: Slot) -> bool {
        self.duplicate_slots_cf.contains(slot).unwrap_or(false)
    }

    /// Records two conflicting payloads of the same leader as proof of
    /// equivocation.
    pub fn store_duplicate_slot(&self, slot: Slot, shred1: Vec<u8>, shred2: Vec<u8>) -> Result<()> {
        let duplicate_slot_proof = DuplicateSlotProof::new(shred1, shred2);
        self.duplicate_slots_cf.put(slot, &duplicate_slot_proof)
    }

    pub fn slot_meta_iterator(
        &self,
        slot: Slot,
    ) -> Result<impl Iterator<Item = (Slot, SlotMeta)> + '_> {
        let meta_iter = self
            .meta_cf
            .iter(IteratorMode::From(slot, IteratorDirection::Forward))?;
        Ok(meta_iter.map(|(slot, slot_meta_bytes)| {
            (
                slot,
                deserialize(&slot_meta_bytes).unwrap_or_else(|err| {
                    panic!("Could not deserialize SlotMeta for slot {slot}: {err:?}")
                }),
            )
        }))
    }

    pub fn orphans_iterator(&self, slot: Slot) -> Result<impl Iterator<Item = u64> + '_> {
        let orphans_iter = self
            .orphans_cf
            .iter(IteratorMode::From(slot, IteratorDirection::Forward))?;
        Ok(orphans_iter.map(|(slot, _)| slot))
    }

    pub fn dead_slots_iterator(&self, slot: Slot) -> Result<impl Iterator<Item = Slot> + '_> {
        let dead_slots_iterator = self
            .dead_slots_cf
            .iter(IteratorMode::From(slot, IteratorDirection::Forward))?;
        Ok(dead_slots_iterator.map(|(slot, _)| slot))
    }

    /// Inserts shreds received over turbine, with the default recovery
    /// machinery and no retransmission.
    pub fn insert_shreds(
        &self,
        shreds: Vec<Shred>,
        leader_schedule: Option<&LeaderScheduleFn>,
        is_trusted: bool,
    ) -> Result<(Vec<CompletedDataSetInfo>, Vec<PossibleDuplicateShred>)> {
        let shreds_len = shreds.len();
        let insert_results = self.do_insert_shreds(
            shreds,
            vec![false; shreds_len],
            leader_schedule,
            is_trusted,
            None, // retransmit-sender
            &ReedSolomonCache::default(),
        )?;
        Ok((
            insert_results.completed_data_set_infos,
            insert_results.duplicates,
        ))
    }

    /// The insertion pipeline. One call runs fully under the exclusive
    /// insert lock and commits exactly one atomic write batch:
    ///
    /// 1. Seed an empty working set and open a write batch.
    /// 2. Admit each incoming shred (data or code), staging metadata
    ///    updates in the working set.
    /// 3. Run Reed-Solomon recovery for every erasure set that can now be
    ///    recovered; verified recovered shreds are re-admitted and their
    ///    payloads forwarded to `retransmit_sender`.
    /// 4. Chain slots: parent/child links, orphan bookkeeping, and
    ///    propagation of the transitive "connected" flag.
    /// 5. Check Merkle-root chaining across adjacent erasure sets
    ///    (consultative: conflicts are reported, never fatal).
    /// 6. Flush dirty working-set entries into the batch and commit.
    pub fn do_insert_shreds(
        &self,
        shreds: Vec<Shred>,
        is_repaired: Vec<bool>,
        leader_schedule: Option<&LeaderScheduleFn>,
        is_trusted: bool,
        retransmit_sender: Option<&Sender<Vec<Payload>>>,
        reed_solomon_cache: &ReedSolomonCache,
    ) -> Result<InsertResults> {
        assert_eq!(shreds.len(), is_repaired.len());
        let mut total_start = Measure::start("Total elapsed");

        let mut start = Measure::start("Blockstore lock");
        let _lock = self.insert_shreds_lock.lock().unwrap();
        start.stop();
        self.insert_metrics
            .insert_lock_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        let max_root = self.max_root();
        let num_shreds = shreds.len();
        let num_repair = is_repaired.iter().filter(|&&is_repaired| is_repaired).count();
        let mut shred_insertion_tracker =
            ShredInsertionTracker::new(num_shreds, self.db.batch());

        let mut start = Measure::start("Shred insertion");
        for (shred, is_repaired) in shreds.into_iter().zip(is_repaired) {
            let shred_source = if is_repaired {
                ShredSource::Repaired
            } else {
                ShredSource::Turbine
            };
            match shred.shred_type() {
                ShredType::Data => {
                    match self.check_insert_data_shred(
                        shred,
                        &mut shred_insertion_tracker,
                        is_trusted,
                        max_root,
                        shred_source,
                    ) {
                        Err(InsertDataShredError::Exists) => {
                            self.insert_metrics
                                .num_data_shreds_exists
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(InsertDataShredError::InvalidShred) => {
                            self.insert_metrics
                                .num_data_shreds_invalid
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(InsertDataShredError::BlockstoreError(err)) => {
                            return Err(err);
                        }
                        Ok(()) => {
                            self.insert_metrics
                                .num_inserted
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                ShredType::Code => {
                    if self.check_insert_coding_shred(
                        shred,
                        &mut shred_insertion_tracker,
                        is_trusted,
                        max_root,
                        shred_source,
                    )? {
                        self.insert_metrics
                            .num_inserted
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        start.stop();
        self.insert_metrics
            .insert_shreds_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        let mut start = Measure::start("Shred recovery");
        if let Some(leader_schedule) = leader_schedule {
            let recovered_shreds = self.try_shred_recovery(
                &shred_insertion_tracker.erasure_metas,
                &mut shred_insertion_tracker.index_working_set,
                &shred_insertion_tracker.just_inserted_shreds,
                reed_solomon_cache,
            )?;

            self.insert_metrics.num_recovered.fetch_add(
                recovered_shreds
                    .iter()
                    .filter(|shred| shred.is_data())
                    .count() as u64,
                Ordering::Relaxed,
            );
            let recovered_shreds: Vec<Payload> = recovered_shreds
                .into_iter()
                .filter_map(|shred| {
                    let leader = leader_schedule(shred.slot())?;
                    if !shred.verify(&leader) {
                        self.insert_metrics
                            .num_recovered_failed_sig
                            .fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                    // Since the data shreds are fully recovered from the
                    // erasure batch, recovered coding shreds are not stored
                    // in blockstore; their payloads only join the
                    // retransmit batch.
                    if shred.is_code() {
                        return Some(shred.into_payload());
                    }
                    match self.check_insert_data_shred(
                        shred.clone(),
                        &mut shred_insertion_tracker,
                        is_trusted,
                        max_root,
                        ShredSource::Recovered,
                    ) {
                        Err(InsertDataShredError::Exists) => {
                            self.insert_metrics
                                .num_recovered_exists
                                .fetch_add(1, Ordering::Relaxed);
                            None
                        }
                        Err(InsertDataShredError::InvalidShred) => {
                            self.insert_metrics
                                .num_recovered_failed_invalid
                                .fetch_add(1, Ordering::Relaxed);
                            None
                        }
                        Err(InsertDataShredError::BlockstoreError(err)) => {
                            self.insert_metrics
                                .num_recovered_blockstore_error
                                .fetch_add(1, Ordering::Relaxed);
                            error!("blockstore error during recovered shred insertion: {err}");
                            None
                        }
                        Ok(()) => {
                            self.insert_metrics
                                .num_recovered_inserted
                                .fetch_add(1, Ordering::Relaxed);
                            Some(shred.into_payload())
                        }
                    }
                })
                // Always collect recovered-shreds so that above insert code is
                // executed even if retransmit-sender is None.
                .collect();
            if !recovered_shreds.is_empty() {
                if let Some(retransmit_sender) = retransmit_sender {
                    let _ = retransmit_sender.send(recovered_shreds);
                }
            }
        }
        start.stop();
        self.insert_metrics
            .shred_recovery_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        let mut start = Measure::start("Shred chaining");
        // Handle chaining for the members of the slot_meta_working_set that
        // were inserted into, drop the others
        self.handle_chaining(
            &mut shred_insertion_tracker.write_batch,
            &mut shred_insertion_tracker.slot_meta_working_set,
        )?;
        start.stop();
        self.insert_metrics
            .chaining_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        let mut start = Measure::start("Commit working sets");

        // Every dirty erasure meta was just created by the first coding
        // shred of its set received in this call; check the forward Merkle
        // chain from that shred.
        for (erasure_set, working_erasure_meta) in shred_insertion_tracker.erasure_metas.iter() {
            if !working_erasure_meta.should_write() {
                continue;
            }
            let erasure_meta = working_erasure_meta.as_ref();
            let Some(first_coding_index) = erasure_meta.first_received_coding_shred_index() else {
                continue;
            };
            let shred_id = ShredId::new(erasure_set.slot(), first_coding_index, ShredType::Code);
            let Some(shred) = shred_insertion_tracker.just_inserted_shreds.get(&shred_id) else {
                error!("Erasure meta was just created, initial shred must exist");
                continue;
            };
            self.check_forward_chained_merkle_root_consistency(
                shred,
                erasure_meta,
                &shred_insertion_tracker.just_inserted_shreds,
                &shred_insertion_tracker.merkle_root_metas,
                &mut shred_insertion_tracker.duplicate_shreds,
            );
        }

        // Every dirty merkle root meta was just created by the first shred
        // of its set received in this call; check the backward Merkle chain
        // from that shred.
        for (erasure_set, working_merkle_root_meta) in
            shred_insertion_tracker.merkle_root_metas.iter()
        {
            if !working_merkle_root_meta.should_write() {
                continue;
            }
            let merkle_root_meta = working_merkle_root_meta.as_ref();
            let shred_id = ShredId::new(
                erasure_set.slot(),
                merkle_root_meta.first_received_shred_index(),
                merkle_root_meta.first_received_shred_type(),
            );
            let Some(shred) = shred_insertion_tracker.just_inserted_shreds.get(&shred_id) else {
                error!("Merkle root meta was just created, initial shred must exist");
                continue;
            };
            self.check_backwards_chained_merkle_root_consistency(
                shred,
                &shred_insertion_tracker.just_inserted_shreds,
                &shred_insertion_tracker.erasure_metas,
                &mut shred_insertion_tracker.duplicate_shreds,
            );
        }

        // Flush the working sets: only dirty metadata and indexes that saw
        // an insert are written into the batch.
        for (erasure_set, working_erasure_meta) in shred_insertion_tracker.erasure_metas.iter() {
            if !working_erasure_meta.should_write() {
                // No need to rewrite the column
                continue;
            }
            shred_insertion_tracker
                .write_batch
                .put::<cf::ErasureMeta>(*erasure_set, working_erasure_meta.as_ref())?;
        }
        for (erasure_set, working_merkle_root_meta) in
            shred_insertion_tracker.merkle_root_metas.iter()
        {
            if !working_merkle_root_meta.should_write() {
                // No need to rewrite the column
                continue;
            }
            shred_insertion_tracker
                .write_batch
                .put::<cf::MerkleRootMeta>(*erasure_set, working_merkle_root_meta.as_ref())?;
        }
        for (&slot, index_working_set_entry) in shred_insertion_tracker.index_working_set.iter() {
            if index_working_set_entry.did_insert_occur {
                shred_insertion_tracker
                    .write_batch
                    .put::<cf::Index>(slot, &index_working_set_entry.index)?;
            }
        }
        let (should_signal, newly_completed_slots) = {
            let completed_slots_senders = self.completed_slots_senders.lock().unwrap();
            commit_slot_meta_working_set(
                &shred_insertion_tracker.slot_meta_working_set,
                !completed_slots_senders.is_empty(),
                &mut shred_insertion_tracker.write_batch,
            )?
        };
        start.stop();
        self.insert_metrics
            .commit_working_sets_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        let ShredInsertionTracker {
            write_batch,
            duplicate_shreds,
            newly_completed_data_sets,
            ..
        } = shred_insertion_tracker;

        let mut start = Measure::start("Write batch");
        self.db.write(write_batch)?;
        start.stop();
        self.insert_metrics
            .write_batch_elapsed_us
            .fetch_add(start.as_us(), Ordering::Relaxed);

        self.send_signals(should_signal, newly_completed_slots);

        total_start.stop();
        self.insert_metrics
            .total_elapsed_us
            .fetch_add(total_start.as_us(), Ordering::Relaxed);
        self.insert_metrics
            .num_shreds
            .fetch_add(num_shreds as u64, Ordering::Relaxed);
        self.insert_metrics
            .num_repair
            .fetch_add(num_repair as u64, Ordering::Relaxed);

        Ok(InsertResults {
            completed_data_set_infos: newly_completed_data_sets,
            duplicates: duplicate_shreds,
        })
    }

    fn send_signals(&self, should_signal: bool, newly_completed_slots: Vec<Slot>) {
        if should_signal {
            for signal in self.new_shreds_signals.lock().unwrap().iter() {
                let _ = signal.try_send(true);
            }
        }
        if !newly_completed_slots.is_empty() {
            for sender in self.completed_slots_senders.lock().unwrap().iter() {
                let _ = sender.try_send(newly_completed_slots.clone());
            }
        }
    }

    fn get_index_meta_entry<'a>(
        &self,
        slot: Slot,
        index_working_set: &'a mut HashMap<u64, IndexMetaWorkingSetEntry>,
    ) -> Result<&'a mut IndexMetaWorkingSetEntry> {
        let mut total_start = Measure::start("Index create/fetch");
        let entry = match index_working_set.entry(slot) {
            HashMapEntry::Occupied(entry) => entry.into_mut(),
            HashMapEntry::Vacant(entry) => {
                let index = self.index_cf.get(slot)?.unwrap_or_else(|| Index::new(slot));
                entry.insert(IndexMetaWorkingSetEntry {
                    index,
                    did_insert_occur: false,
                })
            }
        };
        total_start.stop();
        self.insert_metrics
            .index_meta_time_us
            .fetch_add(total_start.as_us(), Ordering::Relaxed);
        Ok(entry)
    }

    fn get_slot_meta_entry<'a>(
        &self,
        slot_meta_working_set: &'a mut HashMap<u64, SlotMetaWorkingSetEntry>,
        slot: Slot,
        parent_slot: Slot,
    ) -> Result<&'a mut SlotMetaWorkingSetEntry> {
        match slot_meta_working_set.entry(slot) {
            HashMapEntry::Occupied(entry) => Ok(entry.into_mut()),
            HashMapEntry::Vacant(entry) => {
                // Store a 2-tuple of the metadata (working copy, backup copy)
                let working_set_entry = if let Some(mut meta) = self.meta_cf.get(slot)? {
                    let backup = Some(meta.clone());
                    // If parent_slot == None, then this is one of the orphans inserted
                    // during the chaining process, see the function find_slot_meta_in_cached_state()
                    // for details. Slots that are orphans are missing a parent_slot, so we should
                    // fill in the parent now that we know it.
                    if meta.is_orphan() {
                        meta.parent_slot = Some(parent_slot);
                    }
                    SlotMetaWorkingSetEntry::new(Rc::new(RefCell::new(meta)), backup)
                } else {
                    SlotMetaWorkingSetEntry::new(
                        Rc::new(RefCell::new(SlotMeta::new(slot, Some(parent_slot)))),
                        None,
                    )
                };
                Ok(entry.insert(working_set_entry))
            }
        }
    }

    fn is_data_shred_present(shred: &Shred, slot_meta: &SlotMeta, data_index: &ShredIndex) -> bool {
        let shred_index = u64::from(shred.index());
        // Check that the shred doesn't already exist in blockstore
        shred_index < slot_meta.consumed || data_index.is_present(shred_index)
    }

    /// Finds the stored payload for `shred_id`, preferring shreds staged
    /// by the current call over a column read.
    fn get_shred_from_just_inserted_or_db<'a>(
        &self,
        just_inserted_shreds: &'a HashMap<ShredId, Shred>,
        shred_id: ShredId,
    ) -> Result<Option<Cow<'a, Payload>>> {
        if let Some(shred) = just_inserted_shreds.get(&shred_id) {
            return Ok(Some(Cow::Borrowed(shred.payload())));
        }
        let (slot, index) = (shred_id.slot(), u64::from(shred_id.index()));
        let payload = match shred_id.shred_type() {
            ShredType::Data => self.data_shred_cf.get_bytes((slot, index))?,
            ShredType::Code => self.code_shred_cf.get_bytes((slot, index))?,
        };
        Ok(payload.map(Cow::Owned))
    }

    fn get_data_shred_from_just_inserted_or_db<'a>(
        &self,
        just_inserted_shreds: &'a HashMap<ShredId, Shred>,
        slot: Slot,
        index: u64,
    ) -> Result<Option<Cow<'a, Payload>>> {
        let Ok(index) = u32::try_from(index) else {
            return Ok(None);
        };
        self.get_shred_from_just_inserted_or_db(
            just_inserted_shreds,
            ShredId::new(slot, index, ShredType::Data),
        )
    }

    /// Admits one data shred: validates it against the slot metadata,
    /// persists the payload, and stages the metadata updates in the
    /// working set.
    fn check_insert_data_shred(
        &self,
        shred: Shred,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        is_trusted: bool,
        max_root: Slot,
        shred_source: ShredSource,
    ) -> std::result::Result<(), InsertDataShredError> {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        let ShredInsertionTracker {
            just_inserted_shreds,
            merkle_root_metas,
            slot_meta_working_set,
            index_working_set,
            duplicate_shreds,
            write_batch,
            newly_completed_data_sets,
            ..
        } = shred_insertion_tracker;

        let index_meta_working_set_entry = self.get_index_meta_entry(slot, index_working_set)?;
        let index_meta = &mut index_meta_working_set_entry.index;
        let parent_slot = shred
            .parent()
            .map_err(|_| InsertDataShredError::InvalidShred)?;
        let slot_meta_entry =
            self.get_slot_meta_entry(slot_meta_working_set, slot, parent_slot)?;
        let mut slot_meta = slot_meta_entry.new_slot_meta.borrow_mut();

        let erasure_set = shred.erasure_set();
        if let HashMapEntry::Vacant(entry) = merkle_root_metas.entry(erasure_set) {
            if let Some(meta) = self.merkle_root_meta(erasure_set)? {
                entry.insert(WorkingEntry::Clean(meta));
            }
        }

        if !is_trusted {
            if Self::is_data_shred_present(&shred, &slot_meta, index_meta.data()) {
                duplicate_shreds.push(PossibleDuplicateShred::Exists(shred));
                return Err(InsertDataShredError::Exists);
            }

            if shred.last_in_slot() && shred_index < slot_meta.received && !slot_meta.is_full() {
                // We got a last shred < slot_meta.received, which signals there's an alternative,
                // shorter version of the slot. Because also `!slot_meta.is_full()`, then this
                // means, for the current version of the slot, we might never get all the
                // shreds < the current last index, never replay this slot, and make no
                // progress (for instance if a leader sends an additional detached "last index"
                // shred with a very high index, but none of the intermediate shreds). Mark the
                // local version of the slot dead.
                warn!(
                    "Slot {slot} has a last shred at index {shred_index} < received {}; \
                     marking slot dead",
                    slot_meta.received,
                );
                write_batch.put::<cf::DeadSlots>(slot, &true)?;
                self.slots_stats.mark_dead(slot);
            }

            if !self.should_insert_data_shred(
                &shred,
                &slot_meta,
                just_inserted_shreds,
                max_root,
                shred_source,
                duplicate_shreds,
            ) {
                return Err(InsertDataShredError::InvalidShred);
            }

            if let Some(merkle_root_meta) = merkle_root_metas.get(&erasure_set) {
                // A previous shred has been inserted in this batch or in
                // blockstore; compare the current shred against it for
                // potential conflicts
                if !self.check_merkle_root_consistency(
                    just_inserted_shreds,
                    slot,
                    merkle_root_meta.as_ref(),
                    &shred,
                    duplicate_shreds,
                ) {
                    return Err(InsertDataShredError::InvalidShred);
                }
            }
        }

        let completed_data_sets = self.insert_data_shred(
            &mut slot_meta,
            index_meta.data_mut(),
            &shred,
            write_batch,
            shred_source,
        )?;
        newly_completed_data_sets.extend(completed_data_sets);
        merkle_root_metas
            .entry(erasure_set)
            .or_insert_with(|| WorkingEntry::Dirty(MerkleRootMeta::from_shred(&shred)));
        just_inserted_shreds.insert(shred.id(), shred);
        index_meta_working_set_entry.did_insert_occur = true;
        slot_meta_entry.did_insert_occur = true;
        Ok(())
    }

    fn should_insert_data_shred(
        &self,
        shred: &Shred,
        slot_meta: &SlotMeta,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        max_root: Slot,
        shred_source: ShredSource,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let shred_index = u64::from(shred.index());
        let slot = shred.slot();

        // Check that we do not receive a shred with an index past the
        // slot's recorded last index
        if let Some(last_index) = slot_meta.last_index {
            if shred_index > last_index {
                if !self.has_duplicate_shreds_in_slot(slot) {
                    match self.get_data_shred_from_just_inserted_or_db(
                        just_inserted_shreds,
                        slot,
                        last_index,
                    ) {
                        Ok(Some(ending_shred)) => {
                            let ending_shred = ending_shred.into_owned();
                            if let Err(err) = self.store_duplicate_slot(
                                slot,
                                ending_shred.clone(),
                                shred.payload().clone(),
                            ) {
                                warn!("store duplicate error {err:?}");
                            }
                            duplicate_shreds.push(PossibleDuplicateShred::LastIndexConflict(
                                shred.clone(),
                                ending_shred,
                            ));
                        }
                        _ => {
                            error!(
                                "Last index data shred for slot {slot} indicated by slot meta \
                                 is missing from blockstore. This should only happen in extreme \
                                 cases where blockstore cleanup has caught up to the root. \
                                 Skipping data shred insertion"
                            );
                        }
                    }
                }
                warn!(
                    "Slot {slot}: received shred index {shred_index} > slot.last_index \
                     {last_index}, shred_source: {shred_source:?}"
                );
                return false;
            }
        }

        // Check that we do not receive a shred with "last_index" true, but
        // an index less than our current received
        if shred.last_in_slot() && shred_index < slot_meta.received {
            if !self.has_duplicate_shreds_in_slot(slot) {
                match self.get_data_shred_from_just_inserted_or_db(
                    just_inserted_shreds,
                    slot,
                    slot_meta.received - 1,
                ) {
                    Ok(Some(ending_shred)) => {
                        let ending_shred = ending_shred.into_owned();
                        if let Err(err) = self.store_duplicate_slot(
                            slot,
                            ending_shred.clone(),
                            shred.payload().clone(),
                        ) {
                            warn!("store duplicate error {err:?}");
                        }
                        duplicate_shreds.push(PossibleDuplicateShred::LastIndexConflict(
                            shred.clone(),
                            ending_shred,
                        ));
                    }
                    _ => {
                        error!(
                            "Last received data shred for slot {slot} indicated by slot meta \
                             is missing from blockstore. This should only happen in extreme \
                             cases where blockstore cleanup has caught up to the root. \
                             Skipping data shred insertion"
                        );
                    }
                }
            }
            warn!(
                "Slot {slot}: received last shred with index {shred_index} < received \
                 {}, shred_source: {shred_source:?}",
                slot_meta.received,
            );
            return false;
        }

        slot_meta
            .parent_slot
            .map(|parent_slot| verify_shred_slots(slot, parent_slot, max_root))
            .unwrap_or_default()
    }

    fn insert_data_shred(
        &self,
        slot_meta: &mut SlotMeta,
        data_index: &mut ShredIndex,
        shred: &Shred,
        write_batch: &mut WriteBatch,
        shred_source: ShredSource,
    ) -> Result<Vec<CompletedDataSetInfo>> {
        let slot = shred.slot();
        let index = u64::from(shred.index());

        let last_in_slot = shred.last_in_slot();
        let last_in_data = shred.data_complete();

        // Parent for slot meta should have been set by this point
        assert!(!slot_meta.is_orphan());

        let new_consumed = if slot_meta.consumed == index {
            let mut current_index = index + 1;
            while data_index.is_present(current_index) {
                current_index += 1;
            }
            current_index
        } else {
            slot_meta.consumed
        };

        // Commit step: commit all changes to the mutable structures at once, or none at all.
        // We don't want only a subset of these changes going through.
        write_batch.put_bytes::<cf::ShredData>((slot, index), shred.payload())?;
        data_index.set_present(index, true);
        let newly_completed_data_sets = update_slot_meta(
            last_in_slot,
            last_in_data,
            slot_meta,
            shred.index(),
            new_consumed,
            shred.reference_tick(),
            data_index,
        )
        .into_iter()
        .map(|indices| CompletedDataSetInfo { slot, indices })
        .collect();

        self.slots_stats
            .record_shred(slot, shred.fec_set_index(), shred_source, Some(slot_meta));

        trace!("inserted shred into slot {slot} and index {index}");

        Ok(newly_completed_data_sets)
    }

    /// Admits one coding shred. Returns whether the shred was inserted.
    fn check_insert_coding_shred(
        &self,
        shred: Shred,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        is_trusted: bool,
        max_root: Slot,
        shred_source: ShredSource,
    ) -> Result<bool> {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        let ShredInsertionTracker {
            just_inserted_shreds,
            erasure_metas,
            merkle_root_metas,
            index_working_set,
            duplicate_shreds,
            write_batch,
            ..
        } = shred_insertion_tracker;

        let index_meta_working_set_entry = self.get_index_meta_entry(slot, index_working_set)?;
        let index_meta = &mut index_meta_working_set_entry.index;

        let erasure_set = shred.erasure_set();
        if let HashMapEntry::Vacant(entry) = merkle_root_metas.entry(erasure_set) {
            if let Some(meta) = self.merkle_root_meta(erasure_set)? {
                entry.insert(WorkingEntry::Clean(meta));
            }
        }

        if !is_trusted {
            if index_meta.coding().is_present(shred_index) {
                self.insert_metrics
                    .num_code_shreds_exists
                    .fetch_add(1, Ordering::Relaxed);
                duplicate_shreds.push(PossibleDuplicateShred::Exists(shred));
                return Ok(false);
            }

            if !Self::should_insert_coding_shred(&shred, max_root) {
                self.insert_metrics
                    .num_code_shreds_invalid
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }

            if let Some(merkle_root_meta) = merkle_root_metas.get(&erasure_set) {
                // A previous shred has been inserted in this batch or in
                // blockstore; compare the current shred against it for
                // potential conflicts
                if !self.check_merkle_root_consistency(
                    just_inserted_shreds,
                    slot,
                    merkle_root_meta.as_ref(),
                    &shred,
                    duplicate_shreds,
                ) {
                    self.insert_metrics
                        .num_code_shreds_invalid
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
            }
        }

        // The first coding shred of an erasure set fixes the set's config;
        // every later coding shred must agree with it.
        let erasure_meta_entry = match erasure_metas.entry(erasure_set) {
            BTreeMapEntry::Occupied(entry) => entry.into_mut(),
            BTreeMapEntry::Vacant(entry) => {
                let meta = match self.erasure_meta(erasure_set)? {
                    Some(meta) => WorkingEntry::Clean(meta),
                    None => {
                        let Some(meta) = ErasureMeta::from_coding_shred(&shred) else {
                            // Unreachable after sanitize, kept as a guard.
                            self.insert_metrics
                                .num_code_shreds_invalid
                                .fetch_add(1, Ordering::Relaxed);
                            return Ok(false);
                        };
                        WorkingEntry::Dirty(meta)
                    }
                };
                entry.insert(meta)
            }
        };
        let erasure_meta = erasure_meta_entry.as_ref();

        if !erasure_meta.check_coding_shred(&shred) {
            self.insert_metrics
                .num_code_shreds_invalid_erasure_config
                .fetch_add(1, Ordering::Relaxed);
            if !self.has_duplicate_shreds_in_slot(slot) {
                // See if there is a conflicting shred in the same erasure set
                match self.find_conflicting_coding_shred(slot, erasure_meta, just_inserted_shreds)
                {
                    Ok(Some(conflicting_shred)) => {
                        if let Err(err) = self.store_duplicate_slot(
                            slot,
                            conflicting_shred.clone(),
                            shred.payload().clone(),
                        ) {
                            warn!(
                                "Unable to store conflicting erasure meta duplicate proof for \
                                 {slot} {erasure_set:?} {err}"
                            );
                        }
                        duplicate_shreds.push(PossibleDuplicateShred::ErasureConflict(
                            shred.clone(),
                            conflicting_shred,
                        ));
                    }
                    _ => {
                        error!(
                            "Unable to find the conflicting coding shred that set \
                             {erasure_meta:?}. This should only happen in extreme cases where \
                             blockstore cleanup has caught up to the root. Skipping the erasure \
                             meta duplicate shred check"
                        );
                    }
                }
            }
            warn!("Received multiple erasure configs for the same erasure set!!!");
            return Ok(false);
        }

        self.slots_stats
            .record_shred(slot, shred.fec_set_index(), shred_source, None);

        // insert coding shred into rocks
        Self::insert_coding_shred(index_meta, &shred, write_batch)?;
        index_meta_working_set_entry.did_insert_occur = true;
        merkle_root_metas
            .entry(erasure_set)
            .or_insert_with(|| WorkingEntry::Dirty(MerkleRootMeta::from_shred(&shred)));
        just_inserted_shreds.insert(shred.id(), shred);
        Ok(true)
    }

    fn should_insert_coding_shred(shred: &Shred, max_root: Slot) -> bool {
        debug_assert!(shred.sanitize().is_ok());
        // Coding shreds for rooted slots can no longer help recovery.
        shred.is_code() && shred.slot() > max_root
    }

    fn insert_coding_shred(
        index_meta: &mut Index,
        shred: &Shred,
        write_batch: &mut WriteBatch,
    ) -> Result<()> {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        // Assert guaranteed by integrity checks on the shred that happened before
        // `insert_coding_shred` was called
        debug_assert!(shred.is_code() && shred.sanitize().is_ok());

        // Commit step: commit all changes to the mutable structures at once, or none at all.
        // We don't want only a subset of these changes going through.
        write_batch.put_bytes::<cf::ShredCode>((slot, shred_index), shred.payload())?;
        index_meta.coding_mut().set_present(shred_index, true);

        Ok(())
    }

    /// Locates the coding shred that established `erasure_meta`, to serve
    /// as the witness payload of an erasure-config duplicate proof.
    fn find_conflicting_coding_shred(
        &self,
        slot: Slot,
        erasure_meta: &ErasureMeta,
        just_received_shreds: &HashMap<ShredId, Shred>,
    ) -> Result<Option<Payload>> {
        let Some(index) = erasure_meta.first_received_coding_shred_index() else {
            return Ok(None);
        };
        let shred_id = ShredId::new(slot, index, ShredType::Code);
        let maybe_shred =
            self.get_shred_from_just_inserted_or_db(just_received_shreds, shred_id)?;
        Ok(maybe_shred.map(Cow::into_owned))
    }

    /// Returns true if the shred does not conflict with the Merkle root
    /// recorded for its erasure set.
    fn check_merkle_root_consistency(
        &self,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        slot: Slot,
        merkle_root_meta: &MerkleRootMeta,
        shred: &Shred,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let new_merkle_root = shred.merkle_root();
        if merkle_root_meta.merkle_root() == new_merkle_root {
            // No conflict, either both merkle shreds with same merkle root
            // or both legacy shreds with merkle_root `None`
            return true;
        }

        warn!(
            "Received conflicting merkle roots for slot: {slot}, erasure_set: {:?} original \
             merkle root meta {merkle_root_meta:?} vs conflicting merkle root \
             {new_merkle_root:?} shred index {} type {:?}. Reporting as duplicate",
            shred.erasure_set(),
            shred.index(),
            shred.shred_type(),
        );

        if !self.has_duplicate_shreds_in_slot(slot) {
            let shred_id = ShredId::new(
                slot,
                merkle_root_meta.first_received_shred_index(),
                merkle_root_meta.first_received_shred_type(),
            );
            let conflicting_shred = match self
                .get_shred_from_just_inserted_or_db(just_inserted_shreds, shred_id)
            {
                Ok(Some(shred)) => shred.into_owned(),
                _ => {
                    error!(
                        "Shred {shred_id:?} indicated by merkle root meta {merkle_root_meta:?} \
                         is missing from blockstore. This should only happen in extreme cases \
                         where blockstore cleanup has caught up to the root. Skipping the \
                         merkle root consistency check"
                    );
                    return true;
                }
            };
            duplicate_shreds.push(PossibleDuplicateShred::MerkleRootConflict(
                shred.clone(),
                conflicting_shred,
            ));
        }
        false
    }

    /// Returns true if there is no chaining conflict between the `shred`
    /// and the first shred of the next FEC set, or if shreds from the next
    /// set are yet to be received.
    fn check_forward_chained_merkle_root_consistency(
        &self,
        shred: &Shred,
        erasure_meta: &ErasureMeta,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        merkle_root_metas: &HashMap<ErasureSetId, WorkingEntry<MerkleRootMeta>>,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        debug_assert!(erasure_meta.check_coding_shred(shred));
        let slot = shred.slot();

        let Some(next_fec_set_index) = erasure_meta.next_fec_set_index() else {
            error!("Invalid erasure meta, unable to compute next fec set index {erasure_meta:?}");
            return false;
        };
        let next_erasure_set = ErasureSetId::new(slot, next_fec_set_index);
        let next_merkle_root_meta = match merkle_root_metas.get(&next_erasure_set) {
            Some(entry) => Some(*entry.as_ref()),
            None => match self.merkle_root_meta(next_erasure_set) {
                Ok(meta) => meta,
                Err(err) => {
                    error!("Unable to read merkle root meta for {next_erasure_set:?}: {err}");
                    return true;
                }
            },
        };
        let Some(next_merkle_root_meta) = next_merkle_root_meta else {
            // No shred from the next fec set has been received
            return true;
        };
        let next_shred_id = ShredId::new(
            slot,
            next_merkle_root_meta.first_received_shred_index(),
            next_merkle_root_meta.first_received_shred_type(),
        );
        let next_shred = match self
            .get_shred_from_just_inserted_or_db(just_inserted_shreds, next_shred_id)
        {
            Ok(Some(shred)) => shred.into_owned(),
            _ => {
                error!(
                    "Shred {next_shred_id:?} indicated by merkle root meta \
                     {next_merkle_root_meta:?} is missing from blockstore. This should only \
                     happen in extreme cases where blockstore cleanup has caught up to the \
                     root. Skipping the forward chained merkle root consistency check"
                );
                return true;
            }
        };
        let merkle_root = shred.merkle_root();
        let chained_merkle_root = shred::layout::get_chained_merkle_root(&next_shred);
        if !check_chaining(merkle_root, chained_merkle_root) {
            warn!(
                "Received conflicting chained merkle roots for slot: {slot}: erasure set \
                 {:?} has merkle root {merkle_root:?}, however next fec set shred \
                 {next_shred_id:?} chains to {chained_merkle_root:?}. Reporting as duplicate",
                shred.erasure_set(),
            );
            if !self.has_duplicate_shreds_in_slot(slot) {
                if let Err(err) =
                    self.store_duplicate_slot(slot, shred.payload().clone(), next_shred.clone())
                {
                    warn!("store duplicate error {err:?}");
                }
                duplicate_shreds.push(PossibleDuplicateShred::ChainedMerkleRootConflict(
                    shred.clone(),
                    next_shred,
                ));
            }
            return false;
        }
        true
    }

    /// Returns true if there is no chaining conflict between the `shred`
    /// and the first coding shred of the previous FEC set, or if shreds
    /// from the previous set are yet to be received.
    fn check_backwards_chained_merkle_root_consistency(
        &self,
        shred: &Shred,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        erasure_metas: &BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let slot = shred.slot();
        let erasure_set = shred.erasure_set();
        let fec_set_index = shred.fec_set_index();

        if fec_set_index == 0 {
            // The first fec set of a slot chains to the last fec set of the
            // parent block; that link cannot be checked here.
            return true;
        }

        let previous = match self.previous_erasure_set(erasure_set, erasure_metas) {
            Ok(previous) => previous,
            Err(err) => {
                error!("Unable to scan for the previous erasure set of {erasure_set:?}: {err}");
                return true;
            }
        };
        let Some((_, prev_erasure_meta)) = previous else {
            // No shreds from the previous erasure batch have been received,
            // so nothing to check. Once the previous erasure batch is
            // received, the chain is verified by the forward check.
            return true;
        };
        let Some(prev_coding_index) = prev_erasure_meta.first_received_coding_shred_index() else {
            return true;
        };
        let prev_shred_id = ShredId::new(slot, prev_coding_index, ShredType::Code);
        let prev_shred = match self
            .get_shred_from_just_inserted_or_db(just_inserted_shreds, prev_shred_id)
        {
            Ok(Some(shred)) => shred.into_owned(),
            _ => {
                warn!(
                    "Shred {prev_shred_id:?} indicated by the erasure meta \
                     {prev_erasure_meta:?} is missing from blockstore. Skipping the backwards \
                     chained merkle root consistency check"
                );
                return true;
            }
        };
        let merkle_root = shred::layout::get_merkle_root(&prev_shred);
        let chained_merkle_root = shred.chained_merkle_root();
        if !check_chaining(merkle_root, chained_merkle_root) {
            warn!(
                "Received conflicting chained merkle roots for slot: {slot}: shred {:?} \
                 chains to {chained_merkle_root:?}, however previous fec set coding shred \
                 {prev_shred_id:?} has merkle root {merkle_root:?}. Reporting as duplicate",
                shred.id(),
            );
            if !self.has_duplicate_shreds_in_slot(slot) {
                if let Err(err) =
                    self.store_duplicate_slot(slot, prev_shred.clone(), shred.payload().clone())
                {
                    warn!("store duplicate error {err:?}");
                }
                duplicate_shreds.push(PossibleDuplicateShred::ChainedMerkleRootConflict(
                    shred.clone(),
                    prev_shred,
                ));
            }
            return false;
        }
        true
    }

    /// Returns the erasure set immediately preceding `erasure_set` in the
    /// same slot, together with its erasure meta, if it is known.
    fn previous_erasure_set<'a>(
        &self,
        erasure_set: ErasureSetId,
        erasure_metas: &'a BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
    ) -> Result<Option<(ErasureSetId, Cow<'a, ErasureMeta>)>> {
        let slot = erasure_set.slot();
        let fec_set_index = erasure_set.fec_set_index();

        // Check the previous entry from the in memory map to see if it is
        // the consecutive set to `erasure_set`
        let candidate_erasure_entry = erasure_metas
            .range(ErasureSetId::new(slot, 0)..erasure_set)
            .next_back();
        let candidate_erasure_set_and_meta = candidate_erasure_entry
            .filter(|(_, candidate_erasure_meta)| {
                candidate_erasure_meta.as_ref().next_fec_set_index() == Some(fec_set_index)
            })
            .map(|(erasure_set, erasure_meta)| {
                (*erasure_set, Cow::Borrowed(erasure_meta.as_ref()))
            });
        if candidate_erasure_set_and_meta.is_some() {
            return Ok(candidate_erasure_set_and_meta);
        }

        // Consecutive set was not found in memory, scan blockstore for a
        // potential candidate
        let Some((candidate_erasure_set, candidate_meta_bytes)) = self
            .erasure_meta_cf
            .iter(IteratorMode::From(erasure_set, IteratorDirection::Reverse))?
            // A reverse iterator seeks to the last key at or before the
            // start key; skip the exact start key if it is present.
            .find(|(candidate_erasure_set, _)| *candidate_erasure_set != erasure_set)
        else {
            return Ok(None);
        };
        if candidate_erasure_set.slot() != slot {
            return Ok(None);
        }
        let candidate_erasure_meta: ErasureMeta = deserialize(&candidate_meta_bytes)?;
        if candidate_erasure_meta.next_fec_set_index() == Some(fec_set_index) {
            return Ok(Some((
                candidate_erasure_set,
                Cow::Owned(candidate_erasure_meta),
            )));
        }
        Ok(None)
    }

    /// Runs Reed-Solomon recovery for every erasure set in the working set
    /// whose status is `CanRecover`. Returns the recovered shreds.
    fn try_shred_recovery(
        &self,
        erasure_metas: &BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
        index_working_set: &mut HashMap<u64, IndexMetaWorkingSetEntry>,
        prev_inserted_shreds: &HashMap<ShredId, Shred>,
        reed_solomon_cache: &ReedSolomonCache,
    ) -> Result<Vec<Shred>> {
        let mut recovered_shreds = vec![];
        // Recovery rules:
        // 1. Only try recovery around indexes for which new coding shreds are received
        // 2. For new data shreds, check if an erasure set exists. If not, don't try recovery
        // 3. Before trying recovery, check if enough number of shreds have been received
        // 3a. Enough number of shreds = (#data + #coding shreds) >= erasure.num_data
        for (erasure_set, working_erasure_meta) in erasure_metas.iter() {
            let erasure_meta = working_erasure_meta.as_ref();
            let slot = erasure_set.slot();
            let index_meta_entry = index_working_set
                .get_mut(&slot)
                .expect("erasure meta in the working set implies an index entry");
            let index = &index_meta_entry.index;
            if erasure_meta.status(index) == ErasureMetaStatus::CanRecover {
                self.recover_shreds(
                    index,
                    erasure_meta,
                    prev_inserted_shreds,
                    &mut recovered_shreds,
                    reed_solomon_cache,
                );
            }
        }
        Ok(recovered_shreds)
    }

    fn recover_shreds(
        &self,
        index: &Index,
        erasure_meta: &ErasureMeta,
        prev_inserted_shreds: &HashMap<ShredId, Shred>,
        recovered_shreds: &mut Vec<Shred>,
        reed_solomon_cache: &ReedSolomonCache,
    ) {
        // Find shreds for this erasure set and try recovery
        let slot = index.slot;
        let available_shreds: Vec<_> = self
            .get_recovery_data_shreds(index, slot, erasure_meta, prev_inserted_shreds)
            .chain(self.get_recovery_coding_shreds(index, slot, erasure_meta, prev_inserted_shreds))
            .collect();
        match shred::recover(available_shreds, reed_solomon_cache) {
            Ok(mut result) => recovered_shreds.append(&mut result),
            Err(err) => {
                warn!(
                    "shred recovery for slot {slot}, erasure set {} failed: {err}",
                    erasure_meta.data_shreds_indices().start,
                );
            }
        }
    }

    fn get_recovery_data_shreds<'a>(
        &'a self,
        index: &'a Index,
        slot: Slot,
        erasure_meta: &'a ErasureMeta,
        prev_inserted_shreds: &'a HashMap<ShredId, Shred>,
    ) -> impl Iterator<Item = Shred> + 'a {
        erasure_meta.data_shreds_indices().filter_map(move |i| {
            let index_u32 = u32::try_from(i).ok()?;
            let key = ShredId::new(slot, index_u32, ShredType::Data);
            if let Some(shred) = prev_inserted_shreds.get(&key) {
                return Some(shred.clone());
            }
            if !index.data().is_present(i) {
                return None;
            }
            match self.data_shred_cf.get_bytes((slot, i)) {
                Ok(Some(data)) => Shred::new_from_serialized_shred(data).ok(),
                _ => {
                    error!(
                        "Unable to read the data shred with slot {slot}, index {i} for shred \
                         recovery. The shred is marked present in the slot's data shred index, \
                         but the shred could not be found in the data shred column"
                    );
                    None
                }
            }
        })
    }

    fn get_recovery_coding_shreds<'a>(
        &'a self,
        index: &'a Index,
        slot: Slot,
        erasure_meta: &'a ErasureMeta,
        prev_inserted_shreds: &'a HashMap<ShredId, Shred>,
    ) -> impl Iterator<Item = Shred> + 'a {
        erasure_meta.coding_shreds_indices().filter_map(move |i| {
            let index_u32 = u32::try_from(i).ok()?;
            let key = ShredId::new(slot, index_u32, ShredType::Code);
            if let Some(shred) = prev_inserted_shreds.get(&key) {
                return Some(shred.clone());
            }
            if !index.coding().is_present(i) {
                return None;
            }
            match self.code_shred_cf.get_bytes((slot, i)) {
                Ok(Some(code)) => Shred::new_from_serialized_shred(code).ok(),
                _ => {
                    error!(
                        "Unable to read the coding shred with slot {slot}, index {i} for shred \
                         recovery. The shred is marked present in the slot's coding shred \
                         index, but the shred could not be found in the coding shred column"
                    );
                    None
                }
            }
        })
    }

    /// Handles chaining for all the SlotMetas that were inserted into,
    /// dropping the others from the working set.
    fn handle_chaining(
        &self,
        write_batch: &mut WriteBatch,
        slot_meta_working_set: &mut HashMap<u64, SlotMetaWorkingSetEntry>,
    ) -> Result<()> {
        slot_meta_working_set.retain(|_, entry| entry.did_insert_occur);
        let mut new_chained_slots = HashMap::new();
        let working_set_slots: Vec<u64> = slot_meta_working_set.keys().copied().collect();
        for slot in working_set_slots {
            self.handle_chaining_for_slot(
                write_batch,
                slot_meta_working_set,
                &mut new_chained_slots,
                slot,
            )?;
        }

        // Write all the newly changed slots in new_chained_slots to the
        // write_batch; they lie outside this call's working set.
        for (slot, meta) in new_chained_slots.iter() {
            let meta: &SlotMeta = &RefCell::borrow(meta);
            write_batch.put::<cf::SlotMeta>(*slot, meta)?;
        }
        Ok(())
    }

    fn handle_chaining_for_slot(
        &self,
        write_batch: &mut WriteBatch,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        new_chained_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
        slot: Slot,
    ) -> Result<()> {
        let slot_meta_entry = working_set
            .get(&slot)
            .expect("slot must exist in the working set");

        let meta = &slot_meta_entry.new_slot_meta;
        let meta_backup = &slot_meta_entry.old_slot_meta;
        let was_orphan_slot =
            meta_backup.is_some() && meta_backup.as_ref().unwrap().is_orphan();

        // If this is a new slot (or a slot whose parent was just learned),
        // chain it to its parent.
        if slot != 0 && meta.borrow().parent_slot.is_some() {
            let prev_slot = meta.borrow().parent_slot.unwrap();

            // Check if the slot represented by meta is either a new slot or
            // an orphan; in both cases the parent was previously unknown,
            // so the chaining logic has to run.
            if meta_backup.is_none() || was_orphan_slot {
                let prev_slot_meta =
                    self.find_slot_meta_else_create(working_set, new_chained_slots, prev_slot)?;

                // This is a newly inserted slot/orphan so run the chaining
                // logic to link it to a newly discovered parent
                chain_new_slot_to_prev_slot(
                    &mut prev_slot_meta.borrow_mut(),
                    slot,
                    &mut meta.borrow_mut(),
                );

                // If the parent of `slot` is a newly inserted orphan,
                // insert it into the orphans column family
                if prev_slot_meta.borrow().is_orphan() {
                    write_batch.put::<cf::Orphans>(prev_slot, &true)?;
                }
            }
        }

        // At this point this slot has received a parent, so it's no longer
        // an orphan
        if was_orphan_slot {
            write_batch.delete::<cf::Orphans>(slot)?;
        }

        // If this is a newly completed slot and the parent is connected,
        // then the slot is now connected; mark the slot as connected, and
        // then traverse the children to update their parent_connected and
        // connected status.
        let should_propagate_is_connected =
            is_newly_completed_slot(&RefCell::borrow(meta), meta_backup)
                && RefCell::borrow(meta).is_parent_connected();

        if should_propagate_is_connected {
            meta.borrow_mut().set_connected();
            self.traverse_children_mut(meta, working_set, new_chained_slots)?;
        }

        Ok(())
    }

    /// Traverses all the direct and indirect children of `slot_meta`,
    /// marking their parents as connected and, where the child is full,
    /// the child itself.
    fn traverse_children_mut(
        &self,
        slot_meta: &Rc<RefCell<SlotMeta>>,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        passed_visited_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
    ) -> Result<()> {
        let mut next_slots: VecDeque<u64> = RefCell::borrow(slot_meta).next_slots.to_vec().into();
        while let Some(slot) = next_slots.pop_front() {
            let meta_ref =
                self.find_slot_meta_else_create(working_set, passed_visited_slots, slot)?;
            let mut meta = meta_ref.borrow_mut();
            if meta.set_parent_connected() {
                next_slots.extend(meta.next_slots.iter());
            }
        }
        Ok(())
    }

    fn find_slot_meta_else_create(
        &self,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        chained_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
        slot: Slot,
    ) -> Result<Rc<RefCell<SlotMeta>>> {
        if let Some(slot_meta) = find_slot_meta_in_cached_state(working_set, chained_slots, slot) {
            Ok(slot_meta)
        } else {
            self.find_slot_meta_in_db_else_create(slot, chained_slots)
        }
    }

    fn find_slot_meta_in_db_else_create(
        &self,
        slot: Slot,
        insert_map: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
    ) -> Result<Rc<RefCell<SlotMeta>>> {
        let slot_meta = if let Some(slot_meta) = self.meta_cf.get(slot)? {
            slot_meta
        } else {
            // If this slot doesn't exist, make an orphan slot. This way we
            // remember which slots chained to this one when we eventually
            // get a real shred for this slot
            SlotMeta::new_orphan(slot)
        };
        let entry = Rc::new(RefCell::new(slot_meta));
        insert_map.insert(slot, Rc::clone(&entry));
        Ok(entry)
    }
}

fn find_slot_meta_in_cached_state(
    working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
    chained_slots: &HashMap<u64, Rc<RefCell<SlotMeta>>>,
    slot: Slot,
) -> Option<Rc<RefCell<SlotMeta>>> {
    if let Some(entry) = working_set.get(&slot) {
        Some(Rc::clone(&entry.new_slot_meta))
    } else {
        chained_slots.get(&slot).cloned()
    }
}

fn chain_new_slot_to_prev_slot(
    prev_slot_meta: &mut SlotMeta,
    current_slot: Slot,
    current_slot_meta: &mut SlotMeta,
) {
    // Set semantics: never record the same child twice.
    if !prev_slot_meta.next_slots.contains(&current_slot) {
        prev_slot_meta.next_slots.push(current_slot);
    }
    if prev_slot_meta.is_connected() {
        current_slot_meta.set_parent_connected();
    }
}

fn is_newly_completed_slot(slot_meta: &SlotMeta, backup_slot_meta: &Option<SlotMeta>) -> bool {
    slot_meta.is_full()
        && (backup_slot_meta.is_none()
            || slot_meta.consumed != backup_slot_meta.as_ref().unwrap().consumed)
}

/// Returns a boolean indicating whether a slot has received additional
/// shreds that can be replayed since the previous update to the slot's
/// SlotMeta.
fn slot_has_updates(slot_meta: &SlotMeta, slot_meta_backup: &Option<SlotMeta>) -> bool {
    // First, this slot's parent must be connected in order to even consider
    // starting replay; otherwise, the replayed results may not be valid.
    slot_meta.is_parent_connected()
        // Then,
        // If the slot didn't exist in the db before, any consecutive shreds
        // at the start of the slot are ready to be replayed.
        && ((slot_meta_backup.is_none() && slot_meta.consumed != 0)
            // Or,
            // If the slot has more consecutive shreds than it last did from
            // the last update, those shreds are new and also ready to be
            // replayed.
            || (slot_meta_backup.is_some()
                && slot_meta_backup.as_ref().unwrap().consumed != slot_meta.consumed))
}

fn commit_slot_meta_working_set(
    slot_meta_working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
    should_track_completed_slots: bool,
    write_batch: &mut WriteBatch,
) -> Result<(bool, Vec<u64>)> {
    let mut should_signal = false;
    let mut newly_completed_slots = vec![];

    // Check if any metadata was changed, if so, insert the new version of
    // the metadata into the write batch
    for (slot, slot_meta_entry) in slot_meta_working_set.iter() {
        // Any slot that wasn't written to should have been filtered out by
        // now.
        assert!(slot_meta_entry.did_insert_occur);
        let meta: &SlotMeta = &RefCell::borrow(&slot_meta_entry.new_slot_meta);
        let meta_backup = &slot_meta_entry.old_slot_meta;
        if should_track_completed_slots && is_newly_completed_slot(meta, meta_backup) {
            newly_completed_slots.push(*slot);
        }
        // Check if the working copy of the metadata has changed
        if Some(meta) != meta_backup.as_ref() {
            should_signal = should_signal || slot_has_updates(meta, meta_backup);
            write_batch.put::<cf::SlotMeta>(*slot, meta)?;
        }
    }

    Ok((should_signal, newly_completed_slots))
}

fn check_chaining(merkle_root: Option<Hash>, chained_merkle_root: Option<Hash>) -> bool {
    chained_merkle_root.is_none() // Chained merkle roots have not been enabled yet
        || chained_merkle_root == merkle_root
}

fn update_slot_meta(
    is_last_in_slot: bool,
    is_last_in_data: bool,
    slot_meta: &mut SlotMeta,
    index: u32,
    new_consumed: u64,
    reference_tick: u8,
    received_data_shreds: &ShredIndex,
) -> Vec<Range<u32>> {
    let first_insert = slot_meta.received == 0;
    // Index is zero-indexed, while the "received" height starts from 1,
    // so received = index + 1 for the same shred.
    slot_meta.received = cmp::max(u64::from(index) + 1, slot_meta.received);
    if first_insert {
        // predict the timestamp of what would have been the first shred in this slot
        let slot_time_elapsed = u64::from(reference_tick) * 1000 / DEFAULT_TICKS_PER_SECOND;
        slot_meta.first_shred_timestamp = timestamp() - slot_time_elapsed;
    }
    slot_meta.consumed = new_consumed;
    // If the last index in the slot hasn't been set before, then
    // set it to this shred index
    if is_last_in_slot && slot_meta.last_index.is_none() {
        slot_meta.last_index = Some(u64::from(index));
    }
    update_completed_data_indexes(
        is_last_in_slot || is_last_in_data,
        index,
        received_data_shreds,
        &mut slot_meta.completed_data_indexes,
    )
}

/// Updates the `completed_data_indexes` with a new shred `new_shred_index`.
/// If a data set is complete, returns the range of shred indexes
/// `[start_index, end_index)` for that completed data set.
fn update_completed_data_indexes(
    is_last_in_data: bool,
    new_shred_index: u32,
    received_data_shreds: &ShredIndex,
    // Shreds indices which are marked data complete.
    completed_data_indexes: &mut CompletedDataIndexes,
) -> Vec<Range<u32>> {
    let start_shred_index = completed_data_indexes
        .range(..new_shred_index)
        .next_back()
        .map(|index| index + 1)
        .unwrap_or_default();
    // Consecutive entries i, j, k in this vector represent potential ranges
    // [i, j) and [j, k) that could be completed data ranges
    let mut shred_indices = vec![start_shred_index];
    // `new_shred_index` is data complete, so need to insert here into the
    // `completed_data_indexes`
    if is_last_in_data {
        completed_data_indexes.insert(new_shred_index);
        shred_indices.push(new_shred_index + 1);
    }
    if let Some(index) = completed_data_indexes
        .range(new_shred_index + 1..)
        .next()
    {
        shred_indices.push(index + 1);
    }
    shred_indices
        .windows(2)
        .filter(|ix| {
            let (begin, end) = (u64::from(ix[0]), u64::from(ix[1]));
            let num_shreds = (end - begin) as usize;
            received_data_shreds.present_in_bounds(begin..end) == num_shreds
        })
        .map(|ix| ix[0]..ix[1])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shred::{
        ShredVariant, DATA_SHREDS_PER_FEC_BLOCK, OFFSET_OF_CODING_POSITION, OFFSET_OF_DATA_FLAGS,
        OFFSET_OF_FEC_SET_INDEX, OFFSET_OF_NUM_CODING_SHREDS, OFFSET_OF_NUM_DATA_SHREDS,
        OFFSET_OF_SHRED_INDEX, OFFSET_OF_SHRED_SLOT, OFFSET_OF_SHRED_VARIANT,
    };
    use crate::shredder::{data_shred_capacity, Shredder};
    use assert_matches::assert_matches;
    use crossbeam_channel::unbounded;
    use rand::seq::SliceRandom;
    use rand::{thread_rng, Rng};
    use solana_keypair::Keypair;
    use solana_signer::Signer;
    use tempfile::TempDir;

    fn get_tmp_ledger_path() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    fn random_bytes(num_chunks: usize, chained: bool) -> Vec<u8> {
        let mut rng = thread_rng();
        (0..num_chunks * data_shred_capacity(chained))
            .map(|_| rng.gen())
            .collect()
    }

    /// Builds one slot's worth of shreds: `num_chunks` data shreds plus
    /// the coding shreds protecting them.
    fn make_slot_shreds(
        slot: Slot,
        parent_slot: Slot,
        num_chunks: usize,
        is_last_in_slot: bool,
    ) -> (Vec<Shred>, Vec<Shred>, Keypair) {
        let keypair = Keypair::new();
        let shredder = Shredder::new(slot, parent_slot, 0, 0).unwrap();
        let data = random_bytes(num_chunks, false);
        let (data_shreds, coding_shreds) = shredder
            .shreds_from_data(
                &keypair,
                &data,
                is_last_in_slot,
                None, // chained_merkle_root
                0,    // next_shred_index
                0,    // next_code_index
                &ReedSolomonCache::default(),
            )
            .unwrap();
        assert_eq!(data_shreds.len(), num_chunks);
        (data_shreds, coding_shreds, keypair)
    }

    fn make_legacy_coding_shred(
        slot: Slot,
        index: u32,
        fec_set_index: u32,
        num_data: u16,
        num_coding: u16,
        position: u16,
    ) -> Shred {
        let variant = ShredVariant::LegacyCode;
        let mut payload = vec![0u8; variant.expected_payload_size()];
        payload[OFFSET_OF_SHRED_VARIANT] = u8::from(variant);
        payload[OFFSET_OF_SHRED_SLOT..OFFSET_OF_SHRED_SLOT + 8]
            .copy_from_slice(&slot.to_le_bytes());
        payload[OFFSET_OF_SHRED_INDEX..OFFSET_OF_SHRED_INDEX + 4]
            .copy_from_slice(&index.to_le_bytes());
        payload[OFFSET_OF_FEC_SET_INDEX..OFFSET_OF_FEC_SET_INDEX + 4]
            .copy_from_slice(&fec_set_index.to_le_bytes());
        payload[OFFSET_OF_NUM_DATA_SHREDS..OFFSET_OF_NUM_DATA_SHREDS + 2]
            .copy_from_slice(&num_data.to_le_bytes());
        payload[OFFSET_OF_NUM_CODING_SHREDS..OFFSET_OF_NUM_CODING_SHREDS + 2]
            .copy_from_slice(&num_coding.to_le_bytes());
        payload[OFFSET_OF_CODING_POSITION..OFFSET_OF_CODING_POSITION + 2]
            .copy_from_slice(&position.to_le_bytes());
        Shred::new_from_serialized_shred(payload).unwrap()
    }

    #[test]
    fn test_insert_data_shred_basic() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, _) = make_slot_shreds(1, 0, 2, false);
        let shred = data_shreds[0].clone();
        let (completed_data_sets, duplicate_shreds) = blockstore
            .insert_shreds(vec![shred.clone()], None, false)
            .unwrap();
        assert!(completed_data_sets.is_empty());
        assert!(duplicate_shreds.is_empty());

        let stored = blockstore.get_data_shred(1, 0).unwrap().unwrap();
        assert_eq!(&stored, shred.payload());

        let index = blockstore.get_index(1).unwrap().unwrap();
        assert!(index.data().is_present(0));
        assert_eq!(index.data().num_shreds(), 1);

        let meta = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta.parent_slot, Some(0));
        assert_eq!(meta.received, 1);
        assert_eq!(meta.consumed, 1);
        assert_eq!(meta.last_index, None);
        assert!(!meta.is_orphan());
        assert!(!meta.is_full());
    }

    #[test]
    fn test_insert_data_shreds_bulk_round_trip() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, _) = make_slot_shreds(3, 2, 100, true);
        let payloads: Vec<_> = data_shreds
            .iter()
            .map(|shred| shred.payload().clone())
            .collect();
        let (completed_data_sets, duplicate_shreds) =
            blockstore.insert_shreds(data_shreds, None, false).unwrap();
        assert!(duplicate_shreds.is_empty());
        // One completed range per erasure set.
        assert_eq!(
            completed_data_sets.len(),
            100usize.div_ceil(DATA_SHREDS_PER_FEC_BLOCK)
        );
        assert_eq!(completed_data_sets.first().unwrap().indices, 0..32);
        assert_eq!(completed_data_sets.last().unwrap().indices, 96..100);

        for (index, payload) in payloads.iter().enumerate() {
            let stored = blockstore.get_data_shred(3, index as u64).unwrap().unwrap();
            assert_eq!(&stored, payload);
        }
        let meta = blockstore.meta(3).unwrap().unwrap();
        assert_eq!(meta.consumed, 100);
        assert_eq!(meta.received, 100);
        assert_eq!(meta.last_index, Some(99));
        assert!(meta.is_full());
    }

    #[test]
    fn test_insert_same_shred_twice_is_idempotent() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, _) = make_slot_shreds(1, 0, 2, false);
        blockstore
            .insert_shreds(data_shreds.clone(), None, false)
            .unwrap();
        let meta_before = blockstore.meta(1).unwrap().unwrap();

        let (completed_data_sets, duplicates) = blockstore
            .insert_shreds(vec![data_shreds[0].clone()], None, false)
            .unwrap();
        assert!(completed_data_sets.is_empty());
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::Exists(shred)] if shred.index() == 0
        );
        assert_eq!(blockstore.meta(1).unwrap().unwrap(), meta_before);
    }

    #[test]
    fn test_insert_order_independent() {
        let (data_shreds, coding_shreds, _) = make_slot_shreds(9, 8, 40, true);
        let shreds: Vec<_> = data_shreds
            .iter()
            .chain(coding_shreds.iter())
            .cloned()
            .collect();

        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        blockstore.insert_shreds(shreds.clone(), None, false).unwrap();
        let mut meta = blockstore.meta(9).unwrap().unwrap();
        let index = blockstore.get_index(9).unwrap().unwrap();

        let mut shuffled = shreds;
        shuffled.shuffle(&mut thread_rng());
        let shuffled_path = get_tmp_ledger_path();
        let shuffled_blockstore = Blockstore::open(shuffled_path.path()).unwrap();
        shuffled_blockstore
            .insert_shreds(shuffled, None, false)
            .unwrap();
        let mut shuffled_meta = shuffled_blockstore.meta(9).unwrap().unwrap();
        let shuffled_index = shuffled_blockstore.get_index(9).unwrap().unwrap();

        // The first-shred timestamp is wall-clock dependent; everything
        // else must agree regardless of arrival order.
        meta.first_shred_timestamp = 0;
        shuffled_meta.first_shred_timestamp = 0;
        assert_eq!(meta, shuffled_meta);
        assert_eq!(index, shuffled_index);
    }

    #[test]
    fn test_handle_chaining_basic() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let num_chunks = 4;
        let (slot0_shreds, _, _) = make_slot_shreds(0, 0, num_chunks, true);
        let (slot1_shreds, _, _) = make_slot_shreds(1, 0, num_chunks, true);
        let (slot2_shreds, _, _) = make_slot_shreds(2, 1, num_chunks, true);

        // Insert slot 1
        blockstore.insert_shreds(slot1_shreds, None, false).unwrap();
        let meta1 = blockstore.meta(1).unwrap().unwrap();
        assert!(meta1.next_slots.is_empty());
        assert!(meta1.is_full());
        assert!(!meta1.is_connected());
        assert_eq!(meta1.parent_slot, Some(0));
        // Slot 0 is only known as slot 1's parent: an orphan placeholder.
        let meta0 = blockstore.meta(0).unwrap().unwrap();
        assert!(meta0.is_orphan());
        assert_eq!(meta0.next_slots, vec![1]);
        assert_eq!(
            blockstore.orphans_iterator(0).unwrap().collect::<Vec<_>>(),
            vec![0]
        );

        // Insert slot 2
        blockstore.insert_shreds(slot2_shreds, None, false).unwrap();
        let meta1 = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta1.next_slots, vec![2]);
        assert!(!meta1.is_connected());
        let meta2 = blockstore.meta(2).unwrap().unwrap();
        assert!(meta2.next_slots.is_empty());
        assert!(meta2.is_full());
        assert!(!meta2.is_connected());

        // Insert slot 0: the chain connects all the way down.
        blockstore.insert_shreds(slot0_shreds, None, false).unwrap();
        let meta0 = blockstore.meta(0).unwrap().unwrap();
        assert_eq!(meta0.next_slots, vec![1]);
        assert!(meta0.is_connected());
        let meta1 = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta1.next_slots, vec![2]);
        assert!(meta1.is_connected());
        let meta2 = blockstore.meta(2).unwrap().unwrap();
        assert!(meta2.next_slots.is_empty());
        assert!(meta2.is_connected());
        assert_eq!(blockstore.orphans_iterator(0).unwrap().count(), 0);
    }

    #[test]
    fn test_orphans() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        // Slot 5 chains to the unknown slot 3.
        let (slot5_shreds, _, _) = make_slot_shreds(5, 3, 2, true);
        blockstore.insert_shreds(slot5_shreds, None, false).unwrap();
        assert!(blockstore.meta(3).unwrap().unwrap().is_orphan());
        assert_eq!(
            blockstore.orphans_iterator(0).unwrap().collect::<Vec<_>>(),
            vec![3]
        );

        // Slot 3 arrives chaining to slot 2: 3 is adopted, 2 becomes the
        // orphan.
        let (slot3_shreds, _, _) = make_slot_shreds(3, 2, 2, true);
        blockstore.insert_shreds(slot3_shreds, None, false).unwrap();
        assert!(!blockstore.meta(3).unwrap().unwrap().is_orphan());
        assert!(blockstore.meta(2).unwrap().unwrap().is_orphan());
        assert_eq!(
            blockstore.orphans_iterator(0).unwrap().collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn test_dead_slot_detection() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, _) = make_slot_shreds(5, 4, 6, false);
        // Insert indexes {0, 1, 3}; the slot has a hole at 2 and
        // received = 4.
        let shreds = vec![
            data_shreds[0].clone(),
            data_shreds[1].clone(),
            data_shreds[3].clone(),
        ];
        blockstore.insert_shreds(shreds, None, false).unwrap();
        assert!(!blockstore.is_dead(5));
        assert_eq!(blockstore.meta(5).unwrap().unwrap().received, 4);

        // A last-in-slot shred at index 2 < received announces a shorter
        // alternative version of the slot; the local version can never
        // become full, so the slot is marked dead and the conflict is
        // reported.
        let mut payload = data_shreds[2].payload().clone();
        payload[OFFSET_OF_DATA_FLAGS] |= 0b1100_0000;
        let last_shred = Shred::new_from_serialized_shred(payload).unwrap();
        let (_, duplicates) = blockstore
            .insert_shreds(vec![last_shred], None, false)
            .unwrap();
        assert_matches!(&duplicates[..], [PossibleDuplicateShred::LastIndexConflict(_, _)]);
        assert!(blockstore.is_dead(5));
        assert!(blockstore.has_duplicate_shreds_in_slot(5));
        // The conflicting shred itself is not stored.
        assert!(blockstore.get_data_shred(5, 2).unwrap().is_none());
        assert_eq!(blockstore.meta(5).unwrap().unwrap().received, 4);
        assert_eq!(
            blockstore.dead_slots_iterator(0).unwrap().collect::<Vec<_>>(),
            vec![5]
        );
    }

    #[test]
    fn test_last_index_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, keypair) = make_slot_shreds(7, 6, 4, true);
        blockstore
            .insert_shreds(data_shreds.clone(), None, false)
            .unwrap();
        let meta = blockstore.meta(7).unwrap().unwrap();
        assert!(meta.is_full());
        assert_eq!(meta.last_index, Some(3));

        // A shred with an index past the recorded last index proves the
        // leader produced a longer alternative version of the slot.
        let shredder = Shredder::new(7, 6, 0, 0).unwrap();
        let chunk = vec![42u8; 64];
        let chunks = [&chunk[..]];
        let (extra_data, _) = shredder
            .make_fec_set_shreds(
                &keypair,
                &chunks,
                8, // fec_set_index
                8, // first_coding_index
                1, // num_coding_shreds
                false,
                None,
                &ReedSolomonCache::default(),
            )
            .unwrap();
        let (_, duplicates) = blockstore
            .insert_shreds(vec![extra_data[0].clone()], None, false)
            .unwrap();
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::LastIndexConflict(original, conflict)]
                if original.index() == 8 && conflict == data_shreds[3].payload()
        );
        assert!(blockstore.get_data_shred(7, 8).unwrap().is_none());
        let proof = blockstore.get_duplicate_slot(7).unwrap().unwrap();
        assert_eq!(&proof.shred1, data_shreds[3].payload());
        assert_eq!(&proof.shred2, extra_data[0].payload());
    }

    #[test]
    fn test_erasure_config_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let c1 = make_legacy_coding_shred(3, 0, 0, 4, 4, 0);
        let (_, duplicates) = blockstore
            .insert_shreds(vec![c1.clone()], None, false)
            .unwrap();
        assert!(duplicates.is_empty());
        assert!(blockstore.get_coding_shred(3, 0).unwrap().is_some());

        // Same erasure set, disagreeing config.
        let c2 = make_legacy_coding_shred(3, 1, 0, 5, 4, 1);
        let (_, duplicates) = blockstore
            .insert_shreds(vec![c2.clone()], None, false)
            .unwrap();
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::ErasureConflict(original, conflict)]
                if original.index() == 1 && conflict == c1.payload()
        );
        assert!(blockstore.get_coding_shred(3, 1).unwrap().is_none());
        let proof = blockstore.get_duplicate_slot(3).unwrap().unwrap();
        assert_eq!(&proof.shred1, c1.payload());
        assert_eq!(&proof.shred2, c2.payload());
        // The recorded config is unchanged.
        let erasure_meta = blockstore
            .erasure_meta(ErasureSetId::new(3, 0))
            .unwrap()
            .unwrap();
        assert!(erasure_meta.check_coding_shred(&c1));
    }

    #[test]
    fn test_merkle_root_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let shredder = Shredder::new(4, 3, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data_a = random_bytes(2, false);
        let chunks_a: Vec<&[u8]> = data_a.chunks(data_shred_capacity(false)).collect();
        let (_, coding_a) = shredder
            .make_fec_set_shreds(&keypair, &chunks_a, 0, 0, 2, false, None, &reed_solomon_cache)
            .unwrap();
        let data_b = random_bytes(2, false);
        let chunks_b: Vec<&[u8]> = data_b.chunks(data_shred_capacity(false)).collect();
        let (_, coding_b) = shredder
            .make_fec_set_shreds(&keypair, &chunks_b, 0, 0, 2, false, None, &reed_solomon_cache)
            .unwrap();

        // Two coding shreds of the same erasure set carrying different
        // Merkle roots prove equivocation.
        let c1 = coding_a[0].clone();
        let c2 = coding_b[1].clone();
        assert_ne!(c1.merkle_root(), c2.merkle_root());

        blockstore.insert_shreds(vec![c1.clone()], None, false).unwrap();
        let (_, duplicates) = blockstore
            .insert_shreds(vec![c2.clone()], None, false)
            .unwrap();
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::MerkleRootConflict(original, conflict)]
                if original == &c2 && conflict == c1.payload()
        );
        assert!(blockstore.get_coding_shred(4, 1).unwrap().is_none());
        // The recorded root is unchanged.
        let merkle_root_meta = blockstore
            .merkle_root_meta(ErasureSetId::new(4, 0))
            .unwrap()
            .unwrap();
        assert_eq!(merkle_root_meta.merkle_root(), c1.merkle_root());
    }

    #[test]
    fn test_recovery() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let slot = 7;
        let shredder = Shredder::new(slot, 6, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data = random_bytes(34, false);
        let chunks: Vec<&[u8]> = data.chunks(data_shred_capacity(false)).collect();
        let (data_shreds, coding_shreds) = shredder
            .make_fec_set_shreds(
                &keypair,
                &chunks,
                0,  // fec_set_index
                0,  // first_coding_index
                34, // num_coding_shreds
                true,
                None,
                &reed_solomon_cache,
            )
            .unwrap();
        assert_eq!(data_shreds.len(), 34);
        assert_eq!(coding_shreds.len(), 34);

        // Insert only the coding shreds; recovery reconstructs all the
        // data shreds from parity alone.
        let leader = keypair.pubkey();
        let leader_schedule = move |_slot: Slot| Some(leader);
        let leader_schedule: &LeaderScheduleFn = &leader_schedule;
        let (retransmit_sender, retransmit_receiver) = unbounded();
        let num_coding = coding_shreds.len();
        let insert_results = blockstore
            .do_insert_shreds(
                coding_shreds,
                vec![false; num_coding],
                Some(leader_schedule),
                false,
                Some(&retransmit_sender),
                &reed_solomon_cache,
            )
            .unwrap();
        assert!(insert_results.duplicates.is_empty());

        for shred in &data_shreds {
            let stored = blockstore
                .get_data_shred(slot, u64::from(shred.index()))
                .unwrap()
                .unwrap();
            assert_eq!(&stored, shred.payload());
        }
        let metrics = blockstore.shred_insertion_metrics();
        assert_eq!(metrics.num_recovered.load(Ordering::Relaxed), 34);
        assert_eq!(metrics.num_recovered_failed_sig.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.num_recovered_inserted.load(Ordering::Relaxed), 34);

        let meta = blockstore.meta(slot).unwrap().unwrap();
        assert!(meta.is_full());
        assert_eq!(meta.consumed, 34);
        assert_eq!(
            insert_results.completed_data_set_infos,
            vec![CompletedDataSetInfo { slot, indices: 0..34 }]
        );
        // Recovered payloads are forwarded for retransmission as one batch.
        let retransmitted = retransmit_receiver.try_recv().unwrap();
        assert_eq!(retransmitted.len(), 34);
    }

    #[test]
    fn test_recovery_fails_leader_signature_check() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let shredder = Shredder::new(7, 6, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data = random_bytes(4, false);
        let chunks: Vec<&[u8]> = data.chunks(data_shred_capacity(false)).collect();
        let (_, coding_shreds) = shredder
            .make_fec_set_shreds(&keypair, &chunks, 0, 0, 4, true, None, &reed_solomon_cache)
            .unwrap();

        // The supposed leader is a different key: every recovered shred
        // fails verification and nothing is committed.
        let wrong_leader = Keypair::new().pubkey();
        let leader_schedule = move |_slot: Slot| Some(wrong_leader);
        let leader_schedule: &LeaderScheduleFn = &leader_schedule;
        let num_coding = coding_shreds.len();
        blockstore
            .do_insert_shreds(
                coding_shreds,
                vec![false; num_coding],
                Some(leader_schedule),
                false,
                None,
                &reed_solomon_cache,
            )
            .unwrap();
        let metrics = blockstore.shred_insertion_metrics();
        assert_eq!(metrics.num_recovered_failed_sig.load(Ordering::Relaxed), 4);
        assert!(blockstore.get_data_shred(7, 0).unwrap().is_none());
    }

    #[test]
    fn test_recovery_forwards_coding_payloads() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let slot = 9;
        let shredder = Shredder::new(slot, 8, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data = random_bytes(4, false);
        let chunks: Vec<&[u8]> = data.chunks(data_shred_capacity(false)).collect();
        let (data_shreds, coding_shreds) = shredder
            .make_fec_set_shreds(&keypair, &chunks, 0, 0, 4, true, None, &reed_solomon_cache)
            .unwrap();

        // Half the data and half the coding shreds arrive; recovery
        // rebuilds the rest of the set.
        let shreds: Vec<Shred> = data_shreds[..2]
            .iter()
            .chain(&coding_shreds[..2])
            .cloned()
            .collect();
        let leader = keypair.pubkey();
        let leader_schedule = move |_slot: Slot| Some(leader);
        let leader_schedule: &LeaderScheduleFn = &leader_schedule;
        let (retransmit_sender, retransmit_receiver) = unbounded();
        let num_shreds = shreds.len();
        blockstore
            .do_insert_shreds(
                shreds,
                vec![false; num_shreds],
                Some(leader_schedule),
                false,
                Some(&retransmit_sender),
                &reed_solomon_cache,
            )
            .unwrap();

        // Recovered data shreds are stored; recovered coding shreds are
        // not, but their payloads join the retransmit batch with them.
        for shred in &data_shreds[2..] {
            let stored = blockstore
                .get_data_shred(slot, u64::from(shred.index()))
                .unwrap()
                .unwrap();
            assert_eq!(&stored, shred.payload());
        }
        assert!(blockstore.get_coding_shred(slot, 2).unwrap().is_none());
        assert!(blockstore.get_coding_shred(slot, 3).unwrap().is_none());
        let retransmitted = retransmit_receiver.try_recv().unwrap();
        assert_eq!(retransmitted.len(), 4);
        for shred in data_shreds[2..].iter().chain(&coding_shreds[2..]) {
            assert!(retransmitted.contains(shred.payload()));
        }
        let metrics = blockstore.shred_insertion_metrics();
        assert_eq!(metrics.num_recovered.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.num_recovered_inserted.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.num_recovered_failed_sig.load(Ordering::Relaxed), 0);
        assert!(blockstore.meta(slot).unwrap().unwrap().is_full());
    }

    fn make_chained_coding_sets(
        keypair: &Keypair,
        slot: Slot,
        parent_slot: Slot,
        first_chained_root: Hash,
        second_chained_root: Hash,
    ) -> (Vec<Shred>, Vec<Shred>) {
        let shredder = Shredder::new(slot, parent_slot, 0, 0).unwrap();
        let reed_solomon_cache = ReedSolomonCache::default();
        let data_a = random_bytes(2, true);
        let chunks_a: Vec<&[u8]> = data_a.chunks(data_shred_capacity(true)).collect();
        let (_, coding_a) = shredder
            .make_fec_set_shreds(
                keypair,
                &chunks_a,
                0, // fec_set_index
                0, // first_coding_index
                2,
                false,
                Some(first_chained_root),
                &reed_solomon_cache,
            )
            .unwrap();
        let data_b = random_bytes(2, true);
        let chunks_b: Vec<&[u8]> = data_b.chunks(data_shred_capacity(true)).collect();
        let (_, coding_b) = shredder
            .make_fec_set_shreds(
                keypair,
                &chunks_b,
                2, // fec_set_index: consecutive with the first set
                2, // first_coding_index
                2,
                false,
                Some(second_chained_root),
                &reed_solomon_cache,
            )
            .unwrap();
        (coding_a, coding_b)
    }

    #[test]
    fn test_backwards_chained_merkle_root_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        // The second set chains to a bogus root instead of the first
        // set's Merkle root.
        let bogus_root = Hash::new_from_array([7u8; 32]);
        let (coding_a, coding_b) =
            make_chained_coding_sets(&keypair, 5, 4, Hash::default(), bogus_root);

        blockstore
            .insert_shreds(vec![coding_a[0].clone()], None, false)
            .unwrap();
        let (_, duplicates) = blockstore
            .insert_shreds(vec![coding_b[0].clone()], None, false)
            .unwrap();
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::ChainedMerkleRootConflict(original, conflict)]
                if original == &coding_b[0] && conflict == coding_a[0].payload()
        );
        // The check is consultative: the shred is stored anyway.
        assert!(blockstore.get_coding_shred(5, 2).unwrap().is_some());
        assert!(blockstore.has_duplicate_shreds_in_slot(5));
    }

    #[test]
    fn test_forward_chained_merkle_root_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let bogus_root = Hash::new_from_array([9u8; 32]);
        let (coding_a, coding_b) =
            make_chained_coding_sets(&keypair, 5, 4, Hash::default(), bogus_root);

        // The later set arrives first; nothing to check yet.
        let (_, duplicates) = blockstore
            .insert_shreds(vec![coding_b[0].clone()], None, false)
            .unwrap();
        assert!(duplicates.is_empty());

        // When the earlier set arrives, the forward check discovers that
        // the next set does not chain to it.
        let (_, duplicates) = blockstore
            .insert_shreds(vec![coding_a[0].clone()], None, false)
            .unwrap();
        assert_matches!(
            &duplicates[..],
            [PossibleDuplicateShred::ChainedMerkleRootConflict(original, conflict)]
                if original == &coding_a[0] && conflict == coding_b[0].payload()
        );
        assert!(blockstore.get_coding_shred(5, 0).unwrap().is_some());
        assert!(blockstore.has_duplicate_shreds_in_slot(5));
    }

    #[test]
    fn test_chained_merkle_roots_consistent_sets_no_conflict() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let keypair = Keypair::new();
        let shredder = Shredder::new(6, 5, 0, 0).unwrap();
        let data = random_bytes(2 * DATA_SHREDS_PER_FEC_BLOCK, true);
        let (data_shreds, coding_shreds) = shredder
            .shreds_from_data(
                &keypair,
                &data,
                true,
                Some(Hash::default()),
                0,
                0,
                &ReedSolomonCache::default(),
            )
            .unwrap();
        let shreds: Vec<_> = data_shreds.into_iter().chain(coding_shreds).collect();
        let (_, duplicates) = blockstore.insert_shreds(shreds, None, false).unwrap();
        assert!(duplicates.is_empty());
        assert!(!blockstore.has_duplicate_shreds_in_slot(6));
    }

    #[test]
    fn test_index_coherence_random_order() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, coding_shreds, _) = make_slot_shreds(11, 10, 48, true);
        let mut shreds: Vec<_> = data_shreds.into_iter().chain(coding_shreds).collect();
        shreds.shuffle(&mut thread_rng());
        blockstore.insert_shreds(shreds, None, false).unwrap();

        // Every stored shred is recorded in the index, and the consumed
        // counter equals the length of the received prefix.
        let index = blockstore.get_index(11).unwrap().unwrap();
        for i in 0..48u64 {
            assert!(index.data().is_present(i));
            assert!(blockstore.get_data_shred(11, i).unwrap().is_some());
            assert!(index.coding().is_present(i));
            assert!(blockstore.get_coding_shred(11, i).unwrap().is_some());
        }
        let meta = blockstore.meta(11).unwrap().unwrap();
        assert_eq!(meta.consumed, 48);
        assert_eq!(meta.received, 48);
        assert!(meta.is_full());
    }

    #[test]
    fn test_trusted_insert_bypasses_duplicate_checks() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (data_shreds, _, _) = make_slot_shreds(1, 0, 2, false);
        let shred = data_shreds[0].clone();
        blockstore
            .insert_shreds(vec![shred.clone()], None, true)
            .unwrap();
        let (_, duplicates) = blockstore.insert_shreds(vec![shred], None, true).unwrap();
        assert!(duplicates.is_empty());
    }

    #[test]
    fn test_set_roots_updates_max_root() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        blockstore.set_roots([2u64, 4, 3].iter()).unwrap();
        assert_eq!(blockstore.max_root(), 4);
        assert!(blockstore.is_root(3).unwrap());
        assert!(!blockstore.is_root(5).unwrap());

        // Coding shreds at or below the root are useless and rejected.
        let code = make_legacy_coding_shred(4, 0, 0, 2, 2, 0);
        let (_, duplicates) = blockstore.insert_shreds(vec![code], None, false).unwrap();
        assert!(duplicates.is_empty());
        assert!(blockstore.get_coding_shred(4, 0).unwrap().is_none());
        // But slots above the root are accepted.
        let code = make_legacy_coding_shred(5, 0, 0, 2, 2, 0);
        blockstore.insert_shreds(vec![code], None, false).unwrap();
        assert!(blockstore.get_coding_shred(5, 0).unwrap().is_some());
    }

    #[test]
    fn test_new_shred_and_completed_slot_signals() {
        let ledger_path = get_tmp_ledger_path();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let (new_shred_sender, new_shred_receiver) = unbounded();
        let (completed_sender, completed_receiver) = unbounded();
        blockstore.add_new_shred_signal(new_shred_sender);
        blockstore.add_completed_slots_signal(completed_sender);

        // Slot 1 completes, but its parent is unknown so there is nothing
        // to replay yet.
        let (slot1_shreds, _, _) = make_slot_shreds(1, 0, 2, true);
        blockstore.insert_shreds(slot1_shreds, None, false).unwrap();
        assert_eq!(completed_receiver.try_recv().unwrap(), vec![1]);
        assert!(new_shred_receiver.try_recv().is_err());

        // Slot 0 arrives: consecutive shreds of a connected slot are ready
        // for replay.
        let (slot0_shreds, _, _) = make_slot_shreds(0, 0, 2, true);
        blockstore.insert_shreds(slot0_shreds, None, false).unwrap();
        assert!(new_shred_receiver.try_recv().unwrap());
        assert_eq!(completed_receiver.try_recv().unwrap(), vec![0]);
    }

    #[test]
    fn test_update_completed_data_indexes() {
        let mut completed_data_indexes = CompletedDataIndexes::default();
        let mut shred_index = ShredIndex::default();

        for i in 0..10 {
            shred_index.set_present(i as u64, true);
            assert_eq!(
                update_completed_data_indexes(true, i, &shred_index, &mut completed_data_indexes),
                vec![i..i + 1]
            );
            assert!(completed_data_indexes.iter().copied().eq(0..=i));
        }
    }

    #[test]
    fn test_update_completed_data_indexes_out_of_order() {
        let mut completed_data_indexes = CompletedDataIndexes::default();
        let mut shred_index = ShredIndex::default();

        shred_index.set_present(4, true);
        assert!(
            update_completed_data_indexes(false, 4, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.is_empty());

        shred_index.set_present(2, true);
        assert!(
            update_completed_data_indexes(false, 2, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.is_empty());

        shred_index.set_present(3, true);
        assert!(
            update_completed_data_indexes(true, 3, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.iter().eq([3].iter()));

        // Inserting data complete shred 1 now confirms the range (2, 3) is
        // complete.
        shred_index.set_present(1, true);
        assert_eq!(
            update_completed_data_indexes(true, 1, &shred_index, &mut completed_data_indexes),
            vec![2..4]
        );
        assert!(completed_data_indexes.iter().eq([1, 3].iter()));

        // Inserting data complete shred 0 confirms the ranges (0, 0) and
        // (1, 1) are complete.
        shred_index.set_present(0, true);
        assert_eq!(
            update_completed_data_indexes(true, 0, &shred_index, &mut completed_data_indexes),
            vec![0..1, 1..2]
        );
        assert!(completed_data_indexes.iter().eq([0, 1, 3].iter()));
    }
}
