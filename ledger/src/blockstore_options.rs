use crate::blockstore_db::{default_num_compaction_threads, default_num_flush_threads};
use rocksdb::{DBCompressionType as RocksCompressionType, DBRecoveryMode};
use std::num::NonZeroUsize;

/// The subdirectory under the ledger path where the rocksdb database
/// lives.
pub const BLOCKSTORE_DIRECTORY_ROCKS_LEVEL: &str = "rocksdb";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Primary (read/write) access; only one process can have Primary access.
    Primary,
    /// Primary (read/write) access with rocksdb automatic compaction disabled.
    PrimaryForMaintenance,
    /// Secondary (read) access
    Secondary,
}

#[derive(Clone, Debug)]
pub enum BlockstoreRecoveryMode {
    TolerateCorruptedTailRecords,
    AbsoluteConsistency,
    PointInTime,
    SkipAnyCorruptedRecord,
}

impl From<BlockstoreRecoveryMode> for DBRecoveryMode {
    fn from(brm: BlockstoreRecoveryMode) -> Self {
        match brm {
            BlockstoreRecoveryMode::TolerateCorruptedTailRecords => {
                DBRecoveryMode::TolerateCorruptedTailRecords
            }
            BlockstoreRecoveryMode::AbsoluteConsistency => DBRecoveryMode::AbsoluteConsistency,
            BlockstoreRecoveryMode::PointInTime => DBRecoveryMode::PointInTime,
            BlockstoreRecoveryMode::SkipAnyCorruptedRecord => {
                DBRecoveryMode::SkipAnyCorruptedRecord
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockstoreCompressionType {
    #[default]
    None,
    Lz4,
}

impl BlockstoreCompressionType {
    pub(crate) fn to_rocksdb_compression_type(&self) -> RocksCompressionType {
        match self {
            Self::None => RocksCompressionType::None,
            Self::Lz4 => RocksCompressionType::Lz4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LedgerColumnOptions {
    /// Compression applied to column values on disk.
    pub compression_type: BlockstoreCompressionType,

    /// Sample one out of this many column reads/writes for rocksdb perf
    /// stats; zero disables sampling.
    pub rocks_perf_sample_interval: usize,
}

impl Default for LedgerColumnOptions {
    fn default() -> Self {
        Self {
            compression_type: BlockstoreCompressionType::default(),
            rocks_perf_sample_interval: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockstoreOptions {
    pub access_type: AccessType,
    pub recovery_mode: Option<BlockstoreRecoveryMode>,
    pub enforce_ulimit_nofile: bool,
    pub column_options: LedgerColumnOptions,
    pub num_rocksdb_compaction_threads: NonZeroUsize,
    pub num_rocksdb_flush_threads: NonZeroUsize,
}

impl Default for BlockstoreOptions {
    /// The default options for a validator with Primary (read/write)
    /// blockstore access.
    fn default() -> Self {
        Self {
            access_type: AccessType::Primary,
            recovery_mode: None,
            enforce_ulimit_nofile: true,
            column_options: LedgerColumnOptions::default(),
            num_rocksdb_compaction_threads: default_num_compaction_threads(),
            num_rocksdb_flush_threads: default_num_flush_threads(),
        }
    }
}
