use log::{info, trace};
use rocksdb::perf::set_perf_stats;
use rocksdb::{PerfContext, PerfMetric, PerfStatsLevel};
use solana_time_utils::timestamp;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// The minimum time duration between two RocksDB perf samples of the same operation.
const PERF_SAMPLING_MIN_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
/// A struct that holds the current status of RocksDB perf sampling.
pub struct PerfSamplingStatus {
    // The number of RocksDB operations since the last perf sample.
    op_count: AtomicUsize,
    // The timestamp of the latest operation with perf stats collection.
    last_sample_time_ms: AtomicU64,
}

impl PerfSamplingStatus {
    fn should_sample(&self, sample_count_interval: usize) -> bool {
        if sample_count_interval == 0 {
            return false;
        }

        // Rate-limiting based on the number of samples.
        if self.op_count.fetch_add(1, Ordering::Relaxed) < sample_count_interval {
            return false;
        }
        self.op_count.store(0, Ordering::Relaxed);

        // Rate-limiting based on the time duration.
        let current_time_ms = timestamp();
        let old_time_ms = self.last_sample_time_ms.load(Ordering::Relaxed);
        if old_time_ms + (PERF_SAMPLING_MIN_DURATION.as_millis() as u64) > current_time_ms {
            return false;
        }

        // If the `last_sample_time_ms` has a different value than `old_time_ms`,
        // it means some other thread has performed the sampling and updated
        // the last sample time.  In this case, the current thread will skip
        // the current sample.
        self.last_sample_time_ms
            .compare_exchange_weak(
                old_time_ms,
                current_time_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

// Thread local instance of RocksDB's PerfContext.
thread_local! {static PER_THREAD_ROCKS_PERF_CONTEXT: RefCell<PerfContext> = RefCell::new(PerfContext::default());}

/// The function enables RocksDB PerfContext once for every `sample_interval`.
///
/// PerfContext is a thread-local struct defined in RocksDB for collecting
/// per-thread read / write performance metrics.
///
/// When this function enables PerfContext, the function will return true,
/// and the PerfContext of the subsequent RocksDB operation will be collected.
pub(crate) fn maybe_enable_rocksdb_perf(
    sample_interval: usize,
    perf_status: &PerfSamplingStatus,
) -> Option<Instant> {
    if perf_status.should_sample(sample_interval) {
        set_perf_stats(PerfStatsLevel::EnableTime);
        PER_THREAD_ROCKS_PERF_CONTEXT.with(|perf_context| {
            perf_context.borrow_mut().reset();
        });
        return Some(Instant::now());
    }
    None
}

/// Reports the collected PerfContext for one sampled read operation.
pub(crate) fn report_rocksdb_read_perf(cf_name: &'static str, op_name: &'static str, start: &Instant) {
    PER_THREAD_ROCKS_PERF_CONTEXT.with(|perf_context_cell| {
        set_perf_stats(PerfStatsLevel::Disable);
        let perf_context = perf_context_cell.borrow();
        trace!(
            "rocksdb_read_perf: cf: {cf_name}, op: {op_name}, elapsed_us: {}, block_read_count: {}, block_read_bytes: {}",
            start.elapsed().as_micros(),
            perf_context.metric(PerfMetric::BlockReadCount),
            perf_context.metric(PerfMetric::BlockReadByte),
        );
    });
}

/// Reports the collected PerfContext for one sampled write operation.
pub(crate) fn report_rocksdb_write_perf(cf_name: &'static str, op_name: &'static str, start: &Instant) {
    PER_THREAD_ROCKS_PERF_CONTEXT.with(|perf_context_cell| {
        set_perf_stats(PerfStatsLevel::Disable);
        let perf_context = perf_context_cell.borrow();
        trace!(
            "rocksdb_write_perf: cf: {cf_name}, op: {op_name}, elapsed_us: {}, write_wal_us: {}",
            start.elapsed().as_micros(),
            perf_context.metric(PerfMetric::WriteWalTime) / 1000,
        );
    });
}

/// Counters for the shred insertion pipeline.
///
/// All counters are cumulative for the lifetime of the blockstore and are
/// bumped with relaxed atomics so concurrent readers never synchronize
/// with the inserter.
#[derive(Default)]
pub struct ShredInsertionMetrics {
    pub num_shreds: AtomicU64,
    pub num_inserted: AtomicU64,
    pub num_repair: AtomicU64,
    pub num_recovered: AtomicU64,
    pub num_recovered_inserted: AtomicU64,
    pub num_recovered_exists: AtomicU64,
    pub num_recovered_failed_sig: AtomicU64,
    pub num_recovered_failed_invalid: AtomicU64,
    pub num_recovered_blockstore_error: AtomicU64,
    pub num_data_shreds_exists: AtomicU64,
    pub num_data_shreds_invalid: AtomicU64,
    pub num_code_shreds_exists: AtomicU64,
    pub num_code_shreds_invalid: AtomicU64,
    pub num_code_shreds_invalid_erasure_config: AtomicU64,
    pub insert_lock_elapsed_us: AtomicU64,
    pub insert_shreds_elapsed_us: AtomicU64,
    pub shred_recovery_elapsed_us: AtomicU64,
    pub chaining_elapsed_us: AtomicU64,
    pub commit_working_sets_elapsed_us: AtomicU64,
    pub write_batch_elapsed_us: AtomicU64,
    pub total_elapsed_us: AtomicU64,
    pub index_meta_time_us: AtomicU64,
}

impl ShredInsertionMetrics {
    pub fn report(&self) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        info!(
            "shred_inserter: \
             num_shreds: {}, num_inserted: {}, num_repair: {}, \
             num_recovered: {}, num_recovered_inserted: {}, num_recovered_exists: {}, \
             num_recovered_failed_sig: {}, num_recovered_failed_invalid: {}, \
             num_recovered_blockstore_error: {}, \
             num_data_shreds_exists: {}, num_data_shreds_invalid: {}, \
             num_code_shreds_exists: {}, num_code_shreds_invalid: {}, \
             num_code_shreds_invalid_erasure_config: {}, \
             insert_lock_elapsed_us: {}, insert_shreds_elapsed_us: {}, \
             shred_recovery_elapsed_us: {}, chaining_elapsed_us: {}, \
             commit_working_sets_elapsed_us: {}, write_batch_elapsed_us: {}, \
             total_elapsed_us: {}, index_meta_time_us: {}",
            load(&self.num_shreds),
            load(&self.num_inserted),
            load(&self.num_repair),
            load(&self.num_recovered),
            load(&self.num_recovered_inserted),
            load(&self.num_recovered_exists),
            load(&self.num_recovered_failed_sig),
            load(&self.num_recovered_failed_invalid),
            load(&self.num_recovered_blockstore_error),
            load(&self.num_data_shreds_exists),
            load(&self.num_data_shreds_invalid),
            load(&self.num_code_shreds_exists),
            load(&self.num_code_shreds_invalid),
            load(&self.num_code_shreds_invalid_erasure_config),
            load(&self.insert_lock_elapsed_us),
            load(&self.insert_shreds_elapsed_us),
            load(&self.shred_recovery_elapsed_us),
            load(&self.chaining_elapsed_us),
            load(&self.commit_working_sets_elapsed_us),
            load(&self.write_batch_elapsed_us),
            load(&self.total_elapsed_us),
            load(&self.index_meta_time_us),
        );
    }
}
