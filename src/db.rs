//! Memtable-only engine
//!
//! Ties column families, the sequencer, the flush queue and the recovered
//! transaction table together behind a small write/read/recover API. Log
//! persistence and table building live outside this crate; flushing here only
//! rotates full memtables to the immutable list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::apply::{
    insert_batch_into, ApplyOptions, EngineContext, ErrorPolicy, InsertOutcome,
    RecoveredTransactionTable, WriteGroupSequencer, Writer,
};
use crate::batch::{BatchError, BatchResult, SequenceNumber, WriteBatch};
use crate::storage::{ColumnFamilyData, ColumnFamilyOptions, ColumnFamilySet, FlushScheduler};

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct DbOptions {
    /// Accept prepared transactions in replayed logs
    pub allow_2pc: bool,

    /// Skip writes to unknown column families instead of failing
    pub ignore_missing_column_families: bool,

    /// Apply each writer of a group with its own inserter
    pub concurrent_memtable_writes: bool,

    /// What a write group does after one writer fails
    pub error_policy: ErrorPolicy,

    /// Options of the default column family
    pub default_column_family: ColumnFamilyOptions,
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_2pc(mut self, allow: bool) -> Self {
        self.allow_2pc = allow;
        self
    }

    pub fn with_ignore_missing_column_families(mut self, ignore: bool) -> Self {
        self.ignore_missing_column_families = ignore;
        self
    }

    pub fn with_concurrent_memtable_writes(mut self, concurrent: bool) -> Self {
        self.concurrent_memtable_writes = concurrent;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_default_column_family(mut self, options: ColumnFamilyOptions) -> Self {
        self.default_column_family = options;
        self
    }
}

/// In-memory engine driven by write batches
pub struct MemDb {
    options: DbOptions,
    column_families: ColumnFamilySet,
    sequencer: WriteGroupSequencer,
    flush_scheduler: FlushScheduler,
    recovered: RecoveredTransactionTable,
    /// Serialises write group leaders
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl MemDb {
    /// Create an empty engine
    pub fn open(options: DbOptions) -> Self {
        tracing::info!(
            allow_2pc = options.allow_2pc,
            concurrent_memtable_writes = options.concurrent_memtable_writes,
            "Opening memtable engine"
        );
        Self {
            column_families: ColumnFamilySet::new(options.default_column_family.clone()),
            options,
            sequencer: WriteGroupSequencer::default(),
            flush_scheduler: FlushScheduler::new(),
            recovered: RecoveredTransactionTable::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    pub fn column_families(&self) -> &ColumnFamilySet {
        &self.column_families
    }

    pub fn flush_scheduler(&self) -> &FlushScheduler {
        &self.flush_scheduler
    }

    /// Add a column family and return its id
    pub fn create_column_family(&self, name: &str, options: ColumnFamilyOptions) -> BatchResult<u32> {
        let cfd = self.column_families.create(name, options)?;
        tracing::info!(cf = cfd.id(), name, "Created column family");
        Ok(cfd.id())
    }

    pub fn drop_column_family(&self, id: u32) -> BatchResult<()> {
        self.column_families.drop_column_family(id)?;
        tracing::info!(cf = id, "Dropped column family");
        Ok(())
    }

    /// Last sequence number handed out
    pub fn last_sequence(&self) -> SequenceNumber {
        self.sequencer.last_sequence()
    }

    fn check_open(&self) -> BatchResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::NotSupported("engine is closed".to_string()));
        }
        Ok(())
    }

    fn live_options(&self) -> ApplyOptions {
        ApplyOptions::new()
            .with_ignore_missing_column_families(self.options.ignore_missing_column_families)
            .with_concurrent_memtable_writes(self.options.concurrent_memtable_writes)
            .with_error_policy(self.options.error_policy)
    }

    /// Apply one batch. Returns the last sequence number it consumed.
    pub fn write(&self, batch: &WriteBatch) -> BatchResult<SequenceNumber> {
        let mut writers = [Writer::new(batch)];
        self.write_group(&mut writers)?;
        Ok(writers[0].last_sequence())
    }

    /// Apply a group of writers as one leader. Per-writer failures are left
    /// in each writer's `status`. Returns the group's last sequence number.
    pub fn write_group(&self, writers: &mut [Writer<'_>]) -> BatchResult<SequenceNumber> {
        self.check_open()?;
        let _leader = self.write_lock.lock();
        self.sequencer.apply(
            writers,
            self.column_families.memtables(),
            Some(&self.flush_scheduler),
            self.live_options(),
            Some(self),
        )
    }

    /// Replay one batch read back from log `log_number`
    pub fn recover(&self, log_number: u64, batch: &WriteBatch) -> BatchResult<InsertOutcome> {
        self.check_open()?;
        let _leader = self.write_lock.lock();
        let options = ApplyOptions::new()
            .with_ignore_missing_column_families(self.options.ignore_missing_column_families)
            .with_recovering_log_number(log_number);

        let (outcome, result) = insert_batch_into(
            batch,
            self.column_families.memtables(),
            Some(&self.flush_scheduler),
            options,
            Some(self),
        );
        // Records ahead of a failure are already applied
        self.sequencer.advance_to(outcome.last_sequence);
        if let Err(e) = result {
            tracing::warn!(
                log = log_number,
                last_sequence = outcome.last_sequence,
                error = %e,
                "Replay of batch failed"
            );
            return Err(e);
        }
        tracing::debug!(
            log = log_number,
            last_sequence = outcome.last_sequence,
            has_valid_writes = outcome.has_valid_writes,
            "Replayed batch"
        );
        Ok(outcome)
    }

    /// Read the latest value of `key` in column family `cf`
    pub fn get(&self, cf: u32, key: &[u8]) -> BatchResult<Option<Vec<u8>>> {
        self.get_at(cf, key, self.last_sequence())
    }

    /// Read `key` as of `snapshot`
    pub fn get_at(&self, cf: u32, key: &[u8], snapshot: SequenceNumber) -> BatchResult<Option<Vec<u8>>> {
        let cfd = self
            .column_families
            .get(cf)
            .ok_or_else(|| BatchError::InvalidArgument(format!("unknown column family {}", cf)))?;
        cfd.get(key, snapshot)
    }

    /// Rotate every memtable queued for flushing. Returns the column
    /// families rotated.
    pub fn process_flush_requests(&self) -> Vec<Arc<ColumnFamilyData>> {
        let mut rotated = Vec::new();
        while let Some(cfd) = self.flush_scheduler.take_next_column_family() {
            let frozen = cfd.switch_memtable();
            tracing::info!(
                cf = cfd.id(),
                memtable = frozen.id(),
                entries = frozen.num_entries(),
                bytes = frozen.approximate_memory_usage(),
                "Memtable switched for flush"
            );
            rotated.push(cfd);
        }
        rotated
    }

    /// Stop accepting writes
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_scheduler.clear();
    }
}

impl EngineContext for MemDb {
    fn allow_2pc(&self) -> bool {
        self.options.allow_2pc
    }

    fn recovered_transactions(&self) -> &RecoveredTransactionTable {
        &self.recovered
    }
}
