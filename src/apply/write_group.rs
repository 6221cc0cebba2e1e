//! Write groups
//!
//! A write group is a set of writers whose batches are applied together by
//! one leader. The [`WriteGroupSequencer`] hands each writer a contiguous
//! range of sequence numbers, one per counted record, in writer order.
//!
//! Three entry points apply batches to memtables:
//! - [`insert_group_into`]: one inserter drives the whole group
//! - [`insert_writer_into`]: one writer with its own inserter, for
//!   concurrent memtable writes (counters are post-processed)
//! - [`insert_batch_into`]: a standalone batch at its own header sequence,
//!   as during log replay

use std::sync::atomic::{AtomicU64, Ordering};

use crate::apply::inserter::MemTableInserter;
use crate::apply::options::{ApplyOptions, EngineContext, ErrorPolicy};
use crate::batch::{BatchError, BatchResult, SequenceNumber, WriteBatch, HEADER_SIZE};
use crate::storage::{ColumnFamilyMemTables, FlushScheduler};

/// One caller's batch inside a write group
#[derive(Debug)]
pub struct Writer<'b> {
    pub batch: &'b WriteBatch,
    /// First sequence number of the batch, set by the sequencer
    pub sequence: SequenceNumber,
    /// Log holding this writer's prepared section (0 = none)
    pub log_ref: u64,
    /// Write to the log only
    pub disable_memtable: bool,
    /// Failure recorded while applying this writer
    pub status: Option<BatchError>,
}

impl<'b> Writer<'b> {
    pub fn new(batch: &'b WriteBatch) -> Self {
        Self {
            batch,
            sequence: 0,
            log_ref: 0,
            disable_memtable: false,
            status: None,
        }
    }

    pub fn with_log_ref(mut self, log_ref: u64) -> Self {
        self.log_ref = log_ref;
        self
    }

    pub fn with_disable_memtable(mut self, disable: bool) -> Self {
        self.disable_memtable = disable;
        self
    }

    pub fn should_write_to_memtable(&self) -> bool {
        self.status.is_none() && !self.disable_memtable && self.batch.data_size() > HEADER_SIZE
    }

    /// Last sequence number this writer's batch consumes
    pub fn last_sequence(&self) -> SequenceNumber {
        (self.sequence + u64::from(self.batch.count())).saturating_sub(1)
    }
}

/// Result of applying a standalone batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Sequence number of the last counted record applied
    pub last_sequence: SequenceNumber,
    /// Whether anything reached a live column family
    pub has_valid_writes: bool,
}

/// Apply every writer of a group with a single inserter
pub fn insert_group_into<M: ColumnFamilyMemTables>(
    writers: &mut [Writer<'_>],
    memtables: M,
    flush_scheduler: Option<&FlushScheduler>,
    options: ApplyOptions,
    db: Option<&dyn EngineContext>,
) -> BatchResult<()> {
    let first_sequence = writers.first().map_or(0, |w| w.sequence);
    let mut inserter = inserter_for(first_sequence, memtables, flush_scheduler, options, db);
    let mut first_error = None;

    for writer in writers.iter_mut() {
        if !writer.should_write_to_memtable() {
            continue;
        }
        inserter.set_sequence(writer.sequence);
        inserter.set_log_number_ref(writer.log_ref);
        if let Err(e) = writer.batch.iterate(&mut inserter) {
            tracing::debug!(sequence = writer.sequence, error = %e, "Write group member failed");
            writer.status = Some(e.clone());
            if options.error_policy == ErrorPolicy::Abort {
                return Err(e);
            }
            first_error.get_or_insert(e);
        }
    }
    inserter.set_log_number_ref(0);

    tracing::trace!(
        writers = writers.len(),
        first_sequence,
        next_sequence = inserter.sequence(),
        "Applied write group"
    );
    first_error.map_or(Ok(()), Err)
}

/// Apply a single writer with its own inserter. In concurrent mode the
/// deferred memtable counters are flushed before returning.
pub fn insert_writer_into<M: ColumnFamilyMemTables>(
    writer: &mut Writer<'_>,
    memtables: M,
    flush_scheduler: Option<&FlushScheduler>,
    options: ApplyOptions,
    db: Option<&dyn EngineContext>,
) -> BatchResult<()> {
    if !writer.should_write_to_memtable() {
        return Ok(());
    }
    let mut inserter = inserter_for(writer.sequence, memtables, flush_scheduler, options, db);
    inserter.set_log_number_ref(writer.log_ref);

    let result = writer.batch.iterate(&mut inserter);
    inserter.post_process();
    if let Err(e) = &result {
        writer.status = Some(e.clone());
    }
    result
}

/// Apply a batch starting at the sequence number in its header.
///
/// The outcome is reported even when the batch fails part way: records
/// before the failure are already in the memtables and their sequence
/// numbers are spent.
pub fn insert_batch_into<M: ColumnFamilyMemTables>(
    batch: &WriteBatch,
    memtables: M,
    flush_scheduler: Option<&FlushScheduler>,
    options: ApplyOptions,
    db: Option<&dyn EngineContext>,
) -> (InsertOutcome, BatchResult<()>) {
    let mut inserter = inserter_for(batch.sequence(), memtables, flush_scheduler, options, db);
    let result = batch.iterate(&mut inserter);
    inserter.post_process();
    let outcome = InsertOutcome {
        last_sequence: inserter.sequence().saturating_sub(1),
        has_valid_writes: inserter.has_valid_writes(),
    };
    (outcome, result)
}

fn inserter_for<'a, M: ColumnFamilyMemTables>(
    sequence: SequenceNumber,
    memtables: M,
    flush_scheduler: Option<&'a FlushScheduler>,
    options: ApplyOptions,
    db: Option<&'a dyn EngineContext>,
) -> MemTableInserter<'a, M> {
    let mut inserter = MemTableInserter::new(sequence, memtables, options);
    if let Some(scheduler) = flush_scheduler {
        inserter = inserter.with_flush_scheduler(scheduler);
    }
    if let Some(db) = db {
        inserter = inserter.with_db(db);
    }
    inserter
}

/// Owner of the engine's last allocated sequence number
#[derive(Debug, Default)]
pub struct WriteGroupSequencer {
    last_sequence: AtomicU64,
}

impl WriteGroupSequencer {
    pub fn new(last_sequence: SequenceNumber) -> Self {
        Self {
            last_sequence: AtomicU64::new(last_sequence),
        }
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Move the counter forward to at least `sequence`, as after log replay
    pub fn advance_to(&self, sequence: SequenceNumber) {
        self.last_sequence.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Reserve sequence numbers for the memtable-bound writers of a group.
    /// Each such writer starts right after the previous one's last record.
    /// Writers skipped by memtable insertion get the next start but consume
    /// nothing. Returns the group's last sequence number.
    pub fn assign(&self, writers: &mut [Writer<'_>]) -> SequenceNumber {
        let total: u64 = writers
            .iter()
            .filter(|w| w.should_write_to_memtable())
            .map(|w| u64::from(w.batch.count()))
            .sum();
        let last = self.last_sequence.fetch_add(total, Ordering::AcqRel);

        let mut next = last + 1;
        for writer in writers.iter_mut() {
            writer.sequence = next;
            if writer.should_write_to_memtable() {
                next += u64::from(writer.batch.count());
            }
        }
        last + total
    }

    /// Assign sequence numbers and apply the group to the memtables.
    ///
    /// With concurrent memtable writes each writer gets its own inserter
    /// over a clone of `memtables`; otherwise one inserter drives the group.
    pub fn apply<M: ColumnFamilyMemTables + Clone>(
        &self,
        writers: &mut [Writer<'_>],
        memtables: M,
        flush_scheduler: Option<&FlushScheduler>,
        options: ApplyOptions,
        db: Option<&dyn EngineContext>,
    ) -> BatchResult<SequenceNumber> {
        let last = self.assign(writers);

        if !options.concurrent_memtable_writes {
            insert_group_into(writers, memtables, flush_scheduler, options, db)?;
            return Ok(last);
        }

        let mut first_error = None;
        for writer in writers.iter_mut() {
            if let Err(e) =
                insert_writer_into(writer, memtables.clone(), flush_scheduler, options, db)
            {
                if options.error_policy == ErrorPolicy::Abort {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(last), Err)
    }
}
