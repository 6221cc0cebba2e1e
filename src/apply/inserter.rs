//! Memtable inserter
//!
//! A [`Handler`] that applies decoded records to the memtables of the column
//! families they name. Every counted record consumes exactly one sequence
//! number, whether or not it reached a memtable, so the memtable stream stays
//! aligned with the log.
//!
//! During recovery the inserter also rebuilds prepared transactions: records
//! between BeginPrepare and EndPrepare are collected into a batch and parked
//! in the engine's recovered transaction table until a Commit replays them
//! or a Rollback discards them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::apply::options::{ApplyOptions, EngineContext};
use crate::batch::{BatchError, BatchResult, Handler, Record, SequenceNumber, WriteBatch};
use crate::storage::{
    ColumnFamilyData, ColumnFamilyMemTables, EntryKind, FlushScheduler, MemTable,
    MemTablePostProcessInfo, UpdateStatus,
};

type Target = (Arc<ColumnFamilyData>, Arc<MemTable>);

/// Applies batch records to memtables
pub struct MemTableInserter<'a, M> {
    sequence: SequenceNumber,
    cf_mems: M,
    flush_scheduler: Option<&'a FlushScheduler>,
    db: Option<&'a dyn EngineContext>,
    options: ApplyOptions,
    /// Log holding the prepared section being applied (0 = none)
    log_number_ref: u64,
    has_valid_writes: bool,
    /// Prepared section being rebuilt during recovery
    rebuilding_trx: Option<WriteBatch>,
    /// Deferred memtable counters, keyed by memtable id (concurrent mode only)
    post_info: Option<HashMap<u64, (Arc<MemTable>, MemTablePostProcessInfo)>>,
}

impl<'a, M: ColumnFamilyMemTables> MemTableInserter<'a, M> {
    pub fn new(sequence: SequenceNumber, cf_mems: M, options: ApplyOptions) -> Self {
        Self {
            sequence,
            cf_mems,
            flush_scheduler: None,
            db: None,
            options,
            log_number_ref: 0,
            has_valid_writes: false,
            rebuilding_trx: None,
            post_info: None,
        }
    }

    pub fn with_flush_scheduler(mut self, scheduler: &'a FlushScheduler) -> Self {
        self.flush_scheduler = Some(scheduler);
        self
    }

    pub fn with_db(mut self, db: &'a dyn EngineContext) -> Self {
        self.db = Some(db);
        self
    }

    /// Sequence number the next counted record will receive
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
    }

    pub fn set_log_number_ref(&mut self, log_number: u64) {
        self.log_number_ref = log_number;
    }

    /// True once any record reached a live column family or a prepared
    /// section was processed
    pub fn has_valid_writes(&self) -> bool {
        self.has_valid_writes
    }

    /// Apply counters deferred during concurrent inserts
    pub fn post_process(&mut self) {
        if let Some(post_info) = self.post_info.take() {
            for (mem, info) in post_info.values() {
                mem.batch_post_process(info);
            }
        }
    }

    // ============ Column family resolution ============

    /// Position on `cf`. `Ok(None)` means the record is skipped.
    fn seek_to_column_family(&mut self, cf: u32) -> BatchResult<Option<Target>> {
        if !self.cf_mems.seek(cf) {
            if self.options.ignore_missing_column_families {
                tracing::debug!(cf, "Skipping record for missing column family");
                return Ok(None);
            }
            return Err(BatchError::InvalidArgument(
                "Invalid column family specified in write batch".to_string(),
            ));
        }

        let recovering = self.options.recovering_log_number;
        if recovering != 0 && recovering < self.cf_mems.log_number() {
            tracing::trace!(
                cf,
                log = recovering,
                cf_log = self.cf_mems.log_number(),
                "Column family already holds this log, skipping record"
            );
            return Ok(None);
        }

        let (Some(cfd), Some(mem)) = (self.cf_mems.current().cloned(), self.cf_mems.memtable())
        else {
            return Err(BatchError::InvalidArgument(
                "Invalid column family specified in write batch".to_string(),
            ));
        };

        self.has_valid_writes = true;
        if self.log_number_ref > 0 {
            mem.ref_log_containing_prep_section(self.log_number_ref);
        }
        Ok(Some((cfd, mem)))
    }

    /// Resolve the record's target; a skipped or failed record still
    /// consumes its sequence number
    fn target(&mut self, cf: u32) -> BatchResult<Option<Target>> {
        match self.seek_to_column_family(cf) {
            Ok(Some(target)) => Ok(Some(target)),
            other => {
                self.sequence += 1;
                other
            }
        }
    }

    fn finish(&mut self, cfd: &Arc<ColumnFamilyData>, mem: &MemTable) {
        self.sequence += 1;
        self.check_memtable_full(cfd, mem);
    }

    fn check_memtable_full(&self, cfd: &Arc<ColumnFamilyData>, mem: &MemTable) {
        if let Some(scheduler) = self.flush_scheduler {
            if mem.should_schedule_flush() && mem.mark_flush_scheduled() {
                scheduler.schedule_flush(cfd.clone());
            }
        }
    }

    fn post_info_for(&mut self, mem: &Arc<MemTable>) -> Option<&mut MemTablePostProcessInfo> {
        if !self.options.concurrent_memtable_writes {
            return None;
        }
        let map = self.post_info.get_or_insert_with(HashMap::new);
        let (_, info) = map
            .entry(mem.id())
            .or_insert_with(|| (mem.clone(), MemTablePostProcessInfo::default()));
        Some(info)
    }

    /// Engine usable for reads, if any. Recovery never reads.
    fn live_db(&self) -> Option<&'a dyn EngineContext> {
        self.db.filter(|_| !self.options.is_recovering())
    }

    // ============ Data records ============

    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> BatchResult<()> {
        if let Some(trx) = self.rebuilding_trx.as_mut() {
            return trx.put_cf(cf, key, value);
        }
        let Some((cfd, mem)) = self.target(cf)? else {
            return Ok(());
        };

        let sequence = self.sequence;
        let options = mem.options();
        if !options.inplace_update_support {
            let post_info = self.post_info_for(&mem);
            mem.add(sequence, EntryKind::Value, key, value, post_info);
        } else if options.inplace_callback.is_none() {
            mem.update(sequence, key, value);
        } else if !mem.update_callback(sequence, key, value) {
            self.put_with_lookup(&cfd, &mem, key, value);
        }

        self.finish(&cfd, &mem);
        Ok(())
    }

    /// The key has no value in the memtable: read it from the engine, run the
    /// callback over the result and insert what it produced
    fn put_with_lookup(&self, cfd: &ColumnFamilyData, mem: &MemTable, key: &[u8], delta: &[u8]) {
        let Some(callback) = mem.options().inplace_callback.clone() else {
            return;
        };

        let mut prev = self
            .live_db()
            .and_then(|db| db.get(cfd, key, self.sequence).ok().flatten());
        let mut merged = Vec::new();
        match callback(prev.as_mut(), delta, &mut merged) {
            UpdateStatus::UpdatedInplace => {
                if let Some(prev) = prev {
                    mem.add(self.sequence, EntryKind::Value, key, &prev, None);
                }
            }
            UpdateStatus::Updated => {
                mem.add(self.sequence, EntryKind::Value, key, &merged, None);
            }
            UpdateStatus::Failed => {}
        }
    }

    fn delete(&mut self, kind: EntryKind, cf: u32, key: &[u8]) -> BatchResult<()> {
        if let Some(trx) = self.rebuilding_trx.as_mut() {
            return match kind {
                EntryKind::SingleDeletion => trx.single_delete_cf(cf, key),
                _ => trx.delete_cf(cf, key),
            };
        }
        let Some((cfd, mem)) = self.target(cf)? else {
            return Ok(());
        };

        let sequence = self.sequence;
        let post_info = self.post_info_for(&mem);
        mem.add(sequence, kind, key, b"", post_info);
        self.finish(&cfd, &mem);
        Ok(())
    }

    fn delete_range(&mut self, cf: u32, begin_key: &[u8], end_key: &[u8]) -> BatchResult<()> {
        if let Some(trx) = self.rebuilding_trx.as_mut() {
            return trx.delete_range_cf(cf, begin_key, end_key);
        }
        let Some((cfd, mem)) = self.target(cf)? else {
            return Ok(());
        };

        if !cfd.is_delete_range_supported() {
            self.sequence += 1;
            return Err(BatchError::NotSupported(format!(
                "DeleteRange not supported for table type {} in column family {}",
                cfd.table_format().name(),
                cfd.name()
            )));
        }

        let sequence = self.sequence;
        let post_info = self.post_info_for(&mem);
        mem.add(sequence, EntryKind::RangeDeletion, begin_key, end_key, post_info);
        self.finish(&cfd, &mem);
        Ok(())
    }

    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> BatchResult<()> {
        if self.options.concurrent_memtable_writes {
            self.sequence += 1;
            return Err(BatchError::NotSupported(
                "Merge not supported with concurrent memtable writes".to_string(),
            ));
        }
        if let Some(trx) = self.rebuilding_trx.as_mut() {
            return trx.merge_cf(cf, key, value);
        }
        let Some((cfd, mem)) = self.target(cf)? else {
            return Ok(());
        };

        match self.fold_successive_merges(&cfd, &mem, key, value) {
            Some(resolved) => mem.add(self.sequence, EntryKind::Value, key, &resolved, None),
            None => mem.add(self.sequence, EntryKind::Merge, key, value, None),
        }
        self.finish(&cfd, &mem);
        Ok(())
    }

    /// Once the key has `max_successive_merges` pending operands, read the
    /// current value and fold the new operand into it. `None` keeps the
    /// operand as a plain merge entry.
    fn fold_successive_merges(
        &self,
        cfd: &ColumnFamilyData,
        mem: &MemTable,
        key: &[u8],
        operand: &[u8],
    ) -> Option<Vec<u8>> {
        let options = mem.options();
        if options.max_successive_merges == 0 {
            return None;
        }
        let db = self.live_db()?;
        if mem.count_successive_merge_operands(key, self.sequence) < options.max_successive_merges {
            return None;
        }
        let operator = options.merge_operator.as_ref()?;

        let existing = match db.get(cfd, key, self.sequence) {
            Ok(existing) => existing,
            Err(e) => {
                tracing::debug!(error = %e, "Read before merge failed, storing operand");
                return None;
            }
        };
        match operator.full_merge(key, existing.as_deref(), &[operand]) {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                tracing::warn!(
                    operator = operator.name(),
                    error = %e,
                    "Merge operator failed, storing operand"
                );
                None
            }
        }
    }

    // ============ Two-phase commit markers ============

    fn mark_begin_prepare(&mut self) -> BatchResult<()> {
        if !self.options.is_recovering() {
            return Ok(());
        }
        if !self.db.is_some_and(|db| db.allow_2pc()) {
            return Err(BatchError::NotSupported(
                "log contains prepared transactions but two-phase commit is disabled".to_string(),
            ));
        }
        if self.rebuilding_trx.is_some() {
            return Err(BatchError::corruption("nested BeginPrepare in log"));
        }
        self.rebuilding_trx = Some(WriteBatch::new());
        self.has_valid_writes = true;
        Ok(())
    }

    fn mark_end_prepare(&mut self, xid: &[u8]) -> BatchResult<()> {
        if !self.options.is_recovering() {
            return Ok(());
        }
        let Some(batch) = self.rebuilding_trx.take() else {
            return Err(BatchError::corruption("EndPrepare without BeginPrepare"));
        };
        let Some(db) = self.db else {
            return Err(BatchError::NotSupported(
                "no engine to hold recovered transactions".to_string(),
            ));
        };

        let xid = String::from_utf8_lossy(xid).into_owned();
        let log = self.options.recovering_log_number;
        tracing::info!(xid = %xid, log, records = batch.count(), "Recovered prepared transaction");
        db.recovered_transactions().insert(xid, log, batch);
        Ok(())
    }

    fn mark_commit(&mut self, xid: &[u8]) -> BatchResult<()> {
        if !self.options.is_recovering() {
            return Ok(());
        }
        let Some(db) = self.db else {
            return Ok(());
        };

        let xid = String::from_utf8_lossy(xid).into_owned();
        let Some(trx) = db.recovered_transactions().get(&xid) else {
            tracing::debug!(xid = %xid, "Commit for unknown transaction, already persisted");
            return Ok(());
        };

        let saved_ref = std::mem::replace(&mut self.log_number_ref, trx.log_number);
        let result = trx.batch.iterate(self);
        self.log_number_ref = saved_ref;
        result?;

        db.recovered_transactions().remove(&xid);
        self.has_valid_writes = true;
        tracing::info!(xid = %xid, log = trx.log_number, "Committed recovered transaction");
        Ok(())
    }

    fn mark_rollback(&mut self, xid: &[u8]) -> BatchResult<()> {
        if !self.options.is_recovering() {
            return Ok(());
        }
        if let Some(db) = self.db {
            let xid = String::from_utf8_lossy(xid);
            if db.recovered_transactions().remove(&xid).is_some() {
                tracing::info!(xid = %xid, "Rolled back recovered transaction");
            } else {
                tracing::debug!(xid = %xid, "Rollback for unknown transaction");
            }
        }
        Ok(())
    }
}

impl<M: ColumnFamilyMemTables> Handler for MemTableInserter<'_, M> {
    fn handle(&mut self, record: Record<'_>) -> BatchResult<()> {
        match record {
            Record::Put { cf, key, value } => self.put(cf, key, value),
            Record::Delete { cf, key } => self.delete(EntryKind::Deletion, cf, key),
            Record::SingleDelete { cf, key } => self.delete(EntryKind::SingleDeletion, cf, key),
            Record::DeleteRange {
                cf,
                begin_key,
                end_key,
            } => self.delete_range(cf, begin_key, end_key),
            Record::Merge { cf, key, value } => self.merge(cf, key, value),
            Record::LogData { .. } | Record::Noop => Ok(()),
            Record::BeginPrepare => self.mark_begin_prepare(),
            Record::EndPrepare { xid } => self.mark_end_prepare(xid),
            Record::Commit { xid } => self.mark_commit(xid),
            Record::Rollback { xid } => self.mark_rollback(xid),
        }
    }
}
