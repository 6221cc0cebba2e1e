//! Write batch: a serialized, ordered group of mutations
//!
//! Buffer layout:
//! ```text
//! +-------------------+-------------+---------------------+
//! | Sequence (fixed64)| Count (u32) | Records ...         |
//! |      8 bytes      |   4 bytes   | tag-delimited       |
//! +-------------------+-------------+---------------------+
//! ```
//!
//! The header sequence is the sequence number of the first counted record.
//! Count covers Put, Delete, SingleDelete, DeleteRange and Merge records
//! only; LogData, Noop and the two-phase-commit markers are not counted.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::batch::coding::{
    decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64, put_length_prefixed_slice,
    put_length_prefixed_slice_parts, put_varint32,
};
use crate::batch::error::{BatchError, BatchResult};
use crate::batch::handler::{self, ContentClassifier, Handler};
use crate::batch::record::{OpKind, Tag};
use crate::batch::savepoint::{SavePoint, SavePoints};

/// Header size in bytes: fixed64 sequence + fixed32 count
pub const HEADER_SIZE: usize = 12;

/// Global mutation order and snapshot visibility
pub type SequenceNumber = u64;

bitflags! {
    /// Which kinds of records a batch holds
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContentFlags: u32 {
        /// Flags are stale and must be recomputed by a scan
        const DEFERRED = 1 << 0;
        const HAS_PUT = 1 << 1;
        const HAS_DELETE = 1 << 2;
        const HAS_SINGLE_DELETE = 1 << 3;
        const HAS_MERGE = 1 << 4;
        const HAS_BEGIN_PREPARE = 1 << 5;
        const HAS_END_PREPARE = 1 << 6;
        const HAS_COMMIT = 1 << 7;
        const HAS_ROLLBACK = 1 << 8;
        const HAS_DELETE_RANGE = 1 << 9;
    }
}

/// A key or value given either whole or as scattered parts
#[derive(Clone, Copy)]
enum Field<'a> {
    Slice(&'a [u8]),
    Parts(&'a [&'a [u8]]),
}

impl Field<'_> {
    fn put_length_prefixed(self, dst: &mut Vec<u8>) {
        match self {
            Field::Slice(value) => put_length_prefixed_slice(dst, value),
            Field::Parts(parts) => put_length_prefixed_slice_parts(dst, parts),
        }
    }
}

/// Serialized batch of mutations
#[derive(Debug)]
pub struct WriteBatch {
    rep: Vec<u8>,
    /// Cached content flags; `DEFERRED` until the first scan of a batch built from raw bytes
    content_flags: AtomicU32,
    save_points: SavePoints,
    wal_term_point: Option<SavePoint>,
    /// 0 = unlimited
    max_bytes: usize,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::with_capacity(0, 0)
    }

    /// Create an empty batch reserving `reserved_bytes` and refusing to grow
    /// past `max_bytes` (0 = unlimited)
    pub fn with_capacity(reserved_bytes: usize, max_bytes: usize) -> Self {
        let mut rep = Vec::with_capacity(reserved_bytes.max(HEADER_SIZE));
        rep.resize(HEADER_SIZE, 0);
        Self {
            rep,
            content_flags: AtomicU32::new(0),
            save_points: SavePoints::new(),
            wal_term_point: None,
            max_bytes,
        }
    }

    /// Wrap a previously serialized batch. Content flags are computed lazily.
    pub fn from_bytes(rep: Vec<u8>) -> BatchResult<Self> {
        if rep.len() < HEADER_SIZE {
            return Err(BatchError::corruption("malformed WriteBatch (too small)"));
        }
        Ok(Self {
            rep,
            content_flags: AtomicU32::new(ContentFlags::DEFERRED.bits()),
            save_points: SavePoints::new(),
            wal_term_point: None,
            max_bytes: 0,
        })
    }

    /// Replace the buffer with `contents`, dropping savepoints and the WAL
    /// termination point. Content flags are computed lazily.
    pub fn set_contents(&mut self, contents: &[u8]) -> BatchResult<()> {
        if contents.len() < HEADER_SIZE {
            return Err(BatchError::corruption("malformed WriteBatch (too small)"));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        self.store_flags(ContentFlags::DEFERRED);
        self.save_points.clear();
        self.wal_term_point = None;
        Ok(())
    }

    /// Raw serialized bytes, header included
    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    pub fn into_data(self) -> Vec<u8> {
        self.rep
    }

    /// Serialized size, header included
    pub fn data_size(&self) -> usize {
        self.rep.len()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of counted records, as stored in the header
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep, 8).unwrap_or(0)
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        encode_fixed32(&mut self.rep, 8, count);
    }

    /// Sequence number of the first counted record
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep, 0).unwrap_or(0)
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        encode_fixed64(&mut self.rep, 0, sequence);
    }

    /// Drop every record, savepoint and the WAL termination point
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
        self.store_flags(ContentFlags::empty());
        self.save_points.clear();
        self.wal_term_point = None;
    }

    /// Decode the record stream into `handler`
    pub fn iterate<H: Handler + ?Sized>(&self, handler: &mut H) -> BatchResult<()> {
        handler::iterate(&self.rep, handler)
    }

    // ============ Data records ============

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> BatchResult<()> {
        self.put_cf(0, key, value)
    }

    pub fn put_cf(&mut self, column_family_id: u32, key: &[u8], value: &[u8]) -> BatchResult<()> {
        self.add_record(
            OpKind::Put,
            column_family_id,
            &[Field::Slice(key), Field::Slice(value)],
        )
    }

    pub fn put_parts(&mut self, key: &[&[u8]], value: &[&[u8]]) -> BatchResult<()> {
        self.put_cf_parts(0, key, value)
    }

    pub fn put_cf_parts(
        &mut self,
        column_family_id: u32,
        key: &[&[u8]],
        value: &[&[u8]],
    ) -> BatchResult<()> {
        self.add_record(
            OpKind::Put,
            column_family_id,
            &[Field::Parts(key), Field::Parts(value)],
        )
    }

    pub fn delete(&mut self, key: &[u8]) -> BatchResult<()> {
        self.delete_cf(0, key)
    }

    pub fn delete_cf(&mut self, column_family_id: u32, key: &[u8]) -> BatchResult<()> {
        self.add_record(OpKind::Delete, column_family_id, &[Field::Slice(key)])
    }

    pub fn delete_parts(&mut self, key: &[&[u8]]) -> BatchResult<()> {
        self.delete_cf_parts(0, key)
    }

    pub fn delete_cf_parts(&mut self, column_family_id: u32, key: &[&[u8]]) -> BatchResult<()> {
        self.add_record(OpKind::Delete, column_family_id, &[Field::Parts(key)])
    }

    pub fn single_delete(&mut self, key: &[u8]) -> BatchResult<()> {
        self.single_delete_cf(0, key)
    }

    pub fn single_delete_cf(&mut self, column_family_id: u32, key: &[u8]) -> BatchResult<()> {
        self.add_record(OpKind::SingleDelete, column_family_id, &[Field::Slice(key)])
    }

    pub fn single_delete_parts(&mut self, key: &[&[u8]]) -> BatchResult<()> {
        self.single_delete_cf_parts(0, key)
    }

    pub fn single_delete_cf_parts(
        &mut self,
        column_family_id: u32,
        key: &[&[u8]],
    ) -> BatchResult<()> {
        self.add_record(OpKind::SingleDelete, column_family_id, &[Field::Parts(key)])
    }

    /// Delete every key in `[begin_key, end_key)`
    pub fn delete_range(&mut self, begin_key: &[u8], end_key: &[u8]) -> BatchResult<()> {
        self.delete_range_cf(0, begin_key, end_key)
    }

    pub fn delete_range_cf(
        &mut self,
        column_family_id: u32,
        begin_key: &[u8],
        end_key: &[u8],
    ) -> BatchResult<()> {
        self.add_record(
            OpKind::DeleteRange,
            column_family_id,
            &[Field::Slice(begin_key), Field::Slice(end_key)],
        )
    }

    pub fn delete_range_parts(&mut self, begin_key: &[&[u8]], end_key: &[&[u8]]) -> BatchResult<()> {
        self.delete_range_cf_parts(0, begin_key, end_key)
    }

    pub fn delete_range_cf_parts(
        &mut self,
        column_family_id: u32,
        begin_key: &[&[u8]],
        end_key: &[&[u8]],
    ) -> BatchResult<()> {
        self.add_record(
            OpKind::DeleteRange,
            column_family_id,
            &[Field::Parts(begin_key), Field::Parts(end_key)],
        )
    }

    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> BatchResult<()> {
        self.merge_cf(0, key, value)
    }

    pub fn merge_cf(&mut self, column_family_id: u32, key: &[u8], value: &[u8]) -> BatchResult<()> {
        self.add_record(
            OpKind::Merge,
            column_family_id,
            &[Field::Slice(key), Field::Slice(value)],
        )
    }

    pub fn merge_parts(&mut self, key: &[&[u8]], value: &[&[u8]]) -> BatchResult<()> {
        self.merge_cf_parts(0, key, value)
    }

    pub fn merge_cf_parts(
        &mut self,
        column_family_id: u32,
        key: &[&[u8]],
        value: &[&[u8]],
    ) -> BatchResult<()> {
        self.add_record(
            OpKind::Merge,
            column_family_id,
            &[Field::Parts(key), Field::Parts(value)],
        )
    }

    /// Append an opaque blob. Not counted and ignored by replay.
    pub fn put_log_data(&mut self, blob: &[u8]) -> BatchResult<()> {
        let mut save = LocalSavePoint::new(self);
        save.batch.rep.push(Tag::LogData as u8);
        put_length_prefixed_slice(&mut save.batch.rep, blob);
        save.commit()
    }

    fn add_record(&mut self, op: OpKind, column_family_id: u32, fields: &[Field<'_>]) -> BatchResult<()> {
        let mut save = LocalSavePoint::new(self);
        let batch = &mut *save.batch;

        let count = batch.count();
        batch.set_count(count.wrapping_add(1));
        if column_family_id == 0 {
            batch.rep.push(op.plain_tag() as u8);
        } else {
            batch.rep.push(op.column_family_tag() as u8);
            put_varint32(&mut batch.rep, column_family_id);
        }
        for field in fields {
            field.put_length_prefixed(&mut batch.rep);
        }
        batch.add_flags(op.content_flag());

        save.commit()
    }

    // ============ Content flags ============

    fn load_flags(&self) -> ContentFlags {
        ContentFlags::from_bits_retain(self.content_flags.load(Ordering::Relaxed))
    }

    fn store_flags(&self, flags: ContentFlags) {
        self.content_flags.store(flags.bits(), Ordering::Relaxed);
    }

    fn add_flags(&self, flags: ContentFlags) {
        self.content_flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    /// Content flags, scanning the buffer once if they are deferred
    pub fn compute_content_flags(&self) -> ContentFlags {
        let flags = self.load_flags();
        if !flags.contains(ContentFlags::DEFERRED) {
            return flags;
        }

        let mut classifier = ContentClassifier::default();
        if let Err(e) = self.iterate(&mut classifier) {
            tracing::debug!(error = %e, "content scan ended early");
        }
        self.store_flags(classifier.content_flags);
        classifier.content_flags
    }

    pub fn has_put(&self) -> bool {
        self.compute_content_flags().contains(ContentFlags::HAS_PUT)
    }

    pub fn has_delete(&self) -> bool {
        self.compute_content_flags().contains(ContentFlags::HAS_DELETE)
    }

    pub fn has_single_delete(&self) -> bool {
        self.compute_content_flags()
            .contains(ContentFlags::HAS_SINGLE_DELETE)
    }

    pub fn has_delete_range(&self) -> bool {
        self.compute_content_flags()
            .contains(ContentFlags::HAS_DELETE_RANGE)
    }

    pub fn has_merge(&self) -> bool {
        self.compute_content_flags().contains(ContentFlags::HAS_MERGE)
    }

    pub fn has_begin_prepare(&self) -> bool {
        self.compute_content_flags()
            .contains(ContentFlags::HAS_BEGIN_PREPARE)
    }

    pub fn has_end_prepare(&self) -> bool {
        self.compute_content_flags()
            .contains(ContentFlags::HAS_END_PREPARE)
    }

    pub fn has_commit(&self) -> bool {
        self.compute_content_flags().contains(ContentFlags::HAS_COMMIT)
    }

    pub fn has_rollback(&self) -> bool {
        self.compute_content_flags().contains(ContentFlags::HAS_ROLLBACK)
    }

    // ============ Savepoints ============

    fn snapshot(&self) -> SavePoint {
        SavePoint::new(self.rep.len(), self.count(), self.load_flags())
    }

    fn restore(&mut self, save_point: &SavePoint) {
        self.rep.truncate(save_point.size);
        self.set_count(save_point.count);
        self.store_flags(save_point.content_flags);
        if self
            .wal_term_point
            .is_some_and(|point| point.size > save_point.size)
        {
            self.wal_term_point = None;
        }
    }

    /// Remember the current size, count and flags
    pub fn set_savepoint(&mut self) {
        let save_point = self.snapshot();
        self.save_points.push(save_point);
    }

    /// Undo everything appended since the most recent savepoint and pop it
    pub fn rollback_to_savepoint(&mut self) -> BatchResult<()> {
        let save_point = self
            .save_points
            .pop()
            .ok_or_else(|| BatchError::NotFound("no savepoint to roll back to".to_string()))?;

        debug_assert!(save_point.size <= self.rep.len());

        if save_point.size == self.rep.len() {
            // nothing appended since
        } else if save_point.size == HEADER_SIZE {
            self.clear();
        } else {
            self.restore(&save_point);
        }
        Ok(())
    }

    /// Discard the most recent savepoint without touching the buffer
    pub fn pop_savepoint(&mut self) -> BatchResult<()> {
        self.save_points
            .pop()
            .map(|_| ())
            .ok_or_else(|| BatchError::NotFound("no savepoint to pop".to_string()))
    }

    pub fn savepoint_count(&self) -> usize {
        self.save_points.len()
    }

    // ============ WAL termination point ============

    /// Mark the current contents as the prefix that goes to the durable log
    pub fn mark_wal_termination_point(&mut self) {
        self.wal_term_point = Some(self.snapshot());
    }

    pub fn wal_termination_point(&self) -> Option<&SavePoint> {
        self.wal_term_point.as_ref()
    }

    /// Append the records of `src` to this batch.
    ///
    /// With `wal_only`, only the prefix up to `src`'s WAL termination point is
    /// taken (the whole batch if no point is marked).
    pub fn append(&mut self, src: &WriteBatch, wal_only: bool) -> BatchResult<()> {
        let (src_len, src_count, src_flags) = match (wal_only, src.wal_term_point.as_ref()) {
            (true, Some(point)) => (point.size, point.count, point.content_flags),
            _ => (src.rep.len(), src.count(), src.load_flags()),
        };
        let records = src
            .rep
            .get(HEADER_SIZE..src_len)
            .ok_or_else(|| {
                BatchError::corruption("WriteBatch termination point past end of batch")
            })?;

        let mut save = LocalSavePoint::new(self);
        let count = save.batch.count();
        save.batch.set_count(count.wrapping_add(src_count));
        save.batch.rep.extend_from_slice(records);
        save.batch.add_flags(src_flags);
        save.commit()
    }

    // ============ Two-phase commit markers ============

    /// Reserve the prepare slot. Called on an empty batch so the placeholder
    /// lands right after the header.
    pub fn insert_noop(&mut self) {
        self.rep.push(Tag::Noop as u8);
    }

    fn prepare_slot_reserved(&self) -> bool {
        self.rep.get(HEADER_SIZE) == Some(&(Tag::Noop as u8))
    }

    /// Seal the prepared section under `xid`.
    ///
    /// Rewrites the reserved slot to BeginPrepare and appends EndPrepare.
    /// All savepoints are dropped: a sealed section cannot be partially
    /// rolled back.
    ///
    /// # Panics
    /// If the slot after the header does not hold the placeholder written by
    /// [`insert_noop`](Self::insert_noop). A batch holds at most one prepared
    /// section.
    pub fn mark_end_prepare(&mut self, xid: &[u8]) {
        assert!(
            self.prepare_slot_reserved(),
            "mark_end_prepare requires the placeholder from insert_noop at offset {}",
            HEADER_SIZE
        );
        self.save_points.clear();
        self.rep[HEADER_SIZE] = Tag::BeginPrepareXid as u8;
        self.rep.push(Tag::EndPrepareXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(ContentFlags::HAS_BEGIN_PREPARE | ContentFlags::HAS_END_PREPARE);
    }

    pub fn mark_commit(&mut self, xid: &[u8]) {
        self.rep.push(Tag::CommitXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(ContentFlags::HAS_COMMIT);
    }

    pub fn mark_rollback(&mut self, xid: &[u8]) {
        self.rep.push(Tag::RollbackXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(ContentFlags::HAS_ROLLBACK);
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WriteBatch {
    fn clone(&self) -> Self {
        Self {
            rep: self.rep.clone(),
            content_flags: AtomicU32::new(self.content_flags.load(Ordering::Relaxed)),
            save_points: self.save_points.clone(),
            wal_term_point: self.wal_term_point,
            max_bytes: self.max_bytes,
        }
    }
}

/// Size of the batch obtained by appending one serialized batch to another
pub fn appended_byte_size(left: usize, right: usize) -> usize {
    if left == 0 || right == 0 {
        left + right
    } else {
        left + right - HEADER_SIZE
    }
}

/// Rolls an in-progress append back on drop unless committed
struct LocalSavePoint<'a> {
    batch: &'a mut WriteBatch,
    saved: SavePoint,
    committed: bool,
}

impl<'a> LocalSavePoint<'a> {
    fn new(batch: &'a mut WriteBatch) -> Self {
        let saved = batch.snapshot();
        Self {
            batch,
            saved,
            committed: false,
        }
    }

    fn commit(mut self) -> BatchResult<()> {
        let size = self.batch.rep.len();
        let max = self.batch.max_bytes;
        if max != 0 && size > max {
            return Err(BatchError::MemoryLimit { size, max });
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for LocalSavePoint<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let saved = self.saved;
            self.batch.restore(&saved);
        }
    }
}
