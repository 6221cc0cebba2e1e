//! RooBatch - write batches and the memtable apply engine of an embedded
//! key-value store
//!
//! Features:
//! - Compact tagged record format with a 12-byte header
//! - Savepoints and two-phase-commit markers
//! - Sequence-ordered application to per-column-family memtables
//! - Log replay that rebuilds prepared transactions

pub mod apply;
pub mod batch;
pub mod db;
pub mod storage;

pub use apply::{ApplyOptions, EngineContext, ErrorPolicy, MemTableInserter, Writer};
pub use batch::{BatchError, BatchResult, Handler, Record, SequenceNumber, WriteBatch};
pub use db::{DbOptions, MemDb};
