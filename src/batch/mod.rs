//! Write batch subsystem
//!
//! A write batch is the unit of atomic mutation:
//! - Binary record format with a fixed 12-byte header
//! - Savepoints for partial rollback before the batch is applied
//! - Two-phase-commit markers for prepared transactions
//! - Handler-based iteration that rejects corrupt or miscounted buffers

pub mod coding;
pub mod error;
pub mod handler;
pub mod record;
pub mod savepoint;
pub mod write_batch;

pub use error::{BatchError, BatchResult};
pub use handler::{iterate, ContentClassifier, Handler};
pub use record::{read_key_from_entry, OpKind, Record, Tag};
pub use savepoint::{SavePoint, SavePoints};
pub use write_batch::{appended_byte_size, ContentFlags, SequenceNumber, WriteBatch, HEADER_SIZE};
