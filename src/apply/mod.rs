//! Batch application
//!
//! Turns decoded batch records into memtable entries:
//! - [`MemTableInserter`] applies records and rebuilds prepared transactions
//! - Write groups assign contiguous sequence ranges and drive the inserter
//! - [`RecoveredTransactionTable`] parks prepared sections found in the log

pub mod inserter;
pub mod options;
pub mod recovered;
pub mod write_group;

pub use inserter::MemTableInserter;
pub use options::{ApplyOptions, EngineContext, ErrorPolicy};
pub use recovered::{RecoveredTransaction, RecoveredTransactionTable};
pub use write_group::{
    insert_batch_into, insert_group_into, insert_writer_into, InsertOutcome, WriteGroupSequencer,
    Writer,
};
