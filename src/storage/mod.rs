//! Storage subsystem
//!
//! Memtables, column families and the flush queue that batches are applied to.

pub mod column_family;
pub mod flush;
pub mod memtable;
pub mod merge;
pub mod options;

pub use column_family::{
    ColumnFamilyData, ColumnFamilyMemTables, ColumnFamilySet, ColumnFamilySetMemTables,
    DEFAULT_COLUMN_FAMILY_ID, DEFAULT_COLUMN_FAMILY_NAME,
};
pub use flush::FlushScheduler;
pub use memtable::{
    EntryKind, Lookup, MemTable, MemTableEntry, MemTablePostProcessInfo, RangeTombstone,
};
pub use merge::{MergeOperator, StringAppendOperator, UInt64AddOperator};
pub use options::{
    ColumnFamilyOptions, InplaceCallback, MemTableOptions, TableFormat, UpdateStatus,
    DEFAULT_WRITE_BUFFER_SIZE,
};
