//! Column family and memtable configuration

use std::fmt;
use std::sync::Arc;

use crate::storage::merge::MergeOperator;

/// Default memtable size before a flush is requested (4MB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of an in-place update callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Nothing to write
    Failed,
    /// The existing value was rewritten in place
    UpdatedInplace,
    /// The merged output holds the new value
    Updated,
}

/// In-place update callback: `(existing value, delta, merged output)`.
///
/// `existing` is `None` when the key has no visible value.
pub type InplaceCallback =
    Arc<dyn Fn(Option<&mut Vec<u8>>, &[u8], &mut Vec<u8>) -> UpdateStatus + Send + Sync>;

/// Memtable behaviour
#[derive(Clone)]
pub struct MemTableOptions {
    /// Approximate memory usage at which a flush is requested
    pub write_buffer_size: usize,

    /// Overwrite existing values instead of adding new versions
    pub inplace_update_support: bool,

    /// Delta-style in-place updates (requires `inplace_update_support`)
    pub inplace_callback: Option<InplaceCallback>,

    /// Fold merge operands into a value once this many are pending (0 = never)
    pub max_successive_merges: usize,

    /// Operator combining merge operands
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            inplace_update_support: false,
            inplace_callback: None,
            max_successive_merges: 0,
            merge_operator: None,
        }
    }
}

impl fmt::Debug for MemTableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTableOptions")
            .field("write_buffer_size", &self.write_buffer_size)
            .field("inplace_update_support", &self.inplace_update_support)
            .field("inplace_callback", &self.inplace_callback.is_some())
            .field("max_successive_merges", &self.max_successive_merges)
            .field(
                "merge_operator",
                &self.merge_operator.as_ref().map(|op| op.name().to_string()),
            )
            .finish()
    }
}

impl MemTableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_inplace_update_support(mut self, enabled: bool) -> Self {
        self.inplace_update_support = enabled;
        self
    }

    /// Install a delta callback; implies in-place update support
    pub fn with_inplace_callback(mut self, callback: InplaceCallback) -> Self {
        self.inplace_update_support = true;
        self.inplace_callback = Some(callback);
        self
    }

    pub fn with_max_successive_merges(mut self, count: usize) -> Self {
        self.max_successive_merges = count;
        self
    }

    pub fn with_merge_operator(mut self, operator: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(operator);
        self
    }
}

/// On-disk table format a column family flushes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableFormat {
    #[default]
    BlockBased,
    PlainTable,
    Cuckoo,
}

impl TableFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::BlockBased => "BlockBasedTable",
            Self::PlainTable => "PlainTable",
            Self::Cuckoo => "CuckooTable",
        }
    }

    /// Only block-based tables can persist range tombstones
    pub fn supports_delete_range(self) -> bool {
        matches!(self, Self::BlockBased)
    }
}

/// Per column family configuration
#[derive(Debug, Clone, Default)]
pub struct ColumnFamilyOptions {
    pub memtable: MemTableOptions,
    pub table_format: TableFormat,
}

impl ColumnFamilyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memtable(mut self, memtable: MemTableOptions) -> Self {
        self.memtable = memtable;
        self
    }

    pub fn with_table_format(mut self, format: TableFormat) -> Self {
        self.table_format = format;
        self
    }
}
