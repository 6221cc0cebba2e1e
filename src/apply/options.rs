//! Apply engine configuration and the engine services it calls back into

use crate::apply::recovered::RecoveredTransactionTable;
use crate::batch::{BatchResult, SequenceNumber};
use crate::storage::ColumnFamilyData;

/// What a write group does after one writer's batch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop at the failing writer
    #[default]
    Abort,
    /// Record the failure on the writer and apply the rest
    Continue,
}

/// Settings for one apply pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Skip records for unknown column families instead of failing
    pub ignore_missing_column_families: bool,

    /// Log being replayed (0 = live write)
    pub recovering_log_number: u64,

    /// Several inserters share memtables; counters are deferred to post-processing
    pub concurrent_memtable_writes: bool,

    pub error_policy: ErrorPolicy,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_missing_column_families(mut self, ignore: bool) -> Self {
        self.ignore_missing_column_families = ignore;
        self
    }

    pub fn with_recovering_log_number(mut self, log_number: u64) -> Self {
        self.recovering_log_number = log_number;
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

    pub fn is_recovering(&self) -> bool {
        self.recovering_log_number != 0
    }
}

/// Engine services used while applying records
pub trait EngineContext: Send + Sync {
    /// Whether the engine accepts prepared transactions in its log
    fn allow_2pc(&self) -> bool;

    /// Point lookup as of `snapshot`
    fn get(
        &self,
        cfd: &ColumnFamilyData,
        key: &[u8],
        snapshot: SequenceNumber,
    ) -> BatchResult<Option<Vec<u8>>> {
        cfd.get(key, snapshot)
    }

    /// Prepared sections awaiting commit during recovery
    fn recovered_transactions(&self) -> &RecoveredTransactionTable;
}
