//! Prepared transactions rebuilt from the log during recovery

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::WriteBatch;

/// A prepared section found in the log, waiting for its commit or rollback
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    /// Log holding the prepared section
    pub log_number: u64,
    /// Records between BeginPrepare and EndPrepare
    pub batch: WriteBatch,
}

/// Recovered transactions keyed by transaction id
#[derive(Debug, Default)]
pub struct RecoveredTransactionTable {
    transactions: Mutex<HashMap<String, Arc<RecoveredTransaction>>>,
}

impl RecoveredTransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prepared section, replacing any earlier one with the same id
    pub fn insert(&self, xid: impl Into<String>, log_number: u64, batch: WriteBatch) {
        self.transactions
            .lock()
            .insert(xid.into(), Arc::new(RecoveredTransaction { log_number, batch }));
    }

    pub fn get(&self, xid: &str) -> Option<Arc<RecoveredTransaction>> {
        self.transactions.lock().get(xid).cloned()
    }

    pub fn remove(&self, xid: &str) -> Option<Arc<RecoveredTransaction>> {
        self.transactions.lock().remove(xid)
    }

    pub fn contains(&self, xid: &str) -> bool {
        self.transactions.lock().contains_key(xid)
    }

    /// Ids of all pending transactions, sorted
    pub fn xids(&self) -> Vec<String> {
        let mut xids: Vec<_> = self.transactions.lock().keys().cloned().collect();
        xids.sort();
        xids
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.lock().is_empty()
    }
}
