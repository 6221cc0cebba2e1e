//! Flush request queue
//!
//! Writers that fill a memtable enqueue its column family here. The owner of
//! the write path drains the queue between write groups.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::column_family::ColumnFamilyData;

/// Queue of column families whose memtable should be flushed
#[derive(Debug, Default)]
pub struct FlushScheduler {
    queue: Mutex<VecDeque<Arc<ColumnFamilyData>>>,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a column family for flushing
    pub fn schedule_flush(&self, cfd: Arc<ColumnFamilyData>) {
        tracing::debug!(cf = cfd.id(), name = cfd.name(), "Flush scheduled");
        self.queue.lock().push_back(cfd);
    }

    /// Pop the oldest pending request
    pub fn take_next_column_family(&self) -> Option<Arc<ColumnFamilyData>> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::options::ColumnFamilyOptions;

    #[test]
    fn test_fifo_order() {
        let scheduler = FlushScheduler::new();
        assert!(scheduler.is_empty());

        let a = Arc::new(ColumnFamilyData::new(1, "a", ColumnFamilyOptions::default()));
        let b = Arc::new(ColumnFamilyData::new(2, "b", ColumnFamilyOptions::default()));
        scheduler.schedule_flush(a);
        scheduler.schedule_flush(b);
        assert_eq!(scheduler.len(), 2);

        assert_eq!(scheduler.take_next_column_family().unwrap().id(), 1);
        assert_eq!(scheduler.take_next_column_family().unwrap().id(), 2);
        assert!(scheduler.take_next_column_family().is_none());
    }
}
