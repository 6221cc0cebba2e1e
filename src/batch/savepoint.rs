//! Batch savepoints
//!
//! A savepoint records how far the batch had grown (buffer length, record
//! count, content flags) so the batch can later be cut back to exactly that
//! state.

use crate::batch::write_batch::ContentFlags;

/// Snapshot of a batch's size, count and flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    /// Buffer length, header included
    pub size: usize,
    /// Header record count
    pub count: u32,
    /// Content flags at the time of the snapshot
    pub content_flags: ContentFlags,
}

impl SavePoint {
    pub fn new(size: usize, count: u32, content_flags: ContentFlags) -> Self {
        Self {
            size,
            count,
            content_flags,
        }
    }
}

/// LIFO stack of savepoints
#[derive(Debug, Clone, Default)]
pub struct SavePoints {
    stack: Vec<SavePoint>,
}

impl SavePoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, save_point: SavePoint) {
        self.stack.push(save_point);
    }

    pub fn pop(&mut self) -> Option<SavePoint> {
        self.stack.pop()
    }

    pub fn top(&self) -> Option<&SavePoint> {
        self.stack.last()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}
