//! Batch iteration protocol
//!
//! [`iterate`] decodes the record stream after the header and hands each
//! record, in buffer order, to a [`Handler`]. Decode errors abort at once.
//! Errors returned by the handler are remembered (first one wins) while the
//! rest of the stream is still dispatched, so a failed record never shifts
//! the records after it. Once the stream is exhausted the number of counted
//! records seen must match the header count.

use crate::batch::coding::decode_fixed32;
use crate::batch::error::{BatchError, BatchResult};
use crate::batch::record::Record;
use crate::batch::write_batch::{ContentFlags, HEADER_SIZE};

/// Consumer of decoded batch records
pub trait Handler {
    /// Process one record. `Noop` placeholders are never dispatched;
    /// `LogData` is, and handlers that have no use for it ignore it.
    fn handle(&mut self, record: Record<'_>) -> BatchResult<()>;

    /// Polled before each record; returning false stops iteration cleanly
    fn should_continue(&mut self) -> bool {
        true
    }
}

/// Iterate a serialized batch (header included)
pub fn iterate<H: Handler + ?Sized>(rep: &[u8], handler: &mut H) -> BatchResult<()> {
    if rep.len() < HEADER_SIZE {
        return Err(BatchError::corruption("malformed WriteBatch (too small)"));
    }
    let declared = decode_fixed32(rep, 8).unwrap_or(0);

    let mut input = &rep[HEADER_SIZE..];
    let mut found = 0u32;
    let mut stopped = false;
    let mut first_error: Option<BatchError> = None;

    while !input.is_empty() {
        if !handler.should_continue() {
            stopped = true;
            break;
        }

        let record = Record::decode(&mut input)?;
        if record == Record::Noop {
            continue;
        }
        if record.is_counted() {
            found += 1;
        }
        if let Err(e) = handler.handle(record) {
            first_error.get_or_insert(e);
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if !stopped && found != declared {
        return Err(BatchError::corruption("WriteBatch has wrong count"));
    }
    Ok(())
}

/// Handler that records which kinds of records a batch contains
#[derive(Debug, Default)]
pub struct ContentClassifier {
    pub content_flags: ContentFlags,
}

impl Handler for ContentClassifier {
    fn handle(&mut self, record: Record<'_>) -> BatchResult<()> {
        self.content_flags |= record.content_flag();
        Ok(())
    }
}
