//! In-memory sorted write buffer
//!
//! Entries are versioned: the map is keyed by `(user key, Reverse(sequence))`
//! so all versions of a key sit together, newest first. Range tombstones are
//! kept in a separate list. Size accounting is approximate and drives the
//! flush state machine (NotRequested -> Requested -> Scheduled).

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::batch::SequenceNumber;
use crate::storage::options::{MemTableOptions, UpdateStatus};

/// Per-entry bookkeeping overhead added to the size estimate
const ENTRY_OVERHEAD: usize = 16;

const FLUSH_NOT_REQUESTED: u8 = 0;
const FLUSH_REQUESTED: u8 = 1;
const FLUSH_SCHEDULED: u8 = 2;

static NEXT_MEMTABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of a memtable entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Value,
    Deletion,
    SingleDeletion,
    RangeDeletion,
    Merge,
}

impl EntryKind {
    fn is_delete(self) -> bool {
        matches!(
            self,
            Self::Deletion | Self::SingleDeletion | Self::RangeDeletion
        )
    }
}

/// A flattened memtable entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTableEntry {
    pub key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub kind: EntryKind,
    pub value: Vec<u8>,
}

/// Deletes `[begin, end)` for every version older than `sequence`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
    pub sequence: SequenceNumber,
}

/// Counters accumulated by one writer during concurrent inserts and
/// applied in one go afterwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemTablePostProcessInfo {
    pub data_size: usize,
    pub num_entries: u64,
    pub num_deletes: u64,
}

/// Outcome of probing one memtable for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A value terminates the version chain
    Value(Vec<u8>),
    /// A tombstone terminates the version chain
    Deleted,
    /// No terminating entry here; older sources must be consulted
    Continue,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: EntryKind,
    value: Vec<u8>,
}

type Table = BTreeMap<(Vec<u8>, Reverse<SequenceNumber>), Entry>;

/// In-memory sorted buffer
pub struct MemTable {
    id: u64,
    options: MemTableOptions,
    table: RwLock<Table>,
    range_tombstones: RwLock<Vec<RangeTombstone>>,
    /// Approximate memory usage, updated on every insert
    memory_usage: AtomicUsize,
    /// Logical counters, batched in concurrent mode
    data_size: AtomicUsize,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    flush_state: AtomicU8,
    /// Oldest log holding a prepared section referenced by this memtable (0 = none)
    min_prep_log: AtomicU64,
}

impl MemTable {
    /// Create a new empty memtable
    pub fn new(options: MemTableOptions) -> Self {
        Self {
            id: NEXT_MEMTABLE_ID.fetch_add(1, Ordering::Relaxed),
            options,
            table: RwLock::new(BTreeMap::new()),
            range_tombstones: RwLock::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
            data_size: AtomicUsize::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            flush_state: AtomicU8::new(FLUSH_NOT_REQUESTED),
            min_prep_log: AtomicU64::new(0),
        }
    }

    /// Process-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &MemTableOptions {
        &self.options
    }

    /// Insert a new version.
    ///
    /// For `RangeDeletion`, `key` is the begin key and `value` the end key.
    /// With `post_info`, the logical counters are accumulated there instead
    /// of in the memtable (see [`batch_post_process`](Self::batch_post_process)).
    pub fn add(
        &self,
        sequence: SequenceNumber,
        kind: EntryKind,
        key: &[u8],
        value: &[u8],
        post_info: Option<&mut MemTablePostProcessInfo>,
    ) {
        if kind == EntryKind::RangeDeletion {
            self.range_tombstones.write().push(RangeTombstone {
                begin: key.to_vec(),
                end: value.to_vec(),
                sequence,
            });
        } else {
            self.table.write().insert(
                (key.to_vec(), Reverse(sequence)),
                Entry {
                    kind,
                    value: value.to_vec(),
                },
            );
        }

        let entry_size = key.len() + value.len() + ENTRY_OVERHEAD;
        let deletes = u64::from(kind.is_delete());
        match post_info {
            Some(info) => {
                info.data_size += entry_size;
                info.num_entries += 1;
                info.num_deletes += deletes;
            }
            None => {
                self.data_size.fetch_add(entry_size, Ordering::Relaxed);
                self.num_entries.fetch_add(1, Ordering::Relaxed);
                self.num_deletes.fetch_add(deletes, Ordering::Relaxed);
            }
        }
        self.memory_usage.fetch_add(entry_size, Ordering::Relaxed);
        self.update_flush_state();
    }

    /// Apply counters gathered by a concurrent writer
    pub fn batch_post_process(&self, info: &MemTablePostProcessInfo) {
        self.data_size.fetch_add(info.data_size, Ordering::Relaxed);
        self.num_entries.fetch_add(info.num_entries, Ordering::Relaxed);
        self.num_deletes.fetch_add(info.num_deletes, Ordering::Relaxed);
        self.update_flush_state();
    }

    /// Overwrite the newest value of `key` in place when the new value fits,
    /// otherwise add a new version at `sequence`
    pub fn update(&self, sequence: SequenceNumber, key: &[u8], value: &[u8]) {
        {
            let mut table = self.table.write();
            if let Some((_, entry)) = newest_mut(&mut table, key, sequence) {
                if entry.kind == EntryKind::Value && value.len() <= entry.value.len() {
                    entry.value.clear();
                    entry.value.extend_from_slice(value);
                    return;
                }
            }
        }
        self.add(sequence, EntryKind::Value, key, value, None);
    }

    /// Run the in-place callback against the newest value of `key`.
    ///
    /// Returns false when the key has no value in this memtable (absent or
    /// shadowed by a tombstone or merge), leaving the caller to fall back to
    /// a full read.
    pub fn update_callback(&self, sequence: SequenceNumber, key: &[u8], delta: &[u8]) -> bool {
        let Some(callback) = self.options.inplace_callback.clone() else {
            return false;
        };

        let merged = {
            let mut table = self.table.write();
            let Some((_, entry)) = newest_mut(&mut table, key, sequence) else {
                return false;
            };
            if entry.kind != EntryKind::Value {
                return false;
            }

            let mut existing = entry.value.clone();
            let mut merged = Vec::new();
            match callback(Some(&mut existing), delta, &mut merged) {
                UpdateStatus::UpdatedInplace => {
                    entry.value = existing;
                    return true;
                }
                UpdateStatus::Updated => merged,
                UpdateStatus::Failed => return true,
            }
        };
        self.add(sequence, EntryKind::Value, key, &merged, None);
        true
    }

    /// Number of merge entries at the head of `key`'s version chain,
    /// considering only versions at or below `sequence`
    pub fn count_successive_merge_operands(&self, key: &[u8], sequence: SequenceNumber) -> usize {
        let table = self.table.read();
        versions(&table, key, sequence)
            .take_while(|(_, entry)| entry.kind == EntryKind::Merge)
            .count()
    }

    /// Probe `key` as of `snapshot`, collecting merge operands newest first
    pub fn lookup(&self, key: &[u8], snapshot: SequenceNumber, operands: &mut Vec<Vec<u8>>) -> Lookup {
        let covering = self.covering_tombstone(key, snapshot);
        let table = self.table.read();

        for ((_, Reverse(seq)), entry) in versions(&table, key, snapshot) {
            if *seq < covering {
                return Lookup::Deleted;
            }
            match entry.kind {
                EntryKind::Value => return Lookup::Value(entry.value.clone()),
                EntryKind::Deletion | EntryKind::SingleDeletion | EntryKind::RangeDeletion => {
                    return Lookup::Deleted
                }
                EntryKind::Merge => operands.push(entry.value.clone()),
            }
        }

        if covering > 0 {
            Lookup::Deleted
        } else {
            Lookup::Continue
        }
    }

    /// Newest range tombstone sequence covering `key` at `snapshot` (0 = none)
    fn covering_tombstone(&self, key: &[u8], snapshot: SequenceNumber) -> SequenceNumber {
        self.range_tombstones
            .read()
            .iter()
            .filter(|t| t.sequence <= snapshot && t.begin.as_slice() <= key && key < t.end.as_slice())
            .map(|t| t.sequence)
            .max()
            .unwrap_or(0)
    }

    /// All point entries, key ascending then sequence descending
    pub fn entries(&self) -> Vec<MemTableEntry> {
        self.table
            .read()
            .iter()
            .map(|((key, Reverse(seq)), entry)| MemTableEntry {
                key: key.clone(),
                sequence: *seq,
                kind: entry.kind,
                value: entry.value.clone(),
            })
            .collect()
    }

    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_tombstones.read().clone()
    }

    /// Check if a flush has been requested but not yet scheduled
    pub fn should_schedule_flush(&self) -> bool {
        self.flush_state.load(Ordering::Relaxed) == FLUSH_REQUESTED
    }

    /// Claim the pending flush request. Exactly one caller gets true.
    pub fn mark_flush_scheduled(&self) -> bool {
        self.flush_state
            .compare_exchange(
                FLUSH_REQUESTED,
                FLUSH_SCHEDULED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn update_flush_state(&self) {
        if self.memory_usage.load(Ordering::Relaxed) >= self.options.write_buffer_size {
            let _ = self.flush_state.compare_exchange(
                FLUSH_NOT_REQUESTED,
                FLUSH_REQUESTED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Record that this memtable holds data from a prepared section in `log`
    pub fn ref_log_containing_prep_section(&self, log: u64) {
        let _ = self
            .min_prep_log
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == 0 || log < current).then_some(log)
            });
    }

    /// Oldest prepared-section log referenced (0 = none)
    pub fn min_log_containing_prep_section(&self) -> u64 {
        self.min_prep_log.load(Ordering::Relaxed)
    }

    /// Get approximate memory usage in bytes
    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn data_size(&self) -> usize {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    /// Check if memtable is empty
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty() && self.range_tombstones.read().is_empty()
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("num_entries", &self.num_entries())
            .field("memory_usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Versions of `key` visible at `sequence`, newest first
fn versions<'t>(
    table: &'t Table,
    key: &[u8],
    sequence: SequenceNumber,
) -> impl Iterator<Item = (&'t (Vec<u8>, Reverse<SequenceNumber>), &'t Entry)> {
    table.range((key.to_vec(), Reverse(sequence))..=(key.to_vec(), Reverse(0)))
}

fn newest_mut<'t>(
    table: &'t mut Table,
    key: &[u8],
    sequence: SequenceNumber,
) -> Option<(SequenceNumber, &'t mut Entry)> {
    table
        .range_mut((key.to_vec(), Reverse(sequence))..=(key.to_vec(), Reverse(0)))
        .next()
        .map(|((_, Reverse(seq)), entry)| (*seq, entry))
}
