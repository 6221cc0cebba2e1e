//! Column families
//!
//! Each column family owns a mutable memtable plus the immutable memtables
//! waiting to be flushed. A [`ColumnFamilyMemTables`] cursor resolves the
//! column family id carried by batch records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::batch::{BatchError, BatchResult, SequenceNumber};
use crate::storage::memtable::{Lookup, MemTable};
use crate::storage::options::{ColumnFamilyOptions, TableFormat};

/// Id of the column family that always exists
pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// State of one column family
pub struct ColumnFamilyData {
    id: u32,
    name: String,
    options: ColumnFamilyOptions,
    mem: RwLock<Arc<MemTable>>,
    /// Immutable memtables, newest first
    imm: RwLock<Vec<Arc<MemTable>>>,
    /// Records from logs older than this are already persisted
    log_number: AtomicU64,
}

impl ColumnFamilyData {
    pub fn new(id: u32, name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        let mem = Arc::new(MemTable::new(options.memtable.clone()));
        Self {
            id,
            name: name.into(),
            options,
            mem: RwLock::new(mem),
            imm: RwLock::new(Vec::new()),
            log_number: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.options
    }

    pub fn table_format(&self) -> TableFormat {
        self.options.table_format
    }

    pub fn is_delete_range_supported(&self) -> bool {
        self.options.table_format.supports_delete_range()
    }

    /// Current mutable memtable
    pub fn mem(&self) -> Arc<MemTable> {
        self.mem.read().clone()
    }

    /// Immutable memtables, newest first
    pub fn imm(&self) -> Vec<Arc<MemTable>> {
        self.imm.read().clone()
    }

    /// Freeze the mutable memtable and install an empty one.
    /// Returns the frozen memtable.
    pub fn switch_memtable(&self) -> Arc<MemTable> {
        let fresh = Arc::new(MemTable::new(self.options.memtable.clone()));
        let old = std::mem::replace(&mut *self.mem.write(), fresh);
        self.imm.write().insert(0, old.clone());
        old
    }

    /// Drop immutable memtables, as after they have been persisted
    pub fn clear_imm(&self) -> usize {
        let mut imm = self.imm.write();
        let dropped = imm.len();
        imm.clear();
        dropped
    }

    pub fn log_number(&self) -> u64 {
        self.log_number.load(Ordering::Acquire)
    }

    pub fn set_log_number(&self, log_number: u64) {
        self.log_number.store(log_number, Ordering::Release);
    }

    /// Read `key` as of `snapshot` across the mutable and immutable
    /// memtables, folding pending merge operands.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> BatchResult<Option<Vec<u8>>> {
        let mut sources = vec![self.mem()];
        sources.extend(self.imm());

        let mut operands = Vec::new();
        let mut base = None;
        for mem in &sources {
            match mem.lookup(key, snapshot, &mut operands) {
                Lookup::Value(value) => {
                    base = Some(value);
                    break;
                }
                Lookup::Deleted => break,
                Lookup::Continue => {}
            }
        }

        if operands.is_empty() {
            return Ok(base);
        }
        let operator = self.options.memtable.merge_operator.as_ref().ok_or_else(|| {
            BatchError::InvalidArgument("merge operator is not configured".to_string())
        })?;
        let ordered: Vec<&[u8]> = operands.iter().rev().map(Vec::as_slice).collect();
        operator
            .full_merge(key, base.as_deref(), &ordered)
            .map(Some)
    }
}

impl std::fmt::Debug for ColumnFamilyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("log_number", &self.log_number())
            .finish()
    }
}

/// Registry of live column families
#[derive(Debug)]
pub struct ColumnFamilySet {
    families: RwLock<BTreeMap<u32, Arc<ColumnFamilyData>>>,
    next_id: AtomicU32,
}

impl ColumnFamilySet {
    /// Create a set holding only the default column family
    pub fn new(default_options: ColumnFamilyOptions) -> Self {
        let default = Arc::new(ColumnFamilyData::new(
            DEFAULT_COLUMN_FAMILY_ID,
            DEFAULT_COLUMN_FAMILY_NAME,
            default_options,
        ));
        let mut families = BTreeMap::new();
        families.insert(DEFAULT_COLUMN_FAMILY_ID, default);
        Self {
            families: RwLock::new(families),
            next_id: AtomicU32::new(DEFAULT_COLUMN_FAMILY_ID + 1),
        }
    }

    /// Add a column family under the next free id
    pub fn create(
        &self,
        name: impl Into<String>,
        options: ColumnFamilyOptions,
    ) -> BatchResult<Arc<ColumnFamilyData>> {
        let name = name.into();
        let mut families = self.families.write();
        if families.values().any(|cfd| cfd.name() == name) {
            return Err(BatchError::InvalidArgument(format!(
                "column family already exists: {}",
                name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cfd = Arc::new(ColumnFamilyData::new(id, name, options));
        families.insert(id, cfd.clone());
        Ok(cfd)
    }

    /// Remove a column family. The default one cannot be dropped.
    pub fn drop_column_family(&self, id: u32) -> BatchResult<()> {
        if id == DEFAULT_COLUMN_FAMILY_ID {
            return Err(BatchError::InvalidArgument(
                "cannot drop the default column family".to_string(),
            ));
        }
        self.families
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BatchError::NotFound(format!("column family {}", id)))
    }

    pub fn get(&self, id: u32) -> Option<Arc<ColumnFamilyData>> {
        self.families.read().get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<ColumnFamilyData>> {
        self.families
            .read()
            .values()
            .find(|cfd| cfd.name() == name)
            .cloned()
    }

    pub fn default_column_family(&self) -> Option<Arc<ColumnFamilyData>> {
        self.get(DEFAULT_COLUMN_FAMILY_ID)
    }

    /// All column families, ordered by id
    pub fn all(&self) -> Vec<Arc<ColumnFamilyData>> {
        self.families.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.families.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.read().is_empty()
    }

    /// Cursor over this set for the apply engine
    pub fn memtables(&self) -> ColumnFamilySetMemTables<'_> {
        ColumnFamilySetMemTables::new(self)
    }
}

/// Resolves column family ids to their current memtables
pub trait ColumnFamilyMemTables {
    /// Position on column family `id`; false if it does not exist
    fn seek(&mut self, id: u32) -> bool;

    /// Column family of the last successful seek
    fn current(&self) -> Option<&Arc<ColumnFamilyData>>;

    fn log_number(&self) -> u64 {
        self.current().map_or(0, |cfd| cfd.log_number())
    }

    fn memtable(&self) -> Option<Arc<MemTable>> {
        self.current().map(|cfd| cfd.mem())
    }
}

/// [`ColumnFamilyMemTables`] backed by a [`ColumnFamilySet`]
#[derive(Debug, Clone)]
pub struct ColumnFamilySetMemTables<'a> {
    set: &'a ColumnFamilySet,
    current: Option<Arc<ColumnFamilyData>>,
}

impl<'a> ColumnFamilySetMemTables<'a> {
    pub fn new(set: &'a ColumnFamilySet) -> Self {
        Self { set, current: None }
    }
}

impl ColumnFamilyMemTables for ColumnFamilySetMemTables<'_> {
    fn seek(&mut self, id: u32) -> bool {
        self.current = self.set.get(id);
        self.current.is_some()
    }

    fn current(&self) -> Option<&Arc<ColumnFamilyData>> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memtable::EntryKind;
    use crate::storage::merge::StringAppendOperator;
    use crate::storage::options::MemTableOptions;

    #[test]
    fn test_default_column_family() {
        let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
        let cfd = set.default_column_family().unwrap();
        assert_eq!(cfd.id(), 0);
        assert_eq!(cfd.name(), "default");
        assert!(set.drop_column_family(0).is_err());
    }

    #[test]
    fn test_create_and_drop() {
        let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
        let cfd = set.create("users", ColumnFamilyOptions::default()).unwrap();
        assert_eq!(cfd.id(), 1);
        assert!(set.create("users", ColumnFamilyOptions::default()).is_err());
        assert_eq!(set.get_by_name("users").unwrap().id(), 1);

        set.drop_column_family(1).unwrap();
        assert!(set.get(1).is_none());
        assert!(set.drop_column_family(1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_memtables_cursor() {
        let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
        set.create("other", ColumnFamilyOptions::default()).unwrap();
        set.get(1).unwrap().set_log_number(12);

        let mut cursor = set.memtables();
        assert!(cursor.seek(1));
        assert_eq!(cursor.log_number(), 12);
        assert!(cursor.memtable().is_some());

        assert!(!cursor.seek(7));
        assert!(cursor.current().is_none());
        assert_eq!(cursor.log_number(), 0);
    }

    #[test]
    fn test_get_reads_through_immutable_memtables() {
        let options = ColumnFamilyOptions::default().with_memtable(
            MemTableOptions::new().with_merge_operator(Arc::new(StringAppendOperator::default())),
        );
        let cfd = ColumnFamilyData::new(0, "default", options);
        cfd.mem().add(1, EntryKind::Value, b"k", b"a", None);
        cfd.switch_memtable();
        cfd.mem().add(2, EntryKind::Merge, b"k", b"b", None);
        cfd.mem().add(3, EntryKind::Merge, b"k", b"c", None);

        assert_eq!(cfd.imm().len(), 1);
        assert_eq!(cfd.get(b"k", 10).unwrap(), Some(b"a,b,c".to_vec()));
        assert_eq!(cfd.get(b"k", 1).unwrap(), Some(b"a".to_vec()));
        assert_eq!(cfd.get(b"missing", 10).unwrap(), None);
    }

    #[test]
    fn test_get_merge_without_operator() {
        let cfd = ColumnFamilyData::new(0, "default", ColumnFamilyOptions::default());
        cfd.mem().add(1, EntryKind::Merge, b"k", b"x", None);
        assert!(cfd.get(b"k", 5).unwrap_err().is_invalid_argument());
    }
}
