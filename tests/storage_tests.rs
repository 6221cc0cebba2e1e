//! Integration tests for memtables and column families

use std::sync::Arc;

use roobatch::storage::{
    ColumnFamilyOptions, ColumnFamilySet, EntryKind, Lookup, MemTable, MemTableOptions,
    StringAppendOperator,
};

fn lookup(mem: &MemTable, key: &[u8], snapshot: u64) -> Lookup {
    let mut operands = Vec::new();
    mem.lookup(key, snapshot, &mut operands)
}

// ============ Memtable Tests ============

#[test]
fn test_memtable_put_get() {
    let mem = MemTable::new(MemTableOptions::default());

    mem.add(1, EntryKind::Value, b"key1", b"value1", None);
    mem.add(2, EntryKind::Value, b"key2", b"value2", None);
    mem.add(3, EntryKind::Value, b"key3", b"value3", None);

    assert_eq!(lookup(&mem, b"key1", 3), Lookup::Value(b"value1".to_vec()));
    assert_eq!(lookup(&mem, b"key2", 3), Lookup::Value(b"value2".to_vec()));
    assert_eq!(lookup(&mem, b"key3", 3), Lookup::Value(b"value3".to_vec()));
    assert_eq!(lookup(&mem, b"key4", 3), Lookup::Continue);
}

#[test]
fn test_memtable_delete() {
    let mem = MemTable::new(MemTableOptions::default());

    mem.add(1, EntryKind::Value, b"key1", b"value1", None);
    assert_eq!(lookup(&mem, b"key1", 1), Lookup::Value(b"value1".to_vec()));

    mem.add(2, EntryKind::SingleDeletion, b"key1", b"", None);
    // Tombstone shadows the value for newer snapshots only
    assert_eq!(lookup(&mem, b"key1", 2), Lookup::Deleted);
    assert_eq!(lookup(&mem, b"key1", 1), Lookup::Value(b"value1".to_vec()));
}

#[test]
fn test_memtable_size_tracking() {
    let mem = MemTable::new(MemTableOptions::default());
    assert!(mem.is_empty());
    assert_eq!(mem.approximate_memory_usage(), 0);

    mem.add(1, EntryKind::Value, b"abc", b"defgh", None);
    let after_one = mem.approximate_memory_usage();
    assert!(after_one >= 8);

    mem.add(2, EntryKind::RangeDeletion, b"a", b"b", None);
    assert!(mem.approximate_memory_usage() > after_one);
    assert_eq!(mem.num_entries(), 2);
    assert_eq!(mem.num_deletes(), 1);
    assert_eq!(mem.data_size(), mem.approximate_memory_usage());
}

#[test]
fn test_memtable_ids_are_unique() {
    let a = MemTable::new(MemTableOptions::default());
    let b = MemTable::new(MemTableOptions::default());
    assert_ne!(a.id(), b.id());
}

// ============ Column Family Tests ============

#[test]
fn test_switch_memtable_keeps_reads() {
    let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
    let cfd = set.default_column_family().unwrap();

    cfd.mem().add(1, EntryKind::Value, b"k", b"old", None);
    let frozen = cfd.switch_memtable();
    cfd.mem().add(2, EntryKind::Value, b"k", b"new", None);

    assert_ne!(frozen.id(), cfd.mem().id());
    assert_eq!(cfd.get(b"k", 1).unwrap(), Some(b"old".to_vec()));
    assert_eq!(cfd.get(b"k", 2).unwrap(), Some(b"new".to_vec()));

    assert_eq!(cfd.clear_imm(), 1);
    assert_eq!(cfd.get(b"k", 1).unwrap(), None);
}

#[test]
fn test_tombstone_in_newer_memtable_stops_merge_chain() {
    let options = ColumnFamilyOptions::new().with_memtable(
        MemTableOptions::new().with_merge_operator(Arc::new(StringAppendOperator::new(b'|'))),
    );
    let set = ColumnFamilySet::new(options);
    let cfd = set.default_column_family().unwrap();

    cfd.mem().add(1, EntryKind::Value, b"k", b"base", None);
    cfd.switch_memtable();
    cfd.mem().add(2, EntryKind::Deletion, b"k", b"", None);
    cfd.mem().add(3, EntryKind::Merge, b"k", b"x", None);

    assert_eq!(cfd.get(b"k", 3).unwrap(), Some(b"x".to_vec()));
    assert_eq!(cfd.get(b"k", 2).unwrap(), None);
    assert_eq!(cfd.get(b"k", 1).unwrap(), Some(b"base".to_vec()));
}

#[test]
fn test_column_family_names() {
    let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
    let logs = set.create("logs", ColumnFamilyOptions::default()).unwrap();
    let meta = set.create("meta", ColumnFamilyOptions::default()).unwrap();

    assert_eq!(set.len(), 3);
    let names: Vec<_> = set.all().iter().map(|cfd| cfd.name().to_string()).collect();
    assert_eq!(names, vec!["default", "logs", "meta"]);
    assert_eq!(set.get_by_name("meta").unwrap().id(), meta.id());

    set.drop_column_family(logs.id()).unwrap();
    assert!(set.get_by_name("logs").is_none());
}
