//! Integration tests for applying batches to memtables, live and during
//! log replay

mod test_utils;

use std::sync::Arc;

use roobatch::apply::{ApplyOptions, EngineContext, MemTableInserter};
use roobatch::batch::WriteBatch;
use roobatch::db::{DbOptions, MemDb};
use roobatch::storage::{
    ColumnFamilyOptions, ColumnFamilySet, EntryKind, MemTableOptions, TableFormat,
    UInt64AddOperator,
};
use test_utils::init_tracing;

fn prepared(xid: &[u8], sequence: u64, puts: &[(&[u8], &[u8])]) -> WriteBatch {
    let mut batch = WriteBatch::new();
    batch.set_sequence(sequence);
    batch.insert_noop();
    for (key, value) in puts {
        batch.put(key, value).unwrap();
    }
    batch.mark_end_prepare(xid);
    batch
}

fn committed(xid: &[u8], sequence: u64) -> WriteBatch {
    let mut batch = WriteBatch::new();
    batch.set_sequence(sequence);
    batch.mark_commit(xid);
    batch
}

// ============ Two-phase commit recovery ============

#[test]
fn test_prepare_and_commit_in_one_batch() {
    init_tracing();
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));
    let mut batch = prepared(b"t1", 1, &[(b"x", b"y")]);
    batch.mark_commit(b"t1");

    let outcome = db.recover(7, &batch).unwrap();
    assert!(outcome.has_valid_writes);
    assert_eq!(outcome.last_sequence, 1);

    let mem = db.column_families().get(0).unwrap().mem();
    let entries = mem.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, b"x".to_vec());
    assert_eq!(entries[0].value, b"y".to_vec());
    assert_eq!(entries[0].kind, EntryKind::Value);
    assert_eq!(mem.num_entries(), 1);
    assert!(!db.recovered_transactions().contains("t1"));
    assert_eq!(db.get(0, b"x").unwrap(), Some(b"y".to_vec()));
}

#[test]
fn test_commit_in_later_log() {
    init_tracing();
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));

    db.recover(5, &prepared(b"t1", 1, &[(b"a", b"1"), (b"b", b"2")]))
        .unwrap();
    assert!(db.recovered_transactions().contains("t1"));
    assert_eq!(db.get(0, b"a").unwrap(), None);

    let outcome = db.recover(6, &committed(b"t1", 1)).unwrap();
    assert_eq!(outcome.last_sequence, 2);
    assert!(db.recovered_transactions().is_empty());
    assert_eq!(db.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(0, b"b").unwrap(), Some(b"2".to_vec()));

    let mem = db.column_families().get(0).unwrap().mem();
    assert_eq!(mem.min_log_containing_prep_section(), 5);
    assert_eq!(db.last_sequence(), 2);
}

#[test]
fn test_rollback_of_unknown_transaction_is_noop() {
    init_tracing();
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));
    let mut batch = WriteBatch::new();
    batch.set_sequence(1);
    batch.mark_rollback(b"t1");

    let outcome = db.recover(3, &batch).unwrap();
    assert!(!outcome.has_valid_writes);
    assert!(db.column_families().get(0).unwrap().mem().is_empty());
    assert!(db.recovered_transactions().is_empty());
}

#[test]
fn test_rollback_discards_prepared_section() {
    init_tracing();
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));
    db.recover(2, &prepared(b"t9", 1, &[(b"k", b"v")])).unwrap();
    assert_eq!(db.recovered_transactions().xids(), vec!["t9".to_string()]);

    let mut batch = WriteBatch::new();
    batch.mark_rollback(b"t9");
    db.recover(3, &batch).unwrap();

    assert!(db.recovered_transactions().is_empty());
    db.recover(4, &committed(b"t9", 1)).unwrap();
    assert_eq!(db.get(0, b"k").unwrap(), None);
}

#[test]
fn test_prepared_log_without_2pc() {
    let db = MemDb::open(DbOptions::default());
    let err = db
        .recover(1, &prepared(b"t1", 1, &[(b"x", b"y")]))
        .unwrap_err();
    assert!(err.is_not_supported());
}

#[test]
fn test_commit_of_superseded_transaction() {
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));
    let outcome = db.recover(9, &committed(b"gone", 1)).unwrap();
    assert!(!outcome.has_valid_writes);
    assert!(db.column_families().get(0).unwrap().mem().is_empty());
}

#[test]
fn test_failed_commit_keeps_recovered_transaction() {
    init_tracing();
    let db = MemDb::open(DbOptions::new().with_allow_2pc(true));
    let mut batch = WriteBatch::new();
    batch.set_sequence(1);
    batch.insert_noop();
    batch.put(b"k", b"v").unwrap();
    batch.put_cf(9, b"orphan", b"v").unwrap();
    batch.mark_end_prepare(b"t1");
    db.recover(5, &batch).unwrap();
    assert!(db.recovered_transactions().contains("t1"));

    let err = db.recover(6, &committed(b"t1", 1)).unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(db.recovered_transactions().contains("t1"));
    assert_eq!(db.last_sequence(), 2);
}

// ============ Replay rules ============

#[test]
fn test_replay_skips_column_family_ahead_of_log() {
    let db = MemDb::open(DbOptions::default());
    let cf = db
        .create_column_family("ahead", ColumnFamilyOptions::default())
        .unwrap();
    db.column_families().get(cf).unwrap().set_log_number(10);

    let mut batch = WriteBatch::new();
    batch.set_sequence(20);
    batch.put_cf(cf, b"k", b"stale").unwrap();
    batch.put(b"k", b"fresh").unwrap();

    let outcome = db.recover(4, &batch).unwrap();
    assert_eq!(outcome.last_sequence, 21);
    assert_eq!(db.get(cf, b"k").unwrap(), None);
    assert_eq!(db.get(0, b"k").unwrap(), Some(b"fresh".to_vec()));
    assert_eq!(db.last_sequence(), 21);

    let mut next = WriteBatch::new();
    next.put(b"after", b"replay").unwrap();
    assert_eq!(db.write(&next).unwrap(), 22);
}

#[test]
fn test_replay_ignoring_missing_column_families() {
    let db = MemDb::open(DbOptions::new().with_ignore_missing_column_families(true));
    let mut batch = WriteBatch::new();
    batch.set_sequence(1);
    batch.put_cf(77, b"k", b"v").unwrap();
    batch.put(b"k", b"v").unwrap();

    let outcome = db.recover(1, &batch).unwrap();
    assert_eq!(outcome.last_sequence, 2);
    assert_eq!(db.get(0, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_failed_replay_does_not_reuse_sequences() {
    init_tracing();
    let db = MemDb::open(DbOptions::default());
    let mut batch = WriteBatch::new();
    batch.set_sequence(1);
    batch.put(b"a", b"recovered").unwrap();
    batch.put_cf(9, b"x", b"y").unwrap();

    let err = db.recover(1, &batch).unwrap_err();
    assert!(err.is_invalid_argument());
    assert_eq!(db.last_sequence(), 2);

    let mut live = WriteBatch::new();
    live.put(b"a", b"live").unwrap();
    assert_eq!(db.write(&live).unwrap(), 3);

    assert_eq!(db.get(0, b"a").unwrap(), Some(b"live".to_vec()));
    assert_eq!(db.get_at(0, b"a", 1).unwrap(), Some(b"recovered".to_vec()));
    let mem = db.column_families().get(0).unwrap().mem();
    assert_eq!(mem.entries().len(), 2);
}

// ============ Table format and merge ============

#[test]
fn test_delete_range_on_plain_table() {
    let set = ColumnFamilySet::new(ColumnFamilyOptions::default());
    let plain = set
        .create(
            "plain",
            ColumnFamilyOptions::new().with_table_format(TableFormat::PlainTable),
        )
        .unwrap();

    let mut batch = WriteBatch::new();
    batch.delete_range_cf(plain.id(), b"a", b"m").unwrap();
    batch.put(b"k", b"v").unwrap();

    let mut inserter = MemTableInserter::new(100, set.memtables(), ApplyOptions::default());
    let err = batch.iterate(&mut inserter).unwrap_err();
    assert!(err.is_not_supported());
    assert_eq!(inserter.sequence(), 102);

    assert!(plain.mem().is_empty());
    assert!(plain.mem().range_tombstones().is_empty());
    let default_entries = set.get(0).unwrap().mem().entries();
    assert_eq!(default_entries.len(), 1);
    assert_eq!(default_entries[0].sequence, 101);
}

#[test]
fn test_delete_range_hides_keys() {
    let db = MemDb::open(DbOptions::default());
    let mut batch = WriteBatch::new();
    batch.put(b"apple", b"1").unwrap();
    batch.put(b"banana", b"2").unwrap();
    batch.put(b"cherry", b"3").unwrap();
    db.write(&batch).unwrap();

    let mut batch = WriteBatch::new();
    batch.delete_range(b"b", b"c").unwrap();
    db.write(&batch).unwrap();

    assert_eq!(db.get(0, b"apple").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(0, b"banana").unwrap(), None);
    assert_eq!(db.get(0, b"cherry").unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.get_at(0, b"banana", 3).unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_counter_merges() {
    let memtable = MemTableOptions::new()
        .with_merge_operator(Arc::new(UInt64AddOperator))
        .with_max_successive_merges(3);
    let db = MemDb::open(
        DbOptions::new()
            .with_default_column_family(ColumnFamilyOptions::new().with_memtable(memtable)),
    );

    for _ in 0..10 {
        let mut batch = WriteBatch::new();
        batch.merge(b"hits", &1u64.to_le_bytes()).unwrap();
        db.write(&batch).unwrap();
    }

    let value = db.get(0, b"hits").unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 10);

    let mem = db.column_families().get(0).unwrap().mem();
    assert!(mem.count_successive_merge_operands(b"hits", db.last_sequence()) <= 3);
}
