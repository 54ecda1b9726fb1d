//! Integration tests for stream writers committing into a shared pond

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::tempdir;
use target_duckpond::pond::CommitLock;
use target_duckpond::{
    CommitFailure, CommitState, DestinationStore, DuckPondSink, PondError, PondLayout, Row, Sink,
    StreamSchema, TableRef,
};

fn users_schema() -> StreamSchema {
    StreamSchema::from_json_schema(
        "users",
        &json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": ["string", "null"]}
            }
        }),
        &["id".to_string()],
    )
    .unwrap()
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn users_table() -> TableRef {
    TableRef::new(Some("main"), "users").unwrap()
}

fn writer(root: &Path, schema: &StreamSchema, timeout: Option<Duration>) -> DuckPondSink {
    DuckPondSink::new("users", users_table(), schema, PondLayout::new(root), timeout).unwrap()
}

fn tmp_entries(root: &Path) -> usize {
    match fs::read_dir(PondLayout::new(root).tmp_dir()) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[test]
fn test_commit_publishes_all_rows() {
    let dir = tempdir().unwrap();
    let mut sink = writer(dir.path(), &users_schema(), None);

    let rows: Vec<Row> = (1..=50)
        .map(|id| row(json!({"id": id, "name": format!("user{}", id)})))
        .collect();
    assert_eq!(sink.process_batch(&rows).unwrap(), 50);

    let report = sink.commit().unwrap();
    assert_eq!(report.rows_staged, 50);
    assert_eq!(report.rows_in_destination, 50);

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    assert!(store.exists(&users_table()));
    assert_eq!(store.row_count(&users_table()).unwrap(), 50);
    assert_eq!(tmp_entries(dir.path()), 0);
}

#[test]
fn test_last_commit_wins_per_key() {
    let dir = tempdir().unwrap();
    let schema = users_schema();

    let mut first = writer(dir.path(), &schema, None);
    let mut second = writer(dir.path(), &schema, None);
    first
        .process_batch(&[row(json!({"id": 1, "name": "a"})), row(json!({"id": 2, "name": "x"}))])
        .unwrap();
    second.process_batch(&[row(json!({"id": 1, "name": "b"}))]).unwrap();

    first.commit().unwrap();
    second.commit().unwrap();

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    let table = store.read_table(&users_table()).unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.find("id", &json!(1)).unwrap()["name"], json!("b"));
    assert_eq!(table.find("id", &json!(2)).unwrap()["name"], json!("x"));
}

#[test]
fn test_later_rows_replace_earlier_within_one_writer() {
    let dir = tempdir().unwrap();
    let mut sink = writer(dir.path(), &users_schema(), None);
    sink.process_batch(&[row(json!({"id": 1, "name": "a"}))]).unwrap();
    sink.process_batch(&[row(json!({"id": 1, "name": "b"}))]).unwrap();
    sink.commit().unwrap();

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    let table = store.read_table(&users_table()).unwrap();
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.rows[0]["name"], json!("b"));
}

#[test]
fn test_schema_without_properties_creates_nothing() {
    let dir = tempdir().unwrap();
    let layout = PondLayout::new(dir.path());

    let empty = StreamSchema::from_json_schema("users", &json!({"properties": {}}), &[]).unwrap();
    let err = DuckPondSink::new("users", users_table(), &empty, layout, None)
        .err()
        .unwrap();
    assert!(matches!(err, PondError::Schema { .. }));
    assert!(!err.is_retryable());

    let missing = StreamSchema::from_json_schema("users", &json!({"type": "object"}), &[]);
    assert!(matches!(missing, Err(PondError::Schema { .. })));

    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_generated_integer_keys_are_distinct_across_commits() {
    let dir = tempdir().unwrap();
    let schema = users_schema();

    let mut first = writer(dir.path(), &schema, None);
    first
        .process_batch(&[
            row(json!({"name": "a"})),
            row(json!({"name": "b"})),
            row(json!({"name": "c"})),
        ])
        .unwrap();
    first.commit().unwrap();

    let mut second = writer(dir.path(), &schema, None);
    second
        .process_batch(&[row(json!({"name": "d"})), row(json!({"name": "e"}))])
        .unwrap();
    second.commit().unwrap();

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    let table = store.read_table(&users_table()).unwrap();
    assert_eq!(table.row_count(), 5);

    let mut ids: Vec<i64> = table.rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[test]
fn test_added_column_merges_with_nulls() {
    let dir = tempdir().unwrap();

    let mut first = writer(dir.path(), &users_schema(), None);
    first.process_batch(&[row(json!({"id": 1, "name": "a"}))]).unwrap();
    first.commit().unwrap();

    let wider = StreamSchema::from_json_schema(
        "users",
        &json!({
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": "string"},
                "email": {"type": "string"}
            }
        }),
        &["id".to_string()],
    )
    .unwrap();
    let mut second = writer(dir.path(), &wider, None);
    second
        .process_batch(&[row(json!({"id": 2, "name": "b", "email": "b@example.com"}))])
        .unwrap();
    second.commit().unwrap();

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    let table = store.read_table(&users_table()).unwrap();
    assert_eq!(table.row_count(), 2);
    assert!(table.columns.contains(&"email".to_string()));
    assert_eq!(table.find("id", &json!(1)).unwrap()["email"], Value::Null);
    assert_eq!(
        table.find("id", &json!(2)).unwrap()["email"],
        json!("b@example.com")
    );
}

#[test]
fn test_table_without_keys_appends() {
    let dir = tempdir().unwrap();
    let schema = StreamSchema::from_json_schema(
        "events",
        &json!({"properties": {"kind": {"type": "string"}}}),
        &[],
    )
    .unwrap();
    let table = TableRef::new(None, "events").unwrap();
    let layout = PondLayout::new(dir.path());

    for _ in 0..2 {
        let mut sink =
            DuckPondSink::new("events", table.clone(), &schema, layout.clone(), None).unwrap();
        sink.process_batch(&[row(json!({"kind": "click"}))]).unwrap();
        sink.commit().unwrap();
    }

    assert_eq!(DestinationStore::new(layout).row_count(&table).unwrap(), 2);
}

#[test]
fn test_concurrent_writers_lose_no_rows() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let root = root.clone();
            thread::spawn(move || {
                let mut sink = writer(&root, &users_schema(), Some(Duration::from_secs(60)));
                let rows: Vec<Row> = (0..25)
                    .map(|i| row(json!({"id": w * 100 + i, "name": format!("w{}", w)})))
                    .collect();
                sink.process_batch(&rows).unwrap();
                sink.commit().unwrap()
            })
        })
        .collect();

    for handle in handles {
        let report = handle.join().unwrap();
        assert_eq!(report.rows_staged, 25);
    }

    let store = DestinationStore::new(PondLayout::new(&root));
    assert_eq!(store.row_count(&users_table()).unwrap(), 100);
    assert_eq!(tmp_entries(&root), 0);
}

#[test]
fn test_lock_timeout_is_retryable_and_leaves_destination() {
    let dir = tempdir().unwrap();
    let layout = PondLayout::new(dir.path());

    let mut seed = writer(dir.path(), &users_schema(), None);
    seed.process_batch(&[row(json!({"id": 1, "name": "a"}))]).unwrap();
    seed.commit().unwrap();
    let before = fs::read(layout.data_file(&users_table())).unwrap();

    let held = CommitLock::acquire(&layout.lock_file(&users_table()), "main.users", None).unwrap();

    let mut blocked = writer(dir.path(), &users_schema(), Some(Duration::from_millis(100)));
    blocked.process_batch(&[row(json!({"id": 1, "name": "b"}))]).unwrap();
    let err = blocked.commit().unwrap_err();
    assert_eq!(err.commit_failure(), Some(CommitFailure::LockTimeout));
    assert!(err.is_retryable());
    assert_eq!(blocked.state(), CommitState::Failed);
    assert!(blocked.staging_dir().exists());
    assert_eq!(fs::read(layout.data_file(&users_table())).unwrap(), before);

    held.release().unwrap();

    let mut retry = writer(dir.path(), &users_schema(), Some(Duration::from_secs(5)));
    retry.process_batch(&[row(json!({"id": 1, "name": "b"}))]).unwrap();
    retry.commit().unwrap();

    let table = DestinationStore::new(layout).read_table(&users_table()).unwrap();
    assert_eq!(table.find("id", &json!(1)).unwrap()["name"], json!("b"));
}

#[test]
fn test_different_destinations_do_not_block() {
    let dir = tempdir().unwrap();
    let layout = PondLayout::new(dir.path());
    let _held = CommitLock::acquire(&layout.lock_file(&users_table()), "main.users", None).unwrap();

    let orders = TableRef::new(Some("main"), "orders").unwrap();
    let mut sink = DuckPondSink::new(
        "orders",
        orders.clone(),
        &users_schema(),
        layout.clone(),
        Some(Duration::from_millis(200)),
    )
    .unwrap();
    sink.process_batch(&[row(json!({"id": 1}))]).unwrap();
    sink.commit().unwrap();

    assert!(DestinationStore::new(layout).exists(&orders));
}

#[test]
fn test_staging_is_private_until_commit() {
    let dir = tempdir().unwrap();
    let mut sink = writer(dir.path(), &users_schema(), None);
    sink.process_batch(&[row(json!({"id": 1, "name": "a"}))]).unwrap();

    let store = DestinationStore::new(PondLayout::new(dir.path()));
    assert!(!store.exists(&users_table()));
    assert_eq!(sink.staging().scan().unwrap().row_count(), 1);

    sink.abort();
    assert!(!store.exists(&users_table()));
    assert_eq!(tmp_entries(dir.path()), 0);
}

fn sorted_ids(root: &Path) -> Vec<i64> {
    let store = DestinationStore::new(PondLayout::new(root));
    let table = store.read_table(&users_table()).unwrap();
    let mut ids: Vec<i64> = table.rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_explicit_and_generated_keys_in_one_batch() {
    let dir = tempdir().unwrap();
    let mut sink = writer(dir.path(), &users_schema(), None);
    sink.process_batch(&[
        row(json!({"id": 2, "name": "explicit"})),
        row(json!({"name": "gen1"})),
        row(json!({"name": "gen2"})),
    ])
    .unwrap();

    let report = sink.commit().unwrap();
    assert_eq!(report.rows_staged, 3);
    assert_eq!(report.rows_in_destination, 3);
    assert_eq!(sorted_ids(dir.path()), vec![2, 3, 4]);

    let table = DestinationStore::new(PondLayout::new(dir.path()))
        .read_table(&users_table())
        .unwrap();
    assert_eq!(table.find("id", &json!(2)).unwrap()["name"], json!("explicit"));
}

#[test]
fn test_concurrent_generated_keys_do_not_collide() {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let mut seed = writer(&root, &users_schema(), None);
    seed.process_batch(&[row(json!({"id": 5, "name": "seed"}))]).unwrap();
    seed.commit().unwrap();

    // both writers stage before either commits
    let staged = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|w| {
            let root = root.clone();
            let staged = Arc::clone(&staged);
            thread::spawn(move || {
                let mut sink = writer(&root, &users_schema(), Some(Duration::from_secs(60)));
                sink.process_batch(&[row(json!({"name": format!("w{}", w)}))]).unwrap();
                staged.wait();
                sink.commit().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().rows_staged, 1);
    }

    assert_eq!(sorted_ids(&root), vec![5, 6, 7]);
}

#[test]
fn test_keys_with_conforming_names_stage_together() {
    let dir = tempdir().unwrap();
    let schema = StreamSchema::from_json_schema(
        "pairs",
        &json!({"properties": {"a b": {"type": "integer"}, "a_b": {"type": "integer"}}}),
        &["a b".to_string(), "a_b".to_string()],
    )
    .unwrap();
    let table = TableRef::new(Some("main"), "pairs").unwrap();
    let layout = PondLayout::new(dir.path());

    let mut sink = DuckPondSink::new("pairs", table.clone(), &schema, layout.clone(), None).unwrap();
    sink.process_batch(&[row(json!({"a b": 1, "a_b": 1})), row(json!({"a b": 1, "a_b": 2}))])
        .unwrap();
    sink.commit().unwrap();

    assert_eq!(DestinationStore::new(layout).row_count(&table).unwrap(), 2);
}

#[test]
fn test_temporal_values_survive_commit() {
    let dir = tempdir().unwrap();
    let schema = StreamSchema::from_json_schema(
        "events",
        &json!({
            "properties": {
                "id": {"type": "integer"},
                "ts": {"type": "string", "format": "date-time"},
                "d": {"type": "string", "format": "date"},
                "t": {"type": "string", "format": "time"}
            }
        }),
        &["id".to_string()],
    )
    .unwrap();
    let table = TableRef::new(None, "events").unwrap();
    let layout = PondLayout::new(dir.path());

    let mut sink = DuckPondSink::new("events", table.clone(), &schema, layout.clone(), None).unwrap();
    sink.process_batch(&[row(json!({
        "id": 1,
        "ts": "2024-03-01T12:34:56+00:00",
        "d": "2024-03-01",
        "t": "12:34:56"
    }))])
    .unwrap();
    sink.commit().unwrap();

    let committed = DestinationStore::new(layout.clone()).read_table(&table).unwrap();
    assert_eq!(committed.rows[0]["ts"], json!("2024-03-01T12:34:56+00:00"));
    assert_eq!(committed.rows[0]["d"], json!("2024-03-01"));
    assert_eq!(committed.rows[0]["t"], json!("12:34:56"));

    let mut bad = DuckPondSink::new("events", table.clone(), &schema, layout, None).unwrap();
    let err = bad
        .process_batch(&[row(json!({"id": 2, "ts": "yesterday"}))])
        .unwrap_err();
    assert!(matches!(err, PondError::Write { .. }));
    assert_eq!(bad.state(), CommitState::Aborted);
}
