use super::{DeadLetterRecord, DeadLetterSink, DeadLetterSource, SledDeadLetterStore};
use crate::broker::message::MessageRecord;
use crate::config::PersistenceSettings;

use serde_json::json;
use std::thread::sleep;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn create_test_store(ttl: Option<i64>, max: Option<usize>) -> (SledDeadLetterStore, TempDir) {
    let dir = tempdir().unwrap();
    let store = SledDeadLetterStore::new(dir.path().to_str().unwrap(), ttl, max).unwrap();
    (store, dir)
}

fn record(destination: &str, id: &str) -> DeadLetterRecord {
    DeadLetterRecord::new(
        MessageRecord {
            id: id.to_string(),
            destination: destination.to_string(),
            payload: json!({ "id": id }),
            priority: 0,
            timestamp: 0,
            ttl_ms: None,
            attempts: 3,
            max_attempts: 3,
        },
        "boom",
        DeadLetterSource::Queue,
    )
}

#[test]
fn test_store_and_load_record() {
    let (store, _dir) = create_test_store(None, None);

    store.store(&record("jobs", "m1")).unwrap();
    let records = store.load("jobs").unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message.id, "m1");
    assert_eq!(records[0].error, "boom");
    assert_eq!(records[0].source, DeadLetterSource::Queue);
}

#[test]
fn test_records_are_kept_per_source() {
    let (store, _dir) = create_test_store(None, None);

    store.store(&record("jobs", "m1")).unwrap();
    store.store(&record("orders", "m2")).unwrap();

    assert_eq!(store.len("jobs").unwrap(), 1);
    assert_eq!(store.load("orders").unwrap()[0].message.id, "m2");
}

#[test]
fn test_ttl_removes_old_records() {
    let (store, _dir) = create_test_store(Some(1), None);

    store.store(&record("ttl_test", "m1")).unwrap();
    sleep(Duration::from_secs(2));

    assert!(store.load("ttl_test").unwrap().is_empty());
}

#[test]
fn test_max_records_limit_keeps_newest() {
    let (store, _dir) = create_test_store(None, Some(3));

    for i in 0..5 {
        store.store(&record("capped", &format!("m{i}"))).unwrap();
        sleep(Duration::from_millis(2)); // distinct timestamps keep key order
    }

    let ids: Vec<_> = store
        .load("capped")
        .unwrap()
        .into_iter()
        .map(|r| r.message.id)
        .collect();
    assert_eq!(ids, vec!["m2", "m3", "m4"]);
}

#[test]
fn test_empty_source_returns_empty_vec() {
    let (store, _dir) = create_test_store(None, None);
    assert!(store.load("nothing_here").unwrap().is_empty());
}

#[test]
fn test_from_settings_without_path_is_none() {
    let settings = PersistenceSettings::default();
    assert!(SledDeadLetterStore::from_settings(&settings).unwrap().is_none());
}

#[test]
fn test_handler_source_serializes_with_kind_tag() {
    let source = DeadLetterSource::Handler {
        subscription_id: "s1".to_string(),
    };
    let value = serde_json::to_value(&source).unwrap();
    assert_eq!(value, json!({ "kind": "handler", "subscription_id": "s1" }));
}
