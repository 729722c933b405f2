mod common;

use std::time::Duration;

use migrates_core::batch::Batch;
use migrates_core::{BulkAction, Document, Error};
use serde_json::Map;

use crate::common::MemoryStore;

fn action(index: &str, id: usize) -> BulkAction {
    BulkAction::index(Document::new(index, "test", id.to_string(), Map::new()))
}

#[test]
fn flushes_on_the_action_count_threshold_and_not_sooner() {
    let store = MemoryStore::new();
    let mut batch = Batch::with_limits(&store, 3, 100);

    batch.add(action("t_0", 0)).unwrap();
    batch.add(action("t_0", 1)).unwrap();
    assert_eq!(store.bulk_calls.get(), 0);

    batch.add(action("t_0", 2)).unwrap();
    assert_eq!(store.bulk_calls.get(), 1);
    assert_eq!(store.documents("t_0").len(), 3);

    // The counters reset after a flush.
    batch.add(action("t_0", 3)).unwrap();
    assert_eq!(store.bulk_calls.get(), 1);
    batch.finish().unwrap();
    assert_eq!(store.bulk_calls.get(), 2);
    assert_eq!(store.documents("t_0").len(), 4);
}

#[test]
fn flushes_on_the_distinct_index_threshold() {
    let store = MemoryStore::new();
    let mut batch = Batch::with_limits(&store, 100, 3);

    batch.add(action("t_0", 0)).unwrap();
    batch.add(action("t_1", 1)).unwrap();
    // A repeated index does not grow the distinct set.
    batch.add(action("t_0", 2)).unwrap();
    assert_eq!(store.bulk_calls.get(), 0);

    batch.add(action("t_2", 3)).unwrap();
    assert_eq!(store.bulk_calls.get(), 1);
}

#[test]
fn finishing_an_empty_batch_sends_nothing() {
    let store = MemoryStore::new();
    let batch = Batch::new(&store);
    batch.finish().unwrap();
    assert_eq!(store.bulk_calls.get(), 0);
}

#[test]
fn dropping_a_batch_abandons_the_buffered_tail() {
    let store = MemoryStore::new();
    let mut batch = Batch::new(&store);
    batch.add(action("t_0", 0)).unwrap();
    drop(batch);
    assert_eq!(store.bulk_calls.get(), 0);
    assert!(store.documents("t_0").is_empty());
}

#[test]
fn rejected_bulk_requests_are_retried() {
    let store = MemoryStore::new();
    store.fail_bulk.set(2);
    let mut batch = Batch::new(&store).retry_delay(Duration::ZERO);
    batch.add(action("t_0", 0)).unwrap();
    batch.finish().unwrap();

    assert_eq!(store.bulk_calls.get(), 3);
    assert_eq!(store.documents("t_0").len(), 1);
}

#[test]
fn exhausted_retries_surface_as_bulk_failed() {
    let store = MemoryStore::new();
    store.fail_bulk.set(3);
    let mut batch = Batch::new(&store).retry_delay(Duration::ZERO);
    batch.add(action("t_0", 0)).unwrap();
    let failure = batch.finish().unwrap_err();

    assert!(matches!(failure, Error::BulkFailed { attempts: 3, .. }));
    assert_eq!(store.bulk_calls.get(), 3);
    assert!(store.documents("t_0").is_empty());
}
