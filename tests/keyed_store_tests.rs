// Keyed Record Store Tests for proxydb
// These tests verify id allocation and get-or-create deduplication

use proxydb::{Environment, FeedKey, KeyedRecordStore, Options};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Test that concurrent get-or-create calls agree on one id per value
#[test]
fn test_concurrent_get_or_create_is_unique() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), Options::default()).unwrap();
    let store: KeyedRecordStore<u32, FeedKey> = KeyedRecordStore::open(&env, "feed").unwrap();

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..20)
                    .map(|i| store.get_or_create_id(&FeedKey::new(format!("FEED-{}", i), None)).unwrap())
                    .collect::<Vec<u32>>()
            })
        })
        .collect();

    let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for ids in &results[1..] {
        assert_eq!(ids, &results[0]);
    }

    let distinct: HashSet<u32> = results[0].iter().copied().collect();
    assert_eq!(distinct.len(), 20);
    assert_eq!(store.count().unwrap(), 20);
}

/// Test that ids survive a restart and are never reused
#[test]
fn test_ids_stable_across_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    let (a, b) = {
        let env = Environment::open(&path, Options::default()).unwrap();
        let store: KeyedRecordStore<u32, FeedKey> = KeyedRecordStore::open(&env, "feed").unwrap();
        let a = store.get_or_create_id(&FeedKey::new("A", None)).unwrap();
        let b = store.get_or_create_id(&FeedKey::new("B", Some("Raw"))).unwrap();
        env.close().unwrap();
        (a, b)
    };

    let env = Environment::open(&path, Options::default()).unwrap();
    let store: KeyedRecordStore<u32, FeedKey> = KeyedRecordStore::open(&env, "feed").unwrap();
    assert_eq!(store.get_id(&FeedKey::new("A", None)).unwrap(), Some(a));
    assert_eq!(store.get_or_create_id(&FeedKey::new("B", Some("Raw"))).unwrap(), b);
    assert_eq!(store.get(a).unwrap(), Some(FeedKey::new("A", None)));

    let c = store.get_or_create_id(&FeedKey::new("C", None)).unwrap();
    assert!(c > a && c > b);
}

/// Test lookups of values that were never stored
#[test]
fn test_missing_values() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), Options::default()).unwrap();
    let store: KeyedRecordStore<u64, String> = KeyedRecordStore::open(&env, "names").unwrap();

    assert_eq!(store.get_id(&"nobody".to_string()).unwrap(), None);
    assert_eq!(store.get(1).unwrap(), None);

    let id = store.get_or_create_id(&"somebody".to_string()).unwrap();
    assert_eq!(id, 1);
    let mut seen = Vec::new();
    store.get_all(|id, name| seen.push((id, name))).unwrap();
    assert_eq!(seen, vec![(1, "somebody".to_string())]);
}
