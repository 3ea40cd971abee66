// Aggregation Tests for proxydb
// These tests drive the proxy repository through its full pipeline

use proptest::prelude::*;
use proxydb::{AggregatorConfig, CloseMode, Options, ProxyRepo, RepoConfig, SourceItem};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(dir: &TempDir, max_items: u32, max_bytes: u64) -> ProxyRepo {
    let aggregator = AggregatorConfig {
        max_items_per_aggregate: max_items,
        max_bytes_per_aggregate: max_bytes,
        max_aggregate_age: Duration::from_secs(3600),
        close_mode: CloseMode::AnyThreshold,
    };
    let config = RepoConfig::new(dir.path())
        .options(Options::default().auto_commit(1000, Duration::from_millis(10)))
        .aggregator(aggregator)
        .queue_delete_batch_size(10);
    ProxyRepo::open(config).unwrap()
}

/// Runs sources through examination and aggregation; returns their ids.
fn ingest(repo: &ProxyRepo, feed: u32, sources: &[Vec<u64>]) -> Vec<u64> {
    let mut ids = Vec::new();
    for (n, sizes) in sources.iter().enumerate() {
        let id = repo.add_source(n as u64, feed).unwrap();
        assert_eq!(repo.get_next_source_timeout(WAIT).unwrap(), Some(id));
        let items = sizes.iter().enumerate().map(|(i, size)| SourceItem::new(format!("{}", i), feed, *size)).collect();
        repo.set_source_examined(id, items).unwrap();
        ids.push(id);
    }
    for (&id, sizes) in ids.iter().zip(sources) {
        if sizes.is_empty() {
            continue;
        }
        assert_eq!(repo.get_next_examined_source_timeout(WAIT).unwrap(), Some(id));
        repo.aggregate_source(id).unwrap();
    }
    repo.sync().unwrap();
    ids
}

/// Test that every item lands in exactly one aggregate and totals add up
#[test]
fn test_items_are_accounted_for() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, 5, 1000);
    let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();

    let mut rng = rand::rng();
    let sources: Vec<Vec<u64>> =
        (0..10).map(|_| (0..rng.random_range(1..8)).map(|_| rng.random_range(1..400)).collect()).collect();
    let ids = ingest(&repo, feed, &sources);

    let mut per_aggregate: HashMap<_, (u64, u32)> = HashMap::new();
    for &id in &ids {
        for (_, item) in repo.sources().get_items(id).unwrap() {
            let entry = per_aggregate.entry(item.aggregate.unwrap()).or_default();
            entry.0 += item.byte_size;
            entry.1 += 1;
        }
    }

    let aggregates = repo.aggregates().get_all().unwrap();
    assert_eq!(aggregates.len(), per_aggregate.len());
    for (key, value) in aggregates {
        assert_eq!(per_aggregate[&key], (value.byte_size, value.items));
        assert!(value.items <= 5);
        assert!(value.byte_size <= 1000);
    }
}

/// Test the full forward and delete cycle
#[test]
fn test_forward_and_delete_cycle() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, 2, 1000);
    let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();
    let dest = repo.get_or_create_forward_dest("downstream").unwrap();
    assert_eq!(repo.get_forward_dest(dest).unwrap().unwrap().name, "downstream");

    let ids = ingest(&repo, feed, &[vec![10, 10, 10, 10], vec![]]);

    // The empty source is deletable straight after examination
    let mut deletable = Vec::new();
    while let Some(id) = repo.get_deletable_source_timeout(Duration::from_millis(200)).unwrap() {
        deletable.push(id);
    }
    deletable.sort_unstable();
    assert_eq!(deletable, ids);

    assert_eq!(repo.close_aggregates().unwrap(), 2);
    assert_eq!(repo.close_aggregates().unwrap(), 0);

    for _ in 0..2 {
        let key = repo.get_new_aggregate_timeout(WAIT).unwrap().unwrap();
        repo.set_aggregate_forwarded(&key).unwrap();
    }
    for _ in 0..2 {
        let key = repo.get_deletable_aggregate_timeout(WAIT).unwrap().unwrap();
        assert!(repo.delete_aggregate(&key).unwrap());
    }
    for id in ids {
        assert!(repo.delete_source(id).unwrap());
    }
    repo.sync().unwrap();

    assert_eq!(repo.aggregates().count().unwrap(), 0);
    assert_eq!(repo.sources().count().unwrap(), 0);
}

/// Test that oversized items bypass packing
#[test]
fn test_oversized_items_are_forwarded_alone() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, 10, 100);
    let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();

    ingest(&repo, feed, &[vec![50, 5000, 40]]);

    let key = repo.get_new_aggregate_timeout(WAIT).unwrap().unwrap();
    let value = repo.aggregates().get(&key).unwrap().unwrap();
    assert!(value.complete);
    assert_eq!((value.items, value.byte_size), (1, 5000));

    // The small items share one open aggregate
    let open: Vec<_> = repo.aggregates().get_all().unwrap().into_iter().filter(|(_, v)| !v.complete).collect();
    assert_eq!(open.len(), 1);
    assert_eq!((open[0].1.items, open[0].1.byte_size), (2, 90));
}

/// Test that aggregation state survives a restart
#[test]
fn test_aggregates_survive_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let before = {
        let repo = open(&dir, 3, 1000);
        let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();
        ingest(&repo, feed, &[vec![100, 100]]);
        let all = repo.aggregates().get_all().unwrap();
        repo.close().unwrap();
        all
    };

    let repo = open(&dir, 3, 1000);
    assert_eq!(repo.aggregates().get_all().unwrap(), before);

    // A new item still fits into the reopened aggregate
    let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();
    let key = repo.aggregates().add_item(feed, 100).unwrap();
    assert_eq!(key, before[0].0);

    // New aggregates get fresh disambiguators
    let key = repo.aggregates().add_item(feed, 100).unwrap();
    assert!(key.disambiguator > before[0].0.disambiguator);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Open aggregates never exceed their bounds, whatever the item sizes.
    #[test]
    fn prop_open_aggregates_respect_bounds(sizes in prop::collection::vec(1u64..300, 1..40)) {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir, 4, 500);
        let feed = repo.get_or_create_feed("TEST-EVENTS", None).unwrap();
        for size in &sizes {
            repo.aggregates().add_item(feed, *size).unwrap();
        }
        repo.sync().unwrap();

        let all = repo.aggregates().get_all().unwrap();
        let total: u64 = all.iter().map(|(_, v)| v.byte_size).sum();
        let items: u32 = all.iter().map(|(_, v)| v.items).sum();
        prop_assert_eq!(total, sizes.iter().sum::<u64>());
        prop_assert_eq!(items as usize, sizes.len());
        for (_, value) in all {
            prop_assert!(value.items <= 4);
            prop_assert!(value.byte_size <= 500);
        }
    }
}
