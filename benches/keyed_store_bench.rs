// Keyed record store and read benchmarks for proxydb

use criterion::{criterion_group, criterion_main, Criterion};
use proxydb::{Environment, FeedKey, KeyRange, KeyedRecordStore, Options, Transaction};
use rand::Rng;
use std::hint::black_box;
use tempfile::TempDir;

fn benchmark_get_existing_id(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), Options::default()).unwrap();
    let store: KeyedRecordStore<u32, FeedKey> = KeyedRecordStore::open(&env, "feed").unwrap();
    let feeds: Vec<FeedKey> = (0..1000).map(|i| FeedKey::new(format!("FEED-{}", i), None)).collect();
    for feed in &feeds {
        store.get_or_create_id(feed).unwrap();
    }

    let mut rng = rand::rng();
    c.bench_function("get_or_create_existing", |b| {
        b.iter(|| {
            let feed = &feeds[rng.random_range(0..feeds.len())];
            black_box(store.get_or_create_id(feed).unwrap());
        });
    });
}

fn benchmark_point_reads(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), Options::default()).unwrap();
    let table = env.open_table("bench").unwrap();
    env.execute(move |txn| {
        for i in 0..10_000u32 {
            txn.put(table, &i.to_be_bytes(), &[0u8; 100])?;
        }
        Ok(())
    })
    .unwrap();
    env.sync().unwrap();

    let mut rng = rand::rng();
    c.bench_function("point_read", |b| {
        b.iter(|| {
            let key = rng.random_range(0..10_000u32).to_be_bytes();
            black_box(env.read(|txn| Ok(txn.get(table, &key))).unwrap());
        });
    });

    c.bench_function("full_scan_count", |b| {
        b.iter(|| black_box(env.read(|txn| Ok(txn.count(table, &KeyRange::all()))).unwrap()));
    });
}

criterion_group!(benches, benchmark_get_existing_id, benchmark_point_reads);
criterion_main!(benches);
