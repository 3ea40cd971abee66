// Queue and write-path benchmarks for proxydb

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use proxydb::{DurableQueue, Environment, Options};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

fn benchmark_write_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_commands");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let env = Environment::open(temp_dir.path(), Options::default()).unwrap();
            let table = env.open_table("bench").unwrap();

            b.iter(|| {
                for i in 0..size {
                    let key = format!("key{:08}", i);
                    env.write(move |txn| txn.put(table, key.as_bytes(), b"value").map(|_| ())).unwrap();
                }
                env.sync().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_queue_put_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_put_take");

    for size in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let env = Environment::open(temp_dir.path(), Options::default()).unwrap();
            let queue: DurableQueue<u64> = DurableQueue::open(&env, "bench", 1000).unwrap();

            b.iter(|| {
                for i in 0..size as u64 {
                    queue.put(&i).unwrap();
                }
                env.sync().unwrap();
                for _ in 0..size {
                    black_box(queue.take_timeout(Duration::from_secs(1)).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_write_commands, benchmark_queue_put_take);
criterion_main!(benches);
