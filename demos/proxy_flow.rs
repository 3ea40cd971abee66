//! Proxy pipeline walkthrough for proxydb
//!
//! Runs a few sources through every stage with one thread per stage:
//! ingestion, examination, aggregation, forwarding and cleanup.

use anyhow::Context;
use proxydb::{AggregatorConfig, ProxyRepo, RepoConfig, SourceItem};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SOURCES: u64 = 20;

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init();

    let aggregator = AggregatorConfig {
        max_items_per_aggregate: 10,
        max_bytes_per_aggregate: 64 * 1024,
        max_aggregate_age: Duration::from_secs(2),
        ..AggregatorConfig::default()
    };
    let config = RepoConfig::new("./proxy_flow_data").aggregator(aggregator);
    let repo = Arc::new(ProxyRepo::open(config).context("opening repository")?);

    let feed = repo.get_or_create_feed("DEMO-EVENTS", Some("Raw Events"))?;
    let dest = repo.get_or_create_forward_dest("http://localhost:8080/datafeed")?;
    println!("Feed id {}, destination id {}", feed, dest);

    // Examiner: discovers the items inside each new source
    let examiner = {
        let repo = Arc::clone(&repo);
        thread::spawn(move || -> anyhow::Result<()> {
            for n in 0..SOURCES {
                let source = repo.get_next_source()?;
                let items = (0..(n % 5))
                    .map(|i| SourceItem::new(format!("{:03}.dat", i), feed, 1024 * (i + 1)))
                    .collect();
                repo.set_source_examined(source, items)?;
            }
            Ok(())
        })
    };

    // Aggregator: packs examined sources until nothing new arrives
    let packer = {
        let repo = Arc::clone(&repo);
        thread::spawn(move || -> anyhow::Result<usize> {
            let mut items = 0;
            while let Some(source) = repo.get_next_examined_source_timeout(Duration::from_secs(1))? {
                items += repo.aggregate_source(source)?;
            }
            Ok(items)
        })
    };

    for n in 0..SOURCES {
        repo.add_source(1000 + n, feed)?;
    }
    examiner.join().map_err(|_| anyhow::anyhow!("examiner panicked"))??;
    let items = packer.join().map_err(|_| anyhow::anyhow!("aggregator panicked"))??;
    println!("Packed {} items into {} aggregates", items, repo.aggregates().count()?);

    // Forwarder: close whatever is due and pretend to send it
    thread::sleep(Duration::from_secs(2));
    let closed = repo.close_aggregates()?;
    println!("Closed {} aggregates", closed);
    while let Some(key) = repo.get_new_aggregate_timeout(Duration::from_millis(500))? {
        let value = repo.aggregates().get(&key)?.context("aggregate vanished")?;
        println!("Forwarding {:?}: {} items, {} bytes", key, value.items, value.byte_size);
        repo.set_aggregate_forwarded(&key)?;
    }

    // Cleanup
    while let Some(key) = repo.get_deletable_aggregate_timeout(Duration::from_millis(500))? {
        repo.delete_aggregate(&key)?;
    }
    let mut deleted = 0;
    while let Some(source) = repo.get_deletable_source_timeout(Duration::from_millis(500))? {
        repo.delete_source(source)?;
        deleted += 1;
    }
    println!("Deleted {} sources", deleted);

    println!("{}", repo.env().info()?.to_json()?);
    repo.close()?;
    Ok(())
}
