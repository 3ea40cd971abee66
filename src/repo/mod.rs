//! Proxy repository: feeds, sources, items and aggregates on one environment.
//!
//! Every table lives in a single [`Environment`], so all state changes share
//! one commit stream. Reference data (feeds and forward destinations) is
//! deduplicated through [`KeyedRecordStore`]; lifecycle hand-offs between
//! pipeline stages go through [`DurableQueue`](crate::queue::DurableQueue)s.

pub mod aggregate;
pub mod feed;
pub mod source;

pub use aggregate::{AggregateDao, AggregateKey, AggregatePacker, AggregateValue};
pub use feed::{FeedKey, ForwardDest};
pub use source::{SourceDao, SourceItem, SourceItemKey, SourceRecord};

use crate::config::RepoConfig;
use crate::env::Environment;
use crate::error::Result;
use crate::keyed_store::KeyedRecordStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// High-water marks of the source ids and aggregate disambiguators.
pub(crate) const ROW_KEY_TABLE: &str = "row-key";

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_millis() as u64).unwrap_or(0)
}

/// Durable state of one proxy instance.
///
/// # Example
///
/// ```rust,no_run
/// use proxydb::{ProxyRepo, RepoConfig, SourceItem};
///
/// # fn main() -> Result<(), proxydb::Error> {
/// let repo = ProxyRepo::open(RepoConfig::new("./proxy-data"))?;
/// let feed = repo.get_or_create_feed("TEST-EVENTS", None)?;
///
/// repo.add_source(42, feed)?;
/// let source = repo.get_next_source()?;
/// repo.set_source_examined(source, vec![SourceItem::new("001.dat", feed, 512)])?;
/// repo.aggregate_source(repo.get_next_examined_source()?)?;
/// repo.close()?;
/// # Ok(())
/// # }
/// ```
pub struct ProxyRepo {
    env: Arc<Environment>,
    config: RepoConfig,
    feeds: KeyedRecordStore<u32, FeedKey>,
    forward_dests: KeyedRecordStore<u32, ForwardDest>,
    sources: SourceDao,
    aggregates: AggregateDao,
}

impl ProxyRepo {
    /// Opens (or creates) the repository at `config.db_dir`.
    pub fn open(config: RepoConfig) -> Result<Self> {
        config.validate()?;
        let env = Environment::open(&config.db_dir, config.options.clone())?;
        let batch = config.queue_delete_batch_size;

        let feeds = KeyedRecordStore::open(&env, "feed")?;
        let forward_dests = KeyedRecordStore::open(&env, "forward-dest")?;
        let sources = SourceDao::open(&env, batch)?;
        let aggregates = AggregateDao::open(&env, config.aggregator.clone(), batch)?;

        log::info!("Opened proxy repository at {:?}", config.db_dir);
        Ok(Self { env, config, feeds, forward_dests, sources, aggregates })
    }

    /// Underlying environment.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Configuration the repository was opened with.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Feed reference store.
    pub fn feeds(&self) -> &KeyedRecordStore<u32, FeedKey> {
        &self.feeds
    }

    /// Forward destination reference store.
    pub fn forward_dests(&self) -> &KeyedRecordStore<u32, ForwardDest> {
        &self.forward_dests
    }

    /// Source tables and queues.
    pub fn sources(&self) -> &SourceDao {
        &self.sources
    }

    /// Aggregate table and queues.
    pub fn aggregates(&self) -> &AggregateDao {
        &self.aggregates
    }

    /// Id of the feed, creating it if needed.
    pub fn get_or_create_feed(&self, feed: &str, type_name: Option<&str>) -> Result<u32> {
        self.feeds.get_or_create_id(&FeedKey::new(feed, type_name))
    }

    /// Feed by id.
    pub fn get_feed(&self, id: u32) -> Result<Option<FeedKey>> {
        self.feeds.get(id)
    }

    /// Id of the forward destination, creating it if needed.
    pub fn get_or_create_forward_dest(&self, name: &str) -> Result<u32> {
        self.forward_dests.get_or_create_id(&ForwardDest { name: name.to_string() })
    }

    /// Forward destination by id.
    pub fn get_forward_dest(&self, id: u32) -> Result<Option<ForwardDest>> {
        self.forward_dests.get(id)
    }

    /// Registers a source on a feed and queues it for examination.
    pub fn add_source(&self, store_id: u64, feed_id: u32) -> Result<u64> {
        self.sources.add_source(store_id, feed_id)
    }

    /// Blocks until a new source is available.
    pub fn get_next_source(&self) -> Result<u64> {
        self.sources.get_next_source()
    }

    /// Like [`ProxyRepo::get_next_source`], giving up after `timeout`.
    pub fn get_next_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.sources.get_next_source_timeout(timeout)
    }

    /// Records the items found in a source.
    pub fn set_source_examined(&self, source_id: u64, items: Vec<SourceItem>) -> Result<()> {
        self.sources.set_source_examined(source_id, items)
    }

    /// Blocks until an examined source is available.
    pub fn get_next_examined_source(&self) -> Result<u64> {
        self.sources.get_next_examined_source()
    }

    /// Like [`ProxyRepo::get_next_examined_source`], giving up after `timeout`.
    pub fn get_next_examined_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.sources.get_next_examined_source_timeout(timeout)
    }

    /// Folds the items of an examined source into aggregates and queues the
    /// source for deletion. Returns the number of items assigned.
    pub fn aggregate_source(&self, source_id: u64) -> Result<usize> {
        self.sources.aggregate_source(source_id, self.aggregates.packer(), now_ms())
    }

    /// Closes aggregates that reached a bound or aged out.
    pub fn close_aggregates(&self) -> Result<usize> {
        self.aggregates.close_aggregates()
    }

    /// Blocks until a completed aggregate is ready to forward.
    pub fn get_new_aggregate(&self) -> Result<AggregateKey> {
        self.aggregates.get_new_aggregate()
    }

    /// Like [`ProxyRepo::get_new_aggregate`], giving up after `timeout`.
    pub fn get_new_aggregate_timeout(&self, timeout: Duration) -> Result<Option<AggregateKey>> {
        self.aggregates.get_new_aggregate_timeout(timeout)
    }

    /// Marks an aggregate as forwarded.
    pub fn set_aggregate_forwarded(&self, key: &AggregateKey) -> Result<()> {
        self.aggregates.set_aggregate_forwarded(key)
    }

    /// Blocks until a forwarded aggregate is ready to delete.
    pub fn get_deletable_aggregate(&self) -> Result<AggregateKey> {
        self.aggregates.get_deletable_aggregate()
    }

    /// Like [`ProxyRepo::get_deletable_aggregate`], giving up after `timeout`.
    pub fn get_deletable_aggregate_timeout(&self, timeout: Duration) -> Result<Option<AggregateKey>> {
        self.aggregates.get_deletable_aggregate_timeout(timeout)
    }

    /// Deletes an aggregate record.
    pub fn delete_aggregate(&self, key: &AggregateKey) -> Result<bool> {
        self.aggregates.delete_aggregate(key)
    }

    /// Blocks until a source is ready for deletion.
    pub fn get_deletable_source(&self) -> Result<u64> {
        self.sources.get_deletable_source()
    }

    /// Like [`ProxyRepo::get_deletable_source`], giving up after `timeout`.
    pub fn get_deletable_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.sources.get_deletable_source_timeout(timeout)
    }

    /// Deletes a source and its items.
    pub fn delete_source(&self, source_id: u64) -> Result<bool> {
        self.sources.delete_source(source_id)
    }

    /// Removes all repository state.
    pub fn clear(&self) -> Result<()> {
        self.sources.clear()?;
        self.aggregates.clear()?;
        self.feeds.clear()?;
        self.forward_dests.clear()?;
        self.env.sync()
    }

    /// Waits until everything written so far is durable.
    pub fn sync(&self) -> Result<()> {
        self.env.sync()
    }

    /// Closes the environment, waking blocked consumers.
    pub fn close(&self) -> Result<()> {
        self.env.close()
    }
}
