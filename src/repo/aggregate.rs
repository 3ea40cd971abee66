//! Aggregates: size, count and age bounded batches of items for one feed.
//!
//! Keys are `[feed_id: u32][create_time_ms: u64][disambiguator: u64]`, all
//! big-endian, so a feed's aggregates are contiguous and ordered oldest
//! first. Items are packed first-fit: the oldest open aggregate with room
//! takes the item.

use crate::codec::Codec;
use crate::config::{AggregatorConfig, CloseMode};
use crate::env::{Environment, Table};
use crate::error::{Error, Result};
use crate::queue::{DurableQueue, QueueAppender};
use crate::row_key::RowKeyGenerator;
use crate::txn::{Direction, KeyRange, Transaction, WriteTxn};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Identity of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    /// Feed the aggregate belongs to
    pub feed_id: u32,
    /// Creation time in milliseconds since the epoch
    pub create_time_ms: u64,
    /// Tie-breaker between aggregates created in the same millisecond
    pub disambiguator: u64,
}

impl AggregateKey {
    /// Encoded width in bytes.
    pub const WIDTH: usize = 20;
}

impl Codec for AggregateKey {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.feed_id);
        buf.put_u64(self.create_time_ms);
        buf.put_u64(self.disambiguator);
    }

    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIDTH {
            return Err(Error::Serialization(format!("aggregate key needs 20 bytes, got {}", bytes.len())));
        }
        Ok(Self { feed_id: bytes.get_u32(), create_time_ms: bytes.get_u64(), disambiguator: bytes.get_u64() })
    }
}

/// Fill state of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateValue {
    /// Sum of the byte sizes of the items
    pub byte_size: u64,
    /// Number of items
    pub items: u32,
    /// Closed and published for forwarding
    pub complete: bool,
}

impl AggregateValue {
    /// Returns true if an open aggregate can take one more item of `size` bytes.
    pub fn can_absorb(&self, size: u64, config: &AggregatorConfig) -> bool {
        !self.complete
            && self.items < config.max_items_per_aggregate
            && self.byte_size.saturating_add(size) <= config.max_bytes_per_aggregate
    }

    /// Returns true if the sweep should close this aggregate at `now_ms`.
    pub fn is_due(&self, key: &AggregateKey, now_ms: u64, config: &AggregatorConfig) -> bool {
        if self.complete {
            return false;
        }
        let items_full = self.items >= config.max_items_per_aggregate;
        let bytes_full = self.byte_size >= config.max_bytes_per_aggregate;
        let stale = Duration::from_millis(now_ms.saturating_sub(key.create_time_ms)) >= config.max_aggregate_age;
        match config.close_mode {
            CloseMode::AnyThreshold => items_full || bytes_full || stale,
            CloseMode::AllThresholds => items_full && bytes_full && stale,
        }
    }
}

impl Codec for AggregateValue {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.byte_size);
        buf.put_u32(self.items);
        buf.put_u8(u8::from(self.complete));
    }

    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 13 {
            return Err(Error::Serialization(format!("aggregate value needs 13 bytes, got {}", bytes.len())));
        }
        Ok(Self { byte_size: bytes.get_u64(), items: bytes.get_u32(), complete: bytes.get_u8() != 0 })
    }
}

/// Writer-side packing logic, usable from inside write commands.
#[derive(Clone)]
pub struct AggregatePacker {
    table: Table,
    new_aggregates: QueueAppender<AggregateKey>,
    disambiguator: Arc<RowKeyGenerator<u64>>,
    config: AggregatorConfig,
}

impl AggregatePacker {
    /// Folds an item into the first open aggregate of `feed_id` with room,
    /// or into a new one. Returns the aggregate the item landed in.
    ///
    /// An item larger than the byte bound gets an aggregate of its own that
    /// is closed and published immediately.
    pub fn add_item(&self, txn: &mut WriteTxn<'_>, feed_id: u32, byte_size: u64, now_ms: u64) -> Result<AggregateKey> {
        if byte_size > self.config.max_bytes_per_aggregate {
            let key = self.new_key(txn, feed_id, now_ms)?;
            let value = AggregateValue { byte_size, items: 1, complete: true };
            txn.put(self.table, &key.to_bytes(), &value.to_bytes())?;
            self.new_aggregates.put(txn, &key)?;
            log::debug!("Oversized item of {} bytes published as aggregate {:?}", byte_size, key);
            return Ok(key);
        }

        let mut found = None;
        for (key, value) in txn.scan(self.table, &KeyRange::prefix(&feed_id.to_be_bytes()), Direction::Forward) {
            let value = AggregateValue::decode(&value)?;
            if value.can_absorb(byte_size, &self.config) {
                found = Some((AggregateKey::decode(&key)?, value));
                break;
            }
        }

        let (key, value) = match found {
            Some((key, value)) => {
                (key, AggregateValue { byte_size: value.byte_size + byte_size, items: value.items + 1, complete: false })
            }
            None => (self.new_key(txn, feed_id, now_ms)?, AggregateValue { byte_size, items: 1, complete: false }),
        };
        txn.put(self.table, &key.to_bytes(), &value.to_bytes())?;
        Ok(key)
    }

    /// Closes every open aggregate the sweep considers due and publishes it.
    pub fn close_due(&self, txn: &mut WriteTxn<'_>, now_ms: u64) -> Result<usize> {
        let mut due = Vec::new();
        for (key, value) in txn.scan(self.table, &KeyRange::all(), Direction::Forward) {
            let key = AggregateKey::decode(&key)?;
            let value = AggregateValue::decode(&value)?;
            if value.is_due(&key, now_ms, &self.config) {
                due.push((key, value));
            }
        }

        for (key, value) in &due {
            let closed = AggregateValue { complete: true, ..*value };
            txn.put(self.table, &key.to_bytes(), &closed.to_bytes())?;
            self.new_aggregates.put(txn, key)?;
        }
        Ok(due.len())
    }

    fn new_key(&self, txn: &mut WriteTxn<'_>, feed_id: u32, now_ms: u64) -> Result<AggregateKey> {
        let disambiguator = self.disambiguator.next_in(txn)?;
        Ok(AggregateKey { feed_id, create_time_ms: now_ms, disambiguator })
    }
}

/// Aggregate table plus the new and deletable aggregate queues.
pub struct AggregateDao {
    env: Arc<Environment>,
    packer: AggregatePacker,
    new_aggregates: DurableQueue<AggregateKey>,
    deletable_aggregates: DurableQueue<AggregateKey>,
}

impl AggregateDao {
    /// Opens the `aggregate`, `new-aggregate` and `deletable-aggregate` tables.
    pub fn open(env: &Arc<Environment>, config: AggregatorConfig, queue_delete_batch_size: u64) -> Result<Self> {
        let table = env.open_table("aggregate")?;
        let new_aggregates = DurableQueue::open(env, "new-aggregate", queue_delete_batch_size)?;
        let deletable_aggregates = DurableQueue::open(env, "deletable-aggregate", queue_delete_batch_size)?;

        let marks = env.open_table(super::ROW_KEY_TABLE)?;
        let disambiguator = env.read(|txn| {
            let mut last = None;
            for (key, _) in txn.scan(table, &KeyRange::all(), Direction::Forward) {
                last = last.max(Some(AggregateKey::decode(&key)?.disambiguator));
            }
            RowKeyGenerator::durable_from_txn(txn, last, marks, "aggregate")
        })?;

        let packer = AggregatePacker {
            table,
            new_aggregates: new_aggregates.appender(),
            disambiguator: Arc::new(disambiguator),
            config,
        };
        Ok(Self { env: Arc::clone(env), packer, new_aggregates, deletable_aggregates })
    }

    /// Packing logic for use inside write commands.
    pub fn packer(&self) -> &AggregatePacker {
        &self.packer
    }

    /// Folds one item into an aggregate of `feed_id`.
    pub fn add_item(&self, feed_id: u32, byte_size: u64) -> Result<AggregateKey> {
        let packer = self.packer.clone();
        let now = super::now_ms();
        self.env.execute(move |txn| packer.add_item(txn, feed_id, byte_size, now))
    }

    /// Closes due aggregates as of now. Returns how many were closed.
    pub fn close_aggregates(&self) -> Result<usize> {
        self.close_aggregates_at(super::now_ms())
    }

    /// Closes aggregates due at `now_ms`. Returns how many were closed.
    pub fn close_aggregates_at(&self, now_ms: u64) -> Result<usize> {
        let packer = self.packer.clone();
        let closed = self.env.execute(move |txn| packer.close_due(txn, now_ms))?;
        if closed > 0 {
            log::debug!("Closed {} aggregates", closed);
        }
        Ok(closed)
    }

    /// Fill state of one aggregate.
    pub fn get(&self, key: &AggregateKey) -> Result<Option<AggregateValue>> {
        let bytes = key.to_bytes();
        self.env
            .read(|txn| txn.get(self.packer.table, &bytes).map(|value| AggregateValue::decode(&value)).transpose())
    }

    /// Every aggregate in key order.
    pub fn get_all(&self) -> Result<Vec<(AggregateKey, AggregateValue)>> {
        self.env.read(|txn| {
            txn.scan(self.packer.table, &KeyRange::all(), Direction::Forward)
                .map(|(key, value)| Ok((AggregateKey::decode(&key)?, AggregateValue::decode(&value)?)))
                .collect()
        })
    }

    /// Number of aggregates, open and complete.
    pub fn count(&self) -> Result<usize> {
        self.env.read(|txn| Ok(txn.count(self.packer.table, &KeyRange::all())))
    }

    /// Blocks until a completed aggregate is ready to forward.
    pub fn get_new_aggregate(&self) -> Result<AggregateKey> {
        self.new_aggregates.take()
    }

    /// Like [`AggregateDao::get_new_aggregate`], giving up after `timeout`.
    pub fn get_new_aggregate_timeout(&self, timeout: Duration) -> Result<Option<AggregateKey>> {
        self.new_aggregates.take_timeout(timeout)
    }

    /// Records that an aggregate was forwarded and may be deleted.
    pub fn set_aggregate_forwarded(&self, key: &AggregateKey) -> Result<()> {
        self.deletable_aggregates.put(key)
    }

    /// Blocks until a forwarded aggregate is ready to delete.
    pub fn get_deletable_aggregate(&self) -> Result<AggregateKey> {
        self.deletable_aggregates.take()
    }

    /// Like [`AggregateDao::get_deletable_aggregate`], giving up after `timeout`.
    pub fn get_deletable_aggregate_timeout(&self, timeout: Duration) -> Result<Option<AggregateKey>> {
        self.deletable_aggregates.take_timeout(timeout)
    }

    /// Deletes an aggregate record. Returns true if it existed.
    pub fn delete_aggregate(&self, key: &AggregateKey) -> Result<bool> {
        let (table, bytes) = (self.packer.table, key.to_bytes());
        self.env.execute(move |txn| Ok(txn.delete(table, &bytes)))
    }

    /// Removes every aggregate and empties both queues.
    pub fn clear(&self) -> Result<()> {
        let table = self.packer.table;
        let disambiguator = Arc::clone(&self.packer.disambiguator);
        self.env.execute(move |txn| {
            txn.clear_table(table);
            disambiguator.reset_in(txn);
            Ok(())
        })?;
        self.new_aggregates.clear()?;
        self.deletable_aggregates.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn config(max_items: u32, max_bytes: u64) -> AggregatorConfig {
        AggregatorConfig {
            max_items_per_aggregate: max_items,
            max_bytes_per_aggregate: max_bytes,
            max_aggregate_age: Duration::from_secs(60),
            close_mode: CloseMode::AnyThreshold,
        }
    }

    fn open(config: AggregatorConfig) -> (TempDir, Arc<Environment>, AggregateDao) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Options::default()).unwrap();
        let dao = AggregateDao::open(&env, config, 100).unwrap();
        (dir, env, dao)
    }

    #[test]
    fn test_key_order_groups_by_feed_then_age() {
        let a = AggregateKey { feed_id: 1, create_time_ms: 500, disambiguator: 9 };
        let b = AggregateKey { feed_id: 1, create_time_ms: 600, disambiguator: 1 };
        let c = AggregateKey { feed_id: 2, create_time_ms: 1, disambiguator: 1 };
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
        assert_eq!(AggregateKey::decode(&b.to_bytes()).unwrap(), b);
    }

    #[test]
    fn test_fourth_item_opens_second_aggregate() {
        let (_dir, env, dao) = open(config(3, 1000));

        let first = dao.add_item(7, 100).unwrap();
        assert_eq!(dao.add_item(7, 100).unwrap(), first);
        assert_eq!(dao.add_item(7, 100).unwrap(), first);
        env.sync().unwrap();
        assert_eq!(dao.get(&first).unwrap(), Some(AggregateValue { byte_size: 300, items: 3, complete: false }));
        assert_eq!(dao.count().unwrap(), 1);

        let second = dao.add_item(7, 100).unwrap();
        assert_ne!(second, first);
        assert_eq!(second.feed_id, 7);
    }

    #[test]
    fn test_feeds_are_packed_separately() {
        let (_dir, _env, dao) = open(config(10, 1000));
        let a = dao.add_item(1, 10).unwrap();
        let b = dao.add_item(2, 10).unwrap();
        assert_ne!(a, b);
        assert_eq!(dao.add_item(1, 10).unwrap(), a);
    }

    #[test]
    fn test_first_fit_prefers_oldest_with_room() {
        let (_dir, _env, dao) = open(config(10, 100));
        let first = dao.add_item(1, 90).unwrap();
        let second = dao.add_item(1, 50).unwrap();
        assert_ne!(first, second);

        // Fits the first aggregate again.
        assert_eq!(dao.add_item(1, 10).unwrap(), first);
        assert_eq!(dao.add_item(1, 10).unwrap(), second);
    }

    #[test]
    fn test_oversized_item_is_published_immediately() {
        let (_dir, env, dao) = open(config(10, 100));
        let key = dao.add_item(1, 500).unwrap();
        env.sync().unwrap();

        assert_eq!(dao.get_new_aggregate_timeout(Duration::from_secs(1)).unwrap(), Some(key));
        assert!(dao.get(&key).unwrap().unwrap().complete);
    }

    #[test]
    fn test_close_modes() {
        let cfg = config(2, 1000);
        let key = AggregateKey { feed_id: 1, create_time_ms: 0, disambiguator: 1 };
        let full = AggregateValue { byte_size: 10, items: 2, complete: false };
        let young = 1_000;

        assert!(full.is_due(&key, young, &cfg));
        assert!(!full.is_due(&key, young, &AggregatorConfig { close_mode: CloseMode::AllThresholds, ..cfg.clone() }));

        let partial = AggregateValue { byte_size: 10, items: 1, complete: false };
        assert!(!partial.is_due(&key, young, &cfg));
        assert!(partial.is_due(&key, 61_000, &cfg));

        let closed = AggregateValue { complete: true, ..full };
        assert!(!closed.is_due(&key, 61_000, &cfg));
    }

    #[test]
    fn test_close_aggregates_publishes_once() {
        let (_dir, env, dao) = open(config(2, 1000));
        let key = dao.add_item(3, 1).unwrap();
        dao.add_item(3, 1).unwrap();

        assert_eq!(dao.close_aggregates_at(key.create_time_ms).unwrap(), 1);
        assert_eq!(dao.close_aggregates_at(key.create_time_ms).unwrap(), 0);
        env.sync().unwrap();

        assert_eq!(dao.get_new_aggregate().unwrap(), key);
        assert_eq!(dao.get_new_aggregate_timeout(Duration::from_millis(20)).unwrap(), None);

        // A closed aggregate takes no more items.
        assert_ne!(dao.add_item(3, 1).unwrap(), key);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_open_aggregates_stay_within_bounds(
            sizes in prop::collection::vec((0u32..3, 1u64..400), 1..60),
            max_items in 1u32..6,
        ) {
            let (_dir, env, dao) = open(config(max_items, 1000));
            for (feed, size) in sizes {
                dao.add_item(feed, size).unwrap();
            }
            env.sync().unwrap();

            for (_, value) in dao.get_all().unwrap() {
                if !value.complete {
                    prop_assert!(value.items <= max_items);
                    prop_assert!(value.byte_size <= 1000);
                }
            }
        }
    }
}
