//! Sources and the items extracted from them.
//!
//! A source moves through three queues: `new-source` when registered,
//! `examined-source` once its items are known (or straight to
//! `deletable-source` if it has none), and `deletable-source` after every
//! item has been assigned to an aggregate.

use super::aggregate::{AggregateKey, AggregatePacker};
use crate::codec::Codec;
use crate::env::{Environment, Table};
use crate::error::{Error, Result};
use crate::queue::{DurableQueue, QueueAppender};
use crate::row_key::RowKeyGenerator;
use crate::txn::{Direction, KeyRange, Transaction};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One inbound unit of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Id of the source data in the external file store
    pub store_id: u64,
    /// Feed the source arrived on
    pub feed_id: u32,
    /// Number of items, known once examined
    pub item_count: Option<u32>,
    /// Every item has been assigned to an aggregate
    pub aggregated: bool,
}

crate::bincode_codec!(SourceRecord);

/// Key of a source item: `[source_id: u64][item_index: u32]`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceItemKey {
    /// Owning source
    pub source_id: u64,
    /// Position of the item within its source
    pub item_index: u32,
}

impl Codec for SourceItemKey {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.source_id);
        buf.put_u32(self.item_index);
    }

    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 12 {
            return Err(Error::Serialization(format!("source item key needs 12 bytes, got {}", bytes.len())));
        }
        Ok(Self { source_id: bytes.get_u64(), item_index: bytes.get_u32() })
    }
}

/// One logical record extracted from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Entry name inside the source
    pub name: String,
    /// Feed the item belongs to
    pub feed_id: u32,
    /// Size in bytes
    pub byte_size: u64,
    /// Aggregate the item was assigned to
    pub aggregate: Option<AggregateKey>,
}

impl SourceItem {
    /// An item not yet assigned to an aggregate.
    pub fn new(name: impl Into<String>, feed_id: u32, byte_size: u64) -> Self {
        Self { name: name.into(), feed_id, byte_size, aggregate: None }
    }
}

crate::bincode_codec!(SourceItem);

/// Source and source item tables plus the source lifecycle queues.
pub struct SourceDao {
    env: Arc<Environment>,
    sources: Table,
    items: Table,
    keys: Arc<RowKeyGenerator<u64>>,
    new_sources: DurableQueue<u64>,
    examined_sources: DurableQueue<u64>,
    deletable_sources: DurableQueue<u64>,
}

impl SourceDao {
    /// Opens the source tables and queues.
    pub fn open(env: &Arc<Environment>, queue_delete_batch_size: u64) -> Result<Self> {
        let sources = env.open_table("source")?;
        let items = env.open_table("source-item")?;
        let marks = env.open_table(super::ROW_KEY_TABLE)?;
        let keys = Arc::new(RowKeyGenerator::open_durable(env, sources, marks, "source")?);

        Ok(Self {
            env: Arc::clone(env),
            sources,
            items,
            keys,
            new_sources: DurableQueue::open(env, "new-source", queue_delete_batch_size)?,
            examined_sources: DurableQueue::open(env, "examined-source", queue_delete_batch_size)?,
            deletable_sources: DurableQueue::open(env, "deletable-source", queue_delete_batch_size)?,
        })
    }

    /// Registers a source and queues it for examination. Durable on return.
    pub fn add_source(&self, store_id: u64, feed_id: u32) -> Result<u64> {
        let (sources, keys, new_sources) = (self.sources, Arc::clone(&self.keys), self.new_sources.appender());
        let id = self.env.execute(move |txn| {
            let id = keys.next_in(txn)?;
            let record = SourceRecord { store_id, feed_id, item_count: None, aggregated: false };
            txn.put(sources, &id.to_bytes(), &record.try_to_bytes()?)?;
            new_sources.put(txn, &id)?;
            Ok(id)
        })?;
        self.env.sync()?;
        log::debug!("Added source {} (store id {}, feed {})", id, store_id, feed_id);
        Ok(id)
    }

    /// Source record by id.
    pub fn get_source(&self, source_id: u64) -> Result<Option<SourceRecord>> {
        let key = source_id.to_bytes();
        self.env.read(|txn| txn.get(self.sources, &key).map(|bytes| SourceRecord::decode(&bytes)).transpose())
    }

    /// Items of a source in index order.
    pub fn get_items(&self, source_id: u64) -> Result<Vec<(SourceItemKey, SourceItem)>> {
        let prefix = source_id.to_bytes();
        self.env.read(|txn| {
            txn.scan(self.items, &KeyRange::prefix(&prefix), Direction::Forward)
                .map(|(key, value)| Ok((SourceItemKey::decode(&key)?, SourceItem::decode(&value)?)))
                .collect()
        })
    }

    /// Number of sources.
    pub fn count(&self) -> Result<usize> {
        self.env.read(|txn| Ok(txn.count(self.sources, &KeyRange::all())))
    }

    /// Blocks until a new source is available.
    pub fn get_next_source(&self) -> Result<u64> {
        self.new_sources.take()
    }

    /// Like [`SourceDao::get_next_source`], giving up after `timeout`.
    pub fn get_next_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.new_sources.take_timeout(timeout)
    }

    /// Records the items found in a source and moves it on: to the examined
    /// queue, or to the deletable queue if it holds no items.
    pub fn set_source_examined(&self, source_id: u64, items: Vec<SourceItem>) -> Result<()> {
        let (sources, item_table) = (self.sources, self.items);
        let examined = self.examined_sources.appender();
        let deletable = self.deletable_sources.appender();

        self.env.execute(move |txn| {
            let key = source_id.to_bytes();
            let mut record = load_source(&*txn, sources, source_id)?;
            if record.item_count.is_some() {
                return Err(Error::invalid_argument(format!("source {} already examined", source_id)));
            }
            let count = u32::try_from(items.len())
                .map_err(|_| Error::invalid_argument(format!("source {} has too many items", source_id)))?;

            record.item_count = Some(count);
            txn.put(sources, &key, &record.try_to_bytes()?)?;
            for (index, item) in (0u32..).zip(&items) {
                let item_key = SourceItemKey { source_id, item_index: index };
                txn.put(item_table, &item_key.to_bytes(), &item.try_to_bytes()?)?;
            }

            if count == 0 {
                deletable.put(txn, &source_id)?;
            } else {
                examined.put(txn, &source_id)?;
            }
            Ok(())
        })
    }

    /// Blocks until an examined source is available.
    pub fn get_next_examined_source(&self) -> Result<u64> {
        self.examined_sources.take()
    }

    /// Like [`SourceDao::get_next_examined_source`], giving up after `timeout`.
    pub fn get_next_examined_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.examined_sources.take_timeout(timeout)
    }

    /// Assigns every unassigned item of an examined source to an aggregate,
    /// then queues the source for deletion. Returns the number of items
    /// assigned; a source aggregated before is left alone.
    pub fn aggregate_source(&self, source_id: u64, packer: &AggregatePacker, now_ms: u64) -> Result<usize> {
        let (sources, item_table) = (self.sources, self.items);
        let deletable = self.deletable_sources.appender();
        let packer = packer.clone();

        self.env.execute(move |txn| {
            let mut record = load_source(&*txn, sources, source_id)?;
            if record.aggregated {
                return Ok(0);
            }
            if record.item_count.is_none() {
                return Err(Error::invalid_argument(format!("source {} has not been examined", source_id)));
            }

            let pending: Vec<(Vec<u8>, SourceItem)> = txn
                .scan(item_table, &KeyRange::prefix(&source_id.to_bytes()), Direction::Forward)
                .map(|(key, value)| Ok((key, SourceItem::decode(&value)?)))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .filter(|(_, item)| item.aggregate.is_none())
                .collect();

            for (key, mut item) in pending.iter().cloned() {
                item.aggregate = Some(packer.add_item(txn, item.feed_id, item.byte_size, now_ms)?);
                txn.put(item_table, &key, &item.try_to_bytes()?)?;
            }

            record.aggregated = true;
            txn.put(sources, &source_id.to_bytes(), &record.try_to_bytes()?)?;
            deletable.put(txn, &source_id)?;
            Ok(pending.len())
        })
    }

    /// Blocks until a source is ready for deletion.
    pub fn get_deletable_source(&self) -> Result<u64> {
        self.deletable_sources.take()
    }

    /// Like [`SourceDao::get_deletable_source`], giving up after `timeout`.
    pub fn get_deletable_source_timeout(&self, timeout: Duration) -> Result<Option<u64>> {
        self.deletable_sources.take_timeout(timeout)
    }

    /// Deletes a source and its items. Returns true if the source existed.
    pub fn delete_source(&self, source_id: u64) -> Result<bool> {
        let (sources, items) = (self.sources, self.items);
        self.env.execute(move |txn| {
            let existed = txn.delete(sources, &source_id.to_bytes());
            let removed = txn.delete_range(items, &KeyRange::prefix(&source_id.to_bytes()));
            log::trace!("Deleted source {} with {} items", source_id, removed);
            Ok(existed)
        })
    }

    /// Removes every source and item and empties the source queues.
    pub fn clear(&self) -> Result<()> {
        let (sources, items, keys) = (self.sources, self.items, Arc::clone(&self.keys));
        self.env.execute(move |txn| {
            txn.clear_table(sources);
            txn.clear_table(items);
            keys.reset_in(txn);
            Ok(())
        })?;
        self.new_sources.clear()?;
        self.examined_sources.clear()?;
        self.deletable_sources.clear()
    }
}

fn load_source<T: Transaction + ?Sized>(txn: &T, sources: Table, source_id: u64) -> Result<SourceRecord> {
    let bytes = txn
        .get(sources, &source_id.to_bytes())
        .ok_or_else(|| Error::not_found(format!("source {}", source_id)))?;
    SourceRecord::decode(&bytes)
}
