//! Auto-incrementing row keys recovered from table contents.
//!
//! Tables whose rows are deleted during normal operation also keep a
//! high-water mark in a shared marks table, so their keys never go backwards
//! across a restart.

use crate::codec::{Codec, RowKey};
use crate::env::{Environment, Table};
use crate::error::Result;
use crate::txn::{KeyRange, Transaction, WriteTxn};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues strictly increasing keys for one table.
///
/// A plain generator is seeded from the largest key in the table, so issued
/// keys stay unique across restarts as long as entries are never deleted.
/// A durable generator (see [`RowKeyGenerator::open_durable`]) also records
/// every key it issues through [`RowKeyGenerator::next_in`], and is seeded
/// from whichever of the mark and the table's last key is larger.
#[derive(Debug)]
pub struct RowKeyGenerator<K> {
    counter: AtomicU64,
    mark: Option<HighWaterMark>,
    _key: PhantomData<fn() -> K>,
}

#[derive(Debug, Clone)]
struct HighWaterMark {
    table: Table,
    name: Vec<u8>,
}

impl<K: RowKey> RowKeyGenerator<K> {
    /// Creates a generator whose first key follows `last`.
    pub fn new(last: Option<K>) -> Self {
        Self { counter: AtomicU64::new(last.map_or(0, RowKey::as_u64)), mark: None, _key: PhantomData }
    }

    /// Opens a generator for `table` that persists its high-water mark in
    /// `marks` under `name`.
    pub fn open_durable(env: &Environment, table: Table, marks: Table, name: &str) -> Result<Self> {
        env.read(|txn| {
            let last = last_key::<K, _>(txn, table)?;
            Self::durable_from_txn(txn, last, marks, name)
        })
    }

    /// Like [`RowKeyGenerator::open_durable`], with the table's own floor
    /// supplied by the caller.
    pub fn durable_from_txn<T: Transaction + ?Sized>(
        txn: &T,
        floor: Option<K>,
        marks: Table,
        name: &str,
    ) -> Result<Self> {
        let stored = txn.get(marks, name.as_bytes()).map(|bytes| u64::decode(&bytes)).transpose()?;
        let seed = stored.unwrap_or(0).max(floor.map_or(0, RowKey::as_u64));
        Ok(Self {
            counter: AtomicU64::new(seed),
            mark: Some(HighWaterMark { table: marks, name: name.as_bytes().to_vec() }),
            _key: PhantomData,
        })
    }

    /// Seeds a generator from the last key of `table`.
    pub fn open(env: &Environment, table: Table) -> Result<Self> {
        env.read(|txn| Self::from_txn(txn, table))
    }

    /// Seeds a generator from the last key of `table` as seen by `txn`.
    pub fn from_txn<T: Transaction + ?Sized>(txn: &T, table: Table) -> Result<Self> {
        Ok(Self::new(last_key(txn, table)?))
    }

    /// Returns the next key.
    pub fn next(&self) -> Result<K> {
        K::from_u64(self.counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Returns the next key and records it as the high-water mark in the
    /// same transaction.
    pub fn next_in(&self, txn: &mut WriteTxn<'_>) -> Result<K> {
        let key = self.next()?;
        if let Some(mark) = &self.mark {
            txn.put(mark.table, &mark.name, &key.as_u64().to_bytes())?;
        }
        Ok(key)
    }

    /// Last key handed out, or the seed if none was.
    pub fn last_issued(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Restarts the sequence after `last` (zero for an emptied table).
    pub fn reset(&self, last: Option<K>) {
        self.counter.store(last.map_or(0, RowKey::as_u64), Ordering::Release);
    }

    /// Restarts the sequence from zero and drops the stored mark.
    pub fn reset_in(&self, txn: &mut WriteTxn<'_>) {
        self.reset(None);
        if let Some(mark) = &self.mark {
            txn.delete(mark.table, &mark.name);
        }
    }
}

/// Largest key of `table`, decoded as a row key.
pub fn last_key<K: RowKey, T: Transaction + ?Sized>(txn: &T, table: Table) -> Result<Option<K>> {
    txn.last(table, &KeyRange::all()).map(|(key, _)| K::decode(&key)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_next_is_strictly_increasing() {
        let keys = RowKeyGenerator::<u32>::new(None);
        assert_eq!(keys.next().unwrap(), 1);
        assert_eq!(keys.next().unwrap(), 2);
        assert_eq!(keys.last_issued(), 2);

        keys.reset(None);
        assert_eq!(keys.next().unwrap(), 1);
    }

    #[test]
    fn test_u32_overflow_is_an_error() {
        let keys = RowKeyGenerator::<u32>::new(Some(u32::MAX));
        assert!(keys.next().is_err());
    }

    #[test]
    fn test_seeded_from_table() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Options::default()).unwrap();
        let table = env.open_table("rows").unwrap();

        env.execute(move |txn| {
            for id in [3u64, 9, 5] {
                txn.put(table, &id.to_be_bytes(), b"row")?;
            }
            Ok(())
        })
        .unwrap();
        env.sync().unwrap();

        let keys = RowKeyGenerator::<u64>::open(&env, table).unwrap();
        assert_eq!(keys.next().unwrap(), 10);
    }

    #[test]
    fn test_durable_keys_survive_deletion_and_restart() {
        let dir = TempDir::new().unwrap();
        {
            let env = Environment::open(dir.path(), Options::default()).unwrap();
            let table = env.open_table("rows").unwrap();
            let marks = env.open_table("row-key").unwrap();
            let keys = Arc::new(RowKeyGenerator::<u64>::open_durable(&env, table, marks, "rows").unwrap());

            let issuer = Arc::clone(&keys);
            let ids = env
                .execute(move |txn| {
                    let mut ids = Vec::new();
                    for _ in 0..3 {
                        let id = issuer.next_in(txn)?;
                        txn.put(table, &id.to_bytes(), b"row")?;
                        ids.push(id);
                    }
                    Ok(ids)
                })
                .unwrap();
            assert_eq!(ids, vec![1, 2, 3]);

            env.execute(move |txn| {
                txn.delete_range(table, &KeyRange::all());
                Ok(())
            })
            .unwrap();
            env.close().unwrap();
        }

        let env = Environment::open(dir.path(), Options::default()).unwrap();
        let table = env.open_table("rows").unwrap();
        let marks = env.open_table("row-key").unwrap();
        assert_eq!(RowKeyGenerator::<u64>::open(&env, table).unwrap().next().unwrap(), 1);

        let keys = RowKeyGenerator::<u64>::open_durable(&env, table, marks, "rows").unwrap();
        assert_eq!(keys.next().unwrap(), 4);
    }

    #[test]
    fn test_reset_drops_the_mark() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Options::default()).unwrap();
        let table = env.open_table("rows").unwrap();
        let marks = env.open_table("row-key").unwrap();
        let keys = Arc::new(RowKeyGenerator::<u32>::open_durable(&env, table, marks, "rows").unwrap());

        let issuer = Arc::clone(&keys);
        env.execute(move |txn| issuer.next_in(txn).map(|_| ())).unwrap();
        let resetter = Arc::clone(&keys);
        env.execute(move |txn| {
            resetter.reset_in(txn);
            Ok(())
        })
        .unwrap();
        env.sync().unwrap();

        assert_eq!(env.read(|txn| Ok(txn.get(marks, b"rows"))).unwrap(), None);
        let reopened = RowKeyGenerator::<u32>::open_durable(&env, table, marks, "rows").unwrap();
        assert_eq!(reopened.next().unwrap(), 1);
    }
}
