//! Deduplicating id -> record store.
//!
//! Values are stored under compact auto-incrementing ids in a primary table.
//! A companion `<name>-index` table maps the xxh3 hash of each encoded value
//! to the concatenated ids carrying that hash, so the id of an existing
//! value is found without a scan. Hash collisions are resolved by comparing
//! the encoded bytes.

use crate::codec::{Codec, RowKey};
use crate::env::{Environment, Table};
use crate::error::{Error, Result};
use crate::row_key::RowKeyGenerator;
use crate::txn::{Direction, KeyRange, Transaction};
use std::marker::PhantomData;
use std::sync::Arc;

/// Maps values of type `V` to ids of type `K`, creating ids on demand.
///
/// # Example
///
/// ```rust,no_run
/// use proxydb::{Environment, KeyedRecordStore, Options};
///
/// # fn main() -> Result<(), proxydb::Error> {
/// let env = Environment::open("./data", Options::default())?;
/// let names: KeyedRecordStore<u32, String> = KeyedRecordStore::open(&env, "names")?;
///
/// let id = names.get_or_create_id(&"alpha".to_string())?;
/// assert_eq!(names.get_or_create_id(&"alpha".to_string())?, id);
/// assert_eq!(names.get(id)?, Some("alpha".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct KeyedRecordStore<K, V> {
    env: Arc<Environment>,
    name: String,
    table: Table,
    index: Table,
    keys: Arc<RowKeyGenerator<K>>,
    _value: PhantomData<fn() -> V>,
}

impl<K, V> Clone for KeyedRecordStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            name: self.name.clone(),
            table: self.table,
            index: self.index,
            keys: Arc::clone(&self.keys),
            _value: PhantomData,
        }
    }
}

impl<K: RowKey, V: Codec> KeyedRecordStore<K, V> {
    /// Opens the `name` and `name-index` tables.
    pub fn open(env: &Arc<Environment>, name: &str) -> Result<Self> {
        let table = env.open_table(name)?;
        let index = env.open_table(&format!("{}-index", name))?;
        let keys = RowKeyGenerator::open(env, table)?;
        log::debug!("Opened keyed store {:?} at id {}", name, keys.last_issued());

        Ok(Self {
            env: Arc::clone(env),
            name: name.to_string(),
            table,
            index,
            keys: Arc::new(keys),
            _value: PhantomData,
        })
    }

    /// Primary table.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Value stored under `id`.
    pub fn get(&self, id: K) -> Result<Option<V>> {
        let key = id.to_bytes();
        self.env.read(|txn| txn.get(self.table, &key).map(|bytes| V::decode(&bytes)).transpose())
    }

    /// Visits every entry in ascending id order.
    pub fn get_all<F: FnMut(K, V)>(&self, mut f: F) -> Result<()> {
        self.env.read(|txn| {
            for (key, value) in txn.scan(self.table, &KeyRange::all(), Direction::Forward) {
                f(K::decode(&key)?, V::decode(&value)?);
            }
            Ok(())
        })
    }

    /// Id of an existing entry equal to `value`.
    pub fn get_id(&self, value: &V) -> Result<Option<K>> {
        let bytes = value.try_to_bytes()?;
        self.env.read(|txn| find_id(txn, self.table, self.index, &bytes))
    }

    /// Id of the entry equal to `value`, creating it if none exists.
    ///
    /// The check and the creation run as one command on the writer thread,
    /// so concurrent callers agree on a single id. Returns only once the id
    /// is durable.
    pub fn get_or_create_id(&self, value: &V) -> Result<K> {
        let bytes = value.try_to_bytes()?;
        if let Some(id) = self.env.read(|txn| find_id(txn, self.table, self.index, &bytes))? {
            return Ok(id);
        }

        let (table, index, keys) = (self.table, self.index, Arc::clone(&self.keys));
        let (id, created) = self.env.execute(move |txn| {
            if let Some(id) = find_id(txn, table, index, &bytes)? {
                return Ok((id, false));
            }
            let id: K = keys.next()?;
            let id_bytes = id.to_bytes();
            let hash = hash_key(&bytes);

            let mut bucket = txn.get(index, &hash).unwrap_or_default();
            bucket.extend_from_slice(&id_bytes);
            txn.put(index, &hash, &bucket)?;
            txn.put(table, &id_bytes, &bytes)?;
            Ok((id, true))
        })?;

        // An id found inside the open transaction is not durable yet either.
        self.env.sync()?;
        if created {
            log::debug!("Created {} id {:?}", self.name, id);
        }
        Ok(id)
    }

    /// Number of entries.
    pub fn count(&self) -> Result<usize> {
        self.env.read(|txn| Ok(txn.count(self.table, &KeyRange::all())))
    }

    /// Removes every entry and restarts id allocation.
    pub fn clear(&self) -> Result<()> {
        let (table, index, keys) = (self.table, self.index, Arc::clone(&self.keys));
        self.env.execute(move |txn| {
            txn.clear_table(table);
            txn.clear_table(index);
            keys.reset(None);
            Ok(())
        })?;
        self.env.sync()
    }
}

fn hash_key(bytes: &[u8]) -> [u8; 8] {
    xxhash_rust::xxh3::xxh3_64(bytes).to_be_bytes()
}

fn find_id<K, T>(txn: &T, table: Table, index: Table, bytes: &[u8]) -> Result<Option<K>>
where
    K: RowKey,
    T: Transaction + ?Sized,
{
    let bucket = match txn.get(index, &hash_key(bytes)) {
        Some(bucket) => bucket,
        None => return Ok(None),
    };
    if bucket.len() % K::WIDTH != 0 {
        return Err(Error::corruption(format!("hash bucket of {} bytes is not a list of ids", bucket.len())));
    }

    for candidate in bucket.chunks(K::WIDTH) {
        if txn.get(table, candidate).as_deref() == Some(bytes) {
            return K::decode(candidate).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::txn::WriteTxn;
    use tempfile::TempDir;

    fn open() -> (TempDir, Arc<Environment>, KeyedRecordStore<u32, String>) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Options::default()).unwrap();
        let store = KeyedRecordStore::open(&env, "names").unwrap();
        (dir, env, store)
    }

    #[test]
    fn test_get_or_create_deduplicates() {
        let (_dir, _env, store) = open();

        let a = store.get_or_create_id(&"a".to_string()).unwrap();
        let b = store.get_or_create_id(&"b".to_string()).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(store.get_or_create_id(&"a".to_string()).unwrap(), a);
        assert_eq!(store.get_id(&"b".to_string()).unwrap(), Some(b));
        assert_eq!(store.get_id(&"c".to_string()).unwrap(), None);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_hash_collision_falls_back_to_exact_match() {
        let (_dir, env, store) = open();
        let (table, index) = (store.table, store.index);

        // Plant an unrelated id in the bucket "real" hashes to.
        env.execute(move |txn: &mut WriteTxn<'_>| {
            let hash = hash_key(b"real");
            txn.put(table, &7u32.to_be_bytes(), b"imposter")?;
            txn.put(index, &hash, &7u32.to_be_bytes())?;
            Ok(())
        })
        .unwrap();

        assert_eq!(store.get_id(&"real".to_string()).unwrap(), None);
        let id = store.get_or_create_id(&"real".to_string()).unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.get(id).unwrap(), Some("real".to_string()));
        assert_eq!(store.get(7).unwrap(), Some("imposter".to_string()));
    }

    #[test]
    fn test_get_all_and_clear() {
        let (_dir, _env, store) = open();
        for name in ["x", "y", "z"] {
            store.get_or_create_id(&name.to_string()).unwrap();
        }

        let mut seen = Vec::new();
        store.get_all(|id, value| seen.push((id, value))).unwrap();
        assert_eq!(seen, vec![(1, "x".to_string()), (2, "y".to_string()), (3, "z".to_string())]);

        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.get_or_create_id(&"y".to_string()).unwrap(), 1);
    }
}
