//! Read and write transactions.
//!
//! A [`ReadTxn`] sees the store as of the commit sequence current when it
//! was opened. A [`WriteTxn`] is owned by the environment's writer thread: it
//! layers uncommitted changes over the last committed state and is turned
//! into a [`WriteBatch`] when the writer commits.
//!
//! Both implement [`Transaction`], which carries the read operations.

use crate::env::{ReaderRegistry, Table};
use crate::error::{Error, Result};
use crate::store::VersionedStore;
use crate::write_batch::WriteBatch;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;

/// Iteration order of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending key order
    #[default]
    Forward,
    /// Descending key order
    Reverse,
}

/// Result of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key did not exist before
    NewEntry,
    /// An existing value was overwritten
    Replaced,
}

/// A range of user keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self { lower: Bound::Unbounded, upper: Bound::Unbounded }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let upper = match crate::codec::prefix_successor(prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        Self { lower: Bound::Included(prefix.to_vec()), upper }
    }

    /// Every key `>= start`.
    pub fn at_least(start: &[u8]) -> Self {
        Self { lower: Bound::Included(start.to_vec()), upper: Bound::Unbounded }
    }

    /// Every key in `[start, end)`.
    pub fn between(start: &[u8], end: &[u8]) -> Self {
        Self { lower: Bound::Included(start.to_vec()), upper: Bound::Excluded(end.to_vec()) }
    }

    /// Every key in `[start, end]`.
    pub fn closed(start: &[u8], end: &[u8]) -> Self {
        Self { lower: Bound::Included(start.to_vec()), upper: Bound::Included(end.to_vec()) }
    }

    /// Builds a range from explicit bounds.
    pub fn from_bounds(lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> Self {
        Self { lower, upper }
    }

    /// Lower bound.
    pub fn lower(&self) -> Bound<&[u8]> {
        as_slice_bound(&self.lower)
    }

    /// Upper bound.
    pub fn upper(&self) -> Bound<&[u8]> {
        as_slice_bound(&self.upper)
    }

    /// Returns true if no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match self.lower() {
            Bound::Included(lo) => key >= lo,
            Bound::Excluded(lo) => key > lo,
            Bound::Unbounded => true,
        };
        let below = match self.upper() {
            Bound::Included(hi) => key <= hi,
            Bound::Excluded(hi) => key < hi,
            Bound::Unbounded => true,
        };
        above && below
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Key/value pairs produced by a scan.
pub type ScanIter<'t> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 't>;

/// Read operations shared by read and write transactions.
pub trait Transaction {
    /// Returns the value stored under `key`.
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>>;

    /// Iterates the entries of `table` inside `range`.
    fn scan(&self, table: Table, range: &KeyRange, direction: Direction) -> ScanIter<'_>;

    /// Returns true if `key` exists.
    fn exists(&self, table: Table, key: &[u8]) -> bool {
        self.get(table, key).is_some()
    }

    /// First entry of `range` in key order.
    fn first(&self, table: Table, range: &KeyRange) -> Option<(Vec<u8>, Vec<u8>)> {
        self.scan(table, range, Direction::Forward).next()
    }

    /// Last entry of `range` in key order.
    fn last(&self, table: Table, range: &KeyRange) -> Option<(Vec<u8>, Vec<u8>)> {
        self.scan(table, range, Direction::Reverse).next()
    }

    /// Number of entries inside `range`.
    fn count(&self, table: Table, range: &KeyRange) -> usize {
        self.scan(table, range, Direction::Forward).count()
    }
}

/// A snapshot-isolated read transaction.
///
/// Holds one reader slot of the environment until dropped.
pub struct ReadTxn<'a> {
    store: &'a VersionedStore,
    registry: &'a ReaderRegistry,
    snapshot: u64,
}

impl<'a> ReadTxn<'a> {
    pub(crate) fn new(store: &'a VersionedStore, registry: &'a ReaderRegistry, snapshot: u64) -> Self {
        Self { store, registry, snapshot }
    }

    /// Commit sequence this transaction observes.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.registry.release(self.snapshot);
    }
}

impl Transaction for ReadTxn<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(table.id(), key, self.snapshot)
    }

    fn scan(&self, table: Table, range: &KeyRange, direction: Direction) -> ScanIter<'_> {
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.store
                .scan(table.id(), range.lower(), range.upper(), self.snapshot, direction)
                .map(|(_, key, value)| (key, value)),
        )
    }
}

type OverlayKey = (u32, Vec<u8>);

/// The open write transaction of the writer thread.
///
/// Changes live in an overlay keyed by `(table, key)`; `None` marks a
/// deletion. Each command applied by the writer runs inside a savepoint so
/// its changes can be rolled back without touching earlier commands.
pub struct WriteTxn<'a> {
    store: &'a VersionedStore,
    base: u64,
    max_store_size: usize,
    changes: BTreeMap<OverlayKey, Option<Vec<u8>>>,
    undo: Vec<(OverlayKey, Option<Option<Vec<u8>>>)>,
    added_bytes: usize,
    savepoint_bytes: usize,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(store: &'a VersionedStore, base: u64, max_store_size: usize) -> Self {
        Self {
            store,
            base,
            max_store_size,
            changes: BTreeMap::new(),
            undo: Vec::new(),
            added_bytes: 0,
            savepoint_bytes: 0,
        }
    }

    /// Commit sequence the overlay sits on.
    pub fn base_sequence(&self) -> u64 {
        self.base
    }

    /// Returns true if the transaction holds no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of keys changed by the transaction.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Stores `value` under `key`.
    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<PutOutcome> {
        let size = key.len() + value.len() + 16;
        let used = self.store.approximate_size() + self.added_bytes + size;
        if used > self.max_store_size {
            return Err(Error::StoreFull { used, limit: self.max_store_size });
        }

        let outcome = if self.exists(table, key) { PutOutcome::Replaced } else { PutOutcome::NewEntry };
        self.record((table.id(), key.to_vec()), Some(value.to_vec()));
        self.added_bytes += size;
        Ok(outcome)
    }

    /// Stores `value` under a key that must sort after every key in `table`.
    pub fn append(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some((last, _)) = self.last(table, &KeyRange::all()) {
            if key <= last.as_slice() {
                return Err(Error::invalid_argument(format!(
                    "append key {:02x?} does not sort after last key {:02x?}",
                    key, last
                )));
            }
        }
        self.put(table, key, value).map(|_| ())
    }

    /// Deletes `key`. Returns true if it existed.
    pub fn delete(&mut self, table: Table, key: &[u8]) -> bool {
        if !self.exists(table, key) {
            return false;
        }
        self.record((table.id(), key.to_vec()), None);
        true
    }

    /// Deletes every key inside `range`. Returns the number deleted.
    pub fn delete_range(&mut self, table: Table, range: &KeyRange) -> usize {
        let keys: Vec<Vec<u8>> = self.scan(table, range, Direction::Forward).map(|(key, _)| key).collect();
        for key in &keys {
            self.record((table.id(), key.clone()), None);
        }
        keys.len()
    }

    /// Deletes every key of `table`.
    pub fn clear_table(&mut self, table: Table) -> usize {
        self.delete_range(table, &KeyRange::all())
    }

    fn record(&mut self, key: OverlayKey, value: Option<Vec<u8>>) {
        let previous = self.changes.insert(key.clone(), value);
        self.undo.push((key, previous));
    }

    /// Starts the savepoint of a new command.
    pub(crate) fn begin_command(&mut self) {
        self.undo.clear();
        self.savepoint_bytes = self.added_bytes;
    }

    /// Reverts every change made since [`WriteTxn::begin_command`].
    pub(crate) fn rollback_command(&mut self) {
        while let Some((key, previous)) = self.undo.pop() {
            match previous {
                Some(value) => {
                    self.changes.insert(key, value);
                }
                None => {
                    self.changes.remove(&key);
                }
            }
        }
        self.added_bytes = self.savepoint_bytes;
    }

    /// Drains the overlay into a batch committed at `sequence`.
    pub(crate) fn take_batch(&mut self, sequence: u64) -> WriteBatch {
        let mut batch = WriteBatch::new(sequence);
        for ((table, key), value) in std::mem::take(&mut self.changes) {
            match value {
                Some(value) => batch.put(table, key, value),
                None => batch.delete(table, key),
            }
        }
        self.undo.clear();
        self.added_bytes = 0;
        self.savepoint_bytes = 0;
        self.base = sequence;
        batch
    }

    /// Throws away every change and moves onto `base`.
    pub(crate) fn reset(&mut self, base: u64) {
        self.changes.clear();
        self.undo.clear();
        self.added_bytes = 0;
        self.savepoint_bytes = 0;
        self.base = base;
    }

    fn overlay_range(
        &self,
        table: u32,
        range: &KeyRange,
    ) -> std::collections::btree_map::Range<'_, OverlayKey, Option<Vec<u8>>> {
        let lower = match range.lower() {
            Bound::Included(key) => Bound::Included((table, key.to_vec())),
            Bound::Excluded(key) => Bound::Excluded((table, key.to_vec())),
            Bound::Unbounded => Bound::Included((table, Vec::new())),
        };
        let upper = match range.upper() {
            Bound::Included(key) => Bound::Included((table, key.to_vec())),
            Bound::Excluded(key) => Bound::Excluded((table, key.to_vec())),
            Bound::Unbounded => match table.checked_add(1) {
                Some(next) => Bound::Excluded((next, Vec::new())),
                None => Bound::Unbounded,
            },
        };
        self.changes.range((lower, upper))
    }
}

impl Transaction for WriteTxn<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        match self.changes.get(&(table.id(), key.to_vec())) {
            Some(change) => change.clone(),
            None => self.store.get(table.id(), key, self.base),
        }
    }

    fn scan(&self, table: Table, range: &KeyRange, direction: Direction) -> ScanIter<'_> {
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }

        let committed = self
            .store
            .scan(table.id(), range.lower(), range.upper(), self.base, direction)
            .map(|(_, key, value)| (key, value));
        let overlay = self.overlay_range(table.id(), range).map(|((_, key), value)| (key.clone(), value.clone()));
        let overlay: Box<dyn Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> + '_> = match direction {
            Direction::Forward => Box::new(overlay),
            Direction::Reverse => Box::new(overlay.rev()),
        };

        Box::new(MergeIter { committed: committed.peekable(), overlay: overlay.peekable(), direction })
    }
}

/// Merges committed entries with the overlay; the overlay wins on equal keys.
struct MergeIter<C, O>
where
    C: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    O: Iterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
    committed: Peekable<C>,
    overlay: Peekable<O>,
    direction: Direction,
}

impl<C, O> Iterator for MergeIter<C, O>
where
    C: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    O: Iterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let order = match (self.committed.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((committed, _)), Some((overlay, _))) => match self.direction {
                    Direction::Forward => committed.cmp(overlay),
                    Direction::Reverse => overlay.cmp(committed),
                },
            };

            match order {
                Ordering::Less => return self.committed.next(),
                Ordering::Equal => {
                    self.committed.next();
                }
                Ordering::Greater => {}
            }

            if let Some((key, Some(value))) = self.overlay.next() {
                return Some((key, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Table = Table::from_id(1);
    const OTHER: Table = Table::from_id(2);

    fn committed_store() -> VersionedStore {
        let store = VersionedStore::new();
        let mut batch = WriteBatch::new(1);
        for key in [b"a", b"c", b"e"] {
            batch.put(1, key.to_vec(), b"old".to_vec());
        }
        batch.put(2, b"b".to_vec(), b"other".to_vec());
        store.apply(&batch);
        store
    }

    fn scan_keys(txn: &WriteTxn<'_>, range: &KeyRange, direction: Direction) -> Vec<Vec<u8>> {
        txn.scan(T, range, direction).map(|(key, _)| key).collect()
    }

    #[test]
    fn test_key_range_is_empty() {
        assert!(!KeyRange::all().is_empty());
        assert!(KeyRange::between(b"b", b"b").is_empty());
        assert!(KeyRange::between(b"c", b"b").is_empty());
        assert!(!KeyRange::closed(b"b", b"b").is_empty());
        assert!(KeyRange::prefix(&[0xFF]).contains(&[0xFF, 0x01]));
        assert!(!KeyRange::prefix(b"ab").contains(b"ac"));
    }

    #[test]
    fn test_overlay_shadows_committed_values() {
        let store = committed_store();
        let mut txn = WriteTxn::new(&store, 1, usize::MAX);

        assert_eq!(txn.put(T, b"a", b"new").unwrap(), PutOutcome::Replaced);
        assert_eq!(txn.put(T, b"b", b"new").unwrap(), PutOutcome::NewEntry);
        assert!(txn.delete(T, b"c"));
        assert!(!txn.delete(T, b"zz"));

        assert_eq!(txn.get(T, b"a"), Some(b"new".to_vec()));
        assert_eq!(txn.get(T, b"c"), None);
        assert_eq!(txn.get(OTHER, b"b"), Some(b"other".to_vec()));

        let forward = scan_keys(&txn, &KeyRange::all(), Direction::Forward);
        assert_eq!(forward, vec![b"a".to_vec(), b"b".to_vec(), b"e".to_vec()]);
        let reverse = scan_keys(&txn, &KeyRange::all(), Direction::Reverse);
        assert_eq!(reverse, vec![b"e".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_rollback_restores_previous_command_state() {
        let store = committed_store();
        let mut txn = WriteTxn::new(&store, 1, usize::MAX);

        txn.begin_command();
        txn.put(T, b"x", b"1").unwrap();

        txn.begin_command();
        txn.put(T, b"x", b"2").unwrap();
        txn.delete(T, b"a");
        txn.rollback_command();

        assert_eq!(txn.get(T, b"x"), Some(b"1".to_vec()));
        assert_eq!(txn.get(T, b"a"), Some(b"old".to_vec()));
        assert_eq!(txn.len(), 1);
    }

    #[test]
    fn test_append_requires_increasing_keys() {
        let store = committed_store();
        let mut txn = WriteTxn::new(&store, 1, usize::MAX);

        txn.append(T, b"f", b"v").unwrap();
        assert!(matches!(txn.append(T, b"f", b"v"), Err(Error::InvalidArgument(_))));
        assert!(txn.append(T, b"b", b"v").is_err());
        txn.append(OTHER, b"c", b"v").unwrap();
    }

    #[test]
    fn test_store_full_rejects_put() {
        let store = committed_store();
        let limit = store.approximate_size() + 30;
        let mut txn = WriteTxn::new(&store, 1, limit);

        txn.put(T, b"k", b"small").unwrap();
        let err = txn.put(T, b"k2", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::StoreFull { .. }));
    }

    #[test]
    fn test_delete_range_and_batch() {
        let store = committed_store();
        let mut txn = WriteTxn::new(&store, 1, usize::MAX);

        txn.put(T, b"d", b"new").unwrap();
        assert_eq!(txn.delete_range(T, &KeyRange::between(b"b", b"e")), 2);
        assert_eq!(scan_keys(&txn, &KeyRange::all(), Direction::Forward), vec![b"a".to_vec(), b"e".to_vec()]);

        let batch = txn.take_batch(2);
        assert_eq!(batch.sequence(), 2);
        assert_eq!(batch.len(), 2);
        assert!(txn.is_empty());

        store.apply(&batch);
        assert_eq!(store.get(1, b"c", 2), None);
        assert_eq!(store.get(1, b"c", 1), Some(b"old".to_vec()));
    }

    #[test]
    fn test_first_last_count() {
        let store = committed_store();
        let mut txn = WriteTxn::new(&store, 1, usize::MAX);
        txn.put(T, b"0", b"first").unwrap();

        assert_eq!(txn.first(T, &KeyRange::all()).map(|(k, _)| k), Some(b"0".to_vec()));
        assert_eq!(txn.last(T, &KeyRange::all()).map(|(k, _)| k), Some(b"e".to_vec()));
        assert_eq!(txn.count(T, &KeyRange::at_least(b"b")), 2);
        assert_eq!(txn.count(T, &KeyRange::between(b"e", b"a")), 0);
    }
}
