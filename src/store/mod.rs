//! # Versioned Store - In-Memory Multi-Version Table Space
//!
//! The versioned store holds every table of an environment in a single
//! ordered SkipList. Each committed write adds a version tagged with the
//! commit sequence of its transaction, so readers pinned to an older sequence
//! keep seeing a consistent snapshot while the writer publishes new commits.
//!
//! ## Design
//!
//! - Based on crossbeam-skiplist for lock-free concurrent access
//! - Deletions are tombstones until garbage collection removes them
//! - A read at snapshot `s` sees, per key, the newest version with sequence `<= s`
//! - Size is tracked so the environment can enforce its store size limit
//!
//! ## Thread Safety
//!
//! Any number of readers may scan concurrently with the single writer that
//! calls [`VersionedStore::apply`] and [`VersionedStore::prune`].

mod internal_key;

pub use internal_key::{InternalKey, ValueType};

use crate::txn::Direction;
use crate::write_batch::{WriteBatch, WriteOp};
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-version bookkeeping overhead counted towards the store size.
const VERSION_OVERHEAD: usize = 16;

fn version_size(key: &InternalKey, value: &[u8]) -> usize {
    key.user_key().len() + value.len() + VERSION_OVERHEAD
}

/// Multi-version ordered map shared by every table of an environment.
///
/// # Example
///
/// ```rust
/// use proxydb::store::VersionedStore;
/// use proxydb::write_batch::WriteBatch;
///
/// let store = VersionedStore::new();
/// let mut batch = WriteBatch::new(1);
/// batch.put(1, b"key".to_vec(), b"value".to_vec());
/// store.apply(&batch);
///
/// assert_eq!(store.get(1, b"key", 1), Some(b"value".to_vec()));
/// assert_eq!(store.get(1, b"key", 0), None);
/// ```
pub struct VersionedStore {
    /// InternalKey -> value, tombstones map to an empty value
    data: SkipMap<InternalKey, Vec<u8>>,

    /// Approximate size in bytes of every stored version
    size: AtomicUsize,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self { data: SkipMap::new(), size: AtomicUsize::new(0) }
    }

    /// Inserts a single version.
    pub fn insert(&self, key: InternalKey, value: Vec<u8>) {
        if let Some(existing) = self.data.get(&key) {
            self.size.fetch_sub(version_size(existing.key(), existing.value()), Ordering::Relaxed);
        }
        self.size.fetch_add(version_size(&key, &value), Ordering::Relaxed);
        self.data.insert(key, value);
    }

    /// Applies every operation of a committed batch at the batch's sequence.
    pub fn apply(&self, batch: &WriteBatch) {
        let sequence = batch.sequence();
        for op in batch.iter() {
            match op {
                WriteOp::Put { table, key, value } => {
                    self.insert(InternalKey::new(*table, key.clone(), sequence, ValueType::Value), value.clone());
                }
                WriteOp::Delete { table, key } => {
                    self.insert(InternalKey::new(*table, key.clone(), sequence, ValueType::Deletion), Vec::new());
                }
            }
        }
    }

    /// Returns the value of `key` visible at `snapshot`, if any.
    pub fn get(&self, table: u32, key: &[u8], snapshot: u64) -> Option<Vec<u8>> {
        let lower = InternalKey::first_version(table, key.to_vec());
        let upper = InternalKey::last_version(table, key.to_vec());

        for entry in self.data.range(lower..=upper) {
            if entry.key().sequence() <= snapshot {
                return match entry.key().value_type() {
                    ValueType::Value => Some(entry.value().clone()),
                    ValueType::Deletion => None,
                };
            }
        }
        None
    }

    /// Iterates the entries of `table` visible at `snapshot` within the bounds.
    pub fn scan(
        &self,
        table: u32,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        snapshot: u64,
        direction: Direction,
    ) -> VisibleIter<'_> {
        let bounds = (lower_bound(table, lower), upper_bound(table, upper));
        VisibleIter::new(self.data.range(bounds), snapshot, direction)
    }

    /// Iterates every table's entries visible at `snapshot`, in store order.
    pub fn iter_all(&self, snapshot: u64) -> VisibleIter<'_> {
        let bounds: (Bound<InternalKey>, Bound<InternalKey>) = (Bound::Unbounded, Bound::Unbounded);
        VisibleIter::new(self.data.range(bounds), snapshot, Direction::Forward)
    }

    /// Drops the versions of one key that no snapshot at or above `horizon`
    /// can observe.
    ///
    /// The newest version at or below `horizon` is the anchor: older versions
    /// are removed, and so is the anchor itself when it is a tombstone.
    /// Returns `true` if the key still holds versions that a later prune may
    /// be able to drop.
    pub fn prune(&self, table: u32, key: &[u8], horizon: u64) -> bool {
        let lower = InternalKey::first_version(table, key.to_vec());
        let upper = InternalKey::last_version(table, key.to_vec());

        let mut kept = Vec::new();
        let mut doomed = Vec::new();
        let mut anchored = false;
        for entry in self.data.range(lower..=upper) {
            let version = entry.key();
            if anchored {
                doomed.push(version.clone());
            } else if version.sequence() <= horizon {
                anchored = true;
                match version.value_type() {
                    ValueType::Value => kept.push(ValueType::Value),
                    ValueType::Deletion => doomed.push(version.clone()),
                }
            } else {
                kept.push(version.value_type());
            }
        }

        // Oldest first: a tombstone anchor must outlive the values it hides
        // while concurrent readers walk the same key.
        for version in doomed.into_iter().rev() {
            if let Some(removed) = self.data.remove(&version) {
                self.size.fetch_sub(version_size(removed.key(), removed.value()), Ordering::Relaxed);
            }
        }

        kept.len() > 1 || kept.first() == Some(&ValueType::Deletion)
    }

    /// Prunes every key in the store. Returns the number of keys that still
    /// hold more than their live version.
    pub fn prune_all(&self, horizon: u64) -> usize {
        let mut keys: Vec<(u32, Vec<u8>)> = Vec::new();
        for entry in self.data.iter() {
            let version = entry.key();
            let seen = keys
                .last()
                .map(|(table, key)| *table == version.table() && key.as_slice() == version.user_key())
                .unwrap_or(false);
            if !seen {
                keys.push((version.table(), version.user_key().to_vec()));
            }
        }

        keys.iter().filter(|(table, key)| self.prune(*table, key, horizon)).count()
    }

    /// Returns the approximate size of all stored versions in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Returns the number of stored versions, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the store holds no versions.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn lower_bound(table: u32, bound: Bound<&[u8]>) -> Bound<InternalKey> {
    match bound {
        Bound::Included(key) => Bound::Included(InternalKey::first_version(table, key.to_vec())),
        Bound::Excluded(key) => Bound::Excluded(InternalKey::last_version(table, key.to_vec())),
        Bound::Unbounded => Bound::Included(InternalKey::first_version(table, Vec::new())),
    }
}

fn upper_bound(table: u32, bound: Bound<&[u8]>) -> Bound<InternalKey> {
    match bound {
        Bound::Included(key) => Bound::Included(InternalKey::last_version(table, key.to_vec())),
        Bound::Excluded(key) => Bound::Excluded(InternalKey::first_version(table, key.to_vec())),
        Bound::Unbounded => match table.checked_add(1) {
            Some(next) => Bound::Excluded(InternalKey::first_version(next, Vec::new())),
            None => Bound::Unbounded,
        },
    }
}

type Versions<'a> = Box<dyn Iterator<Item = Entry<'a, InternalKey, Vec<u8>>> + 'a>;

/// Iterator over the entries visible at one snapshot.
///
/// Yields `(table, key, value)` with tombstoned keys skipped.
pub struct VisibleIter<'a> {
    versions: Peekable<Versions<'a>>,
    snapshot: u64,
    direction: Direction,
}

impl<'a> VisibleIter<'a> {
    fn new<I>(range: I, snapshot: u64, direction: Direction) -> Self
    where
        I: DoubleEndedIterator<Item = Entry<'a, InternalKey, Vec<u8>>> + 'a,
    {
        let versions: Versions<'a> = match direction {
            Direction::Forward => Box::new(range),
            Direction::Reverse => Box::new(range.rev()),
        };
        Self { versions: versions.peekable(), snapshot, direction }
    }
}

impl Iterator for VisibleIter<'_> {
    type Item = (u32, Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = self.versions.next()?;

            // Forward scans meet a key's versions newest first, reverse scans
            // oldest first, so the visible one is the first or last match.
            let mut chosen = (head.key().sequence() <= self.snapshot).then(|| head.clone());
            while let Some(entry) = self.versions.next_if(|e| e.key().same_user_key(head.key())) {
                if entry.key().sequence() <= self.snapshot
                    && (chosen.is_none() || self.direction == Direction::Reverse)
                {
                    chosen = Some(entry);
                }
            }

            if let Some(entry) = chosen {
                if entry.key().value_type() == ValueType::Value {
                    let key = entry.key();
                    return Some((key.table(), key.user_key().to_vec(), entry.value().clone()));
                }
            }
        }
    }
}
