//! Crash-durable FIFO queue over a table keyed by big-endian sequence numbers.
//!
//! Producers append through the writer thread. Consumers only see an entry
//! once the transaction that wrote it has committed: the positions consumers
//! wait on are advanced by a post-commit hook, never by `put` itself.
//! Consumed entries are deleted in batches so the table holds at most about
//! one batch of already-dispatched entries.

use crate::codec::Codec;
use crate::env::{Environment, Table};
use crate::error::{Error, Result};
use crate::row_key::last_key;
use crate::txn::{KeyRange, Transaction, WriteTxn};
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Positions {
    /// Last sequence known to be committed
    current_write: u64,
    /// Last sequence dispatched to a consumer
    current_read: u64,
    /// Last sequence physically deleted
    last_delete: u64,
    closed: bool,
}

#[derive(Default)]
struct QueueState {
    positions: Mutex<Positions>,
    not_empty: Condvar,
}

/// A durable, strictly ordered multi-producer multi-consumer queue.
///
/// # Example
///
/// ```rust,no_run
/// use proxydb::{DurableQueue, Environment, Options};
///
/// # fn main() -> Result<(), proxydb::Error> {
/// let env = Environment::open("./data", Options::default())?;
/// let queue: DurableQueue<u64> = DurableQueue::open(&env, "work", 1000)?;
///
/// queue.put(&42)?;
/// assert_eq!(queue.take()?, 42);
/// # Ok(())
/// # }
/// ```
pub struct DurableQueue<V> {
    env: Arc<Environment>,
    name: String,
    table: Table,
    /// Last sequence assigned by the writer thread
    write_id: Arc<AtomicU64>,
    state: Arc<QueueState>,
    delete_batch_size: u64,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for DurableQueue<V> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            name: self.name.clone(),
            table: self.table,
            write_id: Arc::clone(&self.write_id),
            state: Arc::clone(&self.state),
            delete_batch_size: self.delete_batch_size,
            _value: PhantomData,
        }
    }
}

impl<V: Codec> DurableQueue<V> {
    /// Opens the queue stored in table `name`, resuming after its existing
    /// entries.
    pub fn open(env: &Arc<Environment>, name: &str, delete_batch_size: u64) -> Result<Self> {
        if delete_batch_size == 0 {
            return Err(Error::invalid_argument("queue delete batch size must be > 0"));
        }
        let table = env.open_table(name)?;
        let (first, last) = env.read(|txn| bounds(txn, table))?;

        let state = Arc::new(QueueState::default());
        {
            let mut positions = state.positions.lock();
            positions.current_write = last;
            positions.current_read = first.saturating_sub(1);
            positions.last_delete = positions.current_read;
        }
        let write_id = Arc::new(AtomicU64::new(last));

        let hook_state = Arc::downgrade(&state);
        let hook_write_id = Arc::clone(&write_id);
        env.add_post_commit_hook(move || publish(&hook_state, hook_write_id.load(Ordering::Acquire)));

        let hook_state = Arc::downgrade(&state);
        env.add_close_hook(move || {
            if let Some(state) = hook_state.upgrade() {
                state.positions.lock().closed = true;
                state.not_empty.notify_all();
            }
        });

        log::debug!("Opened queue {:?} with {} pending entries", name, last.saturating_sub(first.saturating_sub(1)));
        Ok(Self {
            env: Arc::clone(env),
            name: name.to_string(),
            table,
            write_id,
            state,
            delete_batch_size,
            _value: PhantomData,
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table holding the entries.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Queues `value` for appending by the writer thread.
    pub fn put(&self, value: &V) -> Result<()> {
        let bytes = value.try_to_bytes()?;
        let (table, write_id) = (self.table, Arc::clone(&self.write_id));
        self.env.write(move |txn| append(txn, table, &write_id, &bytes).map(|_| ()))
    }

    /// Appends `value` inside a command already running on the writer
    /// thread. Returns the assigned sequence number.
    pub fn put_in_txn(&self, txn: &mut WriteTxn<'_>, value: &V) -> Result<u64> {
        append(txn, self.table, &self.write_id, &value.try_to_bytes()?)
    }

    /// Handle for appending from writer commands without holding the
    /// environment.
    pub fn appender(&self) -> QueueAppender<V> {
        QueueAppender { table: self.table, write_id: Arc::clone(&self.write_id), _value: PhantomData }
    }

    /// Takes the next entry, blocking until one is committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the environment closes while waiting.
    pub fn take(&self) -> Result<V> {
        loop {
            if let Some(value) = self.take_next(None)? {
                return Ok(value);
            }
        }
    }

    /// Takes the next entry, waiting at most `timeout` for one to be committed.
    ///
    /// Returns `Ok(None)` on timeout without consuming anything.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Option<V>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.take_next(Some(deadline)) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) if Instant::now() >= deadline => return Ok(None),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatches one sequence number. Returns `None` on timeout or when the
    /// sequence turns out to be a gap left by a rolled-back put.
    fn take_next(&self, deadline: Option<Instant>) -> Result<Option<V>> {
        let (value, trim) = {
            let mut positions = self.state.positions.lock();
            while positions.current_write <= positions.current_read {
                if positions.closed {
                    return Err(Error::interrupted(format!("queue {} closed", self.name)));
                }
                match deadline {
                    Some(deadline) => {
                        if self.state.not_empty.wait_until(&mut positions, deadline).timed_out()
                            && positions.current_write <= positions.current_read
                        {
                            return Ok(None);
                        }
                    }
                    None => self.state.not_empty.wait(&mut positions),
                }
            }
            if positions.closed {
                return Err(Error::interrupted(format!("queue {} closed", self.name)));
            }

            positions.current_read += 1;
            let id = positions.current_read;
            // Read while holding the lock so no trim can delete the entry first.
            let value = self.read_entry(id)?;

            let trim = if positions.current_read - positions.last_delete > self.delete_batch_size {
                let start = positions.last_delete + 1;
                positions.last_delete += self.delete_batch_size;
                Some((start, positions.last_delete))
            } else {
                None
            };
            (value, trim)
        };

        if let Some((start, end)) = trim {
            let table = self.table;
            log::debug!("Trimming queue {} entries {}..={}", self.name, start, end);
            self.env.write(move |txn| {
                txn.delete_range(table, &KeyRange::closed(&start.to_be_bytes(), &end.to_be_bytes()));
                Ok(())
            })?;
        }

        if value.is_none() {
            log::trace!("Queue {} skipped a gap", self.name);
        }
        Ok(value)
    }

    fn read_entry(&self, id: u64) -> Result<Option<V>> {
        let key = id.to_be_bytes();
        self.env.read(|txn| txn.get(self.table, &key).map(|bytes| V::decode(&bytes)).transpose())
    }

    /// Number of entries in the table, consumed but untrimmed ones included.
    pub fn size(&self) -> Result<usize> {
        self.env.read(|txn| Ok(txn.count(self.table, &KeyRange::all())))
    }

    /// Removes every entry and resets the positions.
    pub fn clear(&self) -> Result<()> {
        let (table, write_id, state) = (self.table, Arc::clone(&self.write_id), Arc::clone(&self.state));
        self.env.execute(move |txn| {
            txn.clear_table(table);
            let (first, last) = bounds(txn, table)?;
            write_id.store(last, Ordering::Release);

            let mut positions = state.positions.lock();
            positions.current_write = last;
            positions.current_read = first.saturating_sub(1);
            positions.last_delete = positions.current_read;
            Ok(())
        })?;
        self.env.sync()
    }
}

/// Appends to a [`DurableQueue`] from inside a write command.
pub struct QueueAppender<V> {
    table: Table,
    write_id: Arc<AtomicU64>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for QueueAppender<V> {
    fn clone(&self) -> Self {
        Self { table: self.table, write_id: Arc::clone(&self.write_id), _value: PhantomData }
    }
}

impl<V: Codec> QueueAppender<V> {
    /// Appends `value`. Returns the assigned sequence number.
    pub fn put(&self, txn: &mut WriteTxn<'_>, value: &V) -> Result<u64> {
        append(txn, self.table, &self.write_id, &value.try_to_bytes()?)
    }
}

fn append(txn: &mut WriteTxn<'_>, table: Table, write_id: &AtomicU64, bytes: &[u8]) -> Result<u64> {
    let id = write_id.load(Ordering::Acquire) + 1;
    txn.append(table, &id.to_be_bytes(), bytes)?;
    write_id.store(id, Ordering::Release);
    Ok(id)
}

fn publish(state: &Weak<QueueState>, write_id: u64) {
    if let Some(state) = state.upgrade() {
        let mut positions = state.positions.lock();
        if positions.current_write != write_id {
            positions.current_write = write_id;
            state.not_empty.notify_all();
        }
    }
}

/// First and last sequence numbers in the table, zero when empty.
fn bounds<T: Transaction + ?Sized>(txn: &T, table: Table) -> Result<(u64, u64)> {
    let first = txn.first(table, &KeyRange::all()).map(|(key, _)| u64::decode(&key)).transpose()?;
    let last: Option<u64> = last_key(txn, table)?;
    Ok((first.unwrap_or(0), last.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::TempDir;

    fn open(batch: u64) -> (TempDir, Arc<Environment>, DurableQueue<u64>) {
        let dir = TempDir::new().unwrap();
        // Long interval: entries only become visible through explicit syncs.
        let options = Options::default().auto_commit(1000, Duration::from_secs(5));
        let env = Environment::open(dir.path(), options).unwrap();
        let queue = DurableQueue::open(&env, "q", batch).unwrap();
        (dir, env, queue)
    }

    #[test]
    fn test_fifo_order() {
        let (_dir, env, queue) = open(100);
        for value in 1..=5u64 {
            queue.put(&value).unwrap();
        }
        env.sync().unwrap();
        let taken: Vec<u64> = (0..5).map(|_| queue.take().unwrap()).collect();
        assert_eq!(taken, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_uncommitted_entries_are_invisible() {
        let (_dir, env, queue) = open(100);
        let appender = queue.appender();
        env.execute(move |txn| appender.put(txn, &9)).unwrap();

        // Still in the open write transaction.
        assert_eq!(queue.take_timeout(Duration::from_millis(0)).unwrap(), None);
        env.sync().unwrap();
        assert_eq!(queue.take_timeout(Duration::from_millis(100)).unwrap(), Some(9));
    }

    #[test]
    fn test_timeout_does_not_consume() {
        let (_dir, env, queue) = open(100);
        assert_eq!(queue.take_timeout(Duration::from_millis(20)).unwrap(), None);

        queue.put(&1).unwrap();
        env.sync().unwrap();
        assert_eq!(queue.take().unwrap(), 1);
    }

    #[test]
    fn test_trimming_bounds_table_size() {
        let (_dir, env, queue) = open(3);
        for value in 1..=10u64 {
            queue.put(&value).unwrap();
        }
        env.sync().unwrap();
        for expected in 1..=10u64 {
            assert_eq!(queue.take().unwrap(), expected);
        }
        env.sync().unwrap();

        // Trimmed after the 4th, 7th and 10th takes.
        assert_eq!(queue.size().unwrap(), 1);
    }

    #[test]
    fn test_gap_is_skipped() {
        let (_dir, env, queue) = open(100);
        let appender = queue.appender();
        let _ = env.execute(move |txn| {
            appender.put(txn, &1)?;
            Err::<(), _>(Error::invalid_argument("roll back"))
        });
        queue.put(&2).unwrap();
        env.sync().unwrap();

        assert_eq!(queue.take().unwrap(), 2);
    }

    #[test]
    fn test_close_interrupts_waiters() {
        let (_dir, env, queue) = open(100);
        let waiter = std::thread::spawn(move || queue.take());

        std::thread::sleep(Duration::from_millis(50));
        env.close().unwrap();
        assert!(waiter.join().unwrap().unwrap_err().is_interrupted());
    }

    #[test]
    fn test_clear() {
        let (_dir, env, queue) = open(100);
        for value in 1..=3u64 {
            queue.put(&value).unwrap();
        }
        queue.clear().unwrap();
        assert_eq!(queue.size().unwrap(), 0);
        assert_eq!(queue.take_timeout(Duration::from_millis(10)).unwrap(), None);

        queue.put(&7).unwrap();
        env.sync().unwrap();
        assert_eq!(queue.take().unwrap(), 7);
    }
}
