//! # Environment - Single-Writer Transactional Table Space
//!
//! An [`Environment`] owns one on-disk directory and any number of named
//! tables inside it. All mutations are closures handed to one dedicated
//! writer thread through a bounded command queue; readers run concurrently
//! on snapshot-isolated [`ReadTxn`]s.
//!
//! ## Files
//!
//! - `NNNNNN.log`: write-ahead log, one entry per committed transaction
//! - `NNNNNN.ckpt`: full image of the store as of the end of WAL `NNNNNN`
//!
//! ## Recovery
//!
//! Opening loads the newest readable checkpoint, replays every WAL numbered
//! after it and starts a fresh WAL numbered after every existing file.

mod readers;
mod writer;

pub(crate) use readers::ReaderRegistry;

use crate::codec::Codec;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::store::{InternalKey, ValueType, VersionedStore};
use crate::txn::{Direction, KeyRange, ReadTxn, Transaction, WriteTxn};
use crate::wal::{checkpoint_filename, wal_path, Checkpoint, LogFiles, Wal};
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use writer::{Command, Writer};

/// Handle to a named table of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    id: u32,
}

impl Table {
    pub(crate) const fn from_id(id: u32) -> Self {
        Self { id }
    }

    /// Numeric id of the table inside the environment.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Reserved table mapping table names to ids.
const CATALOG: Table = Table::from_id(0);

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    pre_commit: RwLock<Vec<Hook>>,
    post_commit: RwLock<Vec<Hook>>,
    close: Mutex<Vec<Hook>>,
}

/// State shared between the environment handle and its writer thread.
pub(crate) struct Shared {
    path: PathBuf,
    options: Options,
    store: VersionedStore,
    committed: AtomicU64,
    readers: ReaderRegistry,
    tables: RwLock<HashMap<String, Table>>,
    hooks: Hooks,
    wal_bytes: AtomicU64,
    closed: AtomicBool,
}

/// Diagnostic snapshot of an environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvInfo {
    /// Environment directory
    pub path: PathBuf,
    /// Last committed sequence
    pub committed_sequence: u64,
    /// Open read transactions
    pub active_readers: usize,
    /// Reader limit
    pub max_readers: usize,
    /// Stored versions, tombstones and superseded versions included
    pub versions: usize,
    /// Approximate in-memory size of the store in bytes
    pub approximate_size: usize,
    /// Store size limit in bytes
    pub max_store_size: usize,
    /// Bytes in the active WAL
    pub wal_bytes: u64,
    /// Bytes used by every file in the environment directory
    pub disk_bytes: u64,
    /// Per-table entry counts
    pub tables: Vec<TableInfo>,
}

/// Entry count of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Table id
    pub id: u32,
    /// Live entries
    pub entries: usize,
}

impl EnvInfo {
    /// Renders the info as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// A single-writer, multi-reader environment.
///
/// # Example
///
/// ```rust,no_run
/// use proxydb::{Environment, Options, Transaction};
///
/// # fn main() -> Result<(), proxydb::Error> {
/// let env = Environment::open("./data", Options::default())?;
/// let table = env.open_table("greetings")?;
///
/// env.write(move |txn| {
///     txn.put(table, b"hello", b"world")?;
///     Ok(())
/// })?;
/// env.sync()?;
///
/// let value = env.read(|txn| Ok(txn.get(table, b"hello")))?;
/// assert_eq!(value, Some(b"world".to_vec()));
/// env.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Environment {
    shared: Arc<Shared>,
    sender: RwLock<Option<Sender<Command>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Environment {
    /// Opens the environment at `path`, recovering any existing state.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are invalid
    /// - The directory is missing and `create_if_missing` is false
    /// - The directory holds an environment and `error_if_exists` is true
    /// - Recovery fails on unreadable files
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Arc<Self>> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let files = LogFiles::scan(&path)?;
            if options.error_if_exists && (!files.wals.is_empty() || !files.checkpoints.is_empty()) {
                return Err(Error::AlreadyExists(format!("{:?}", path)));
            }
        } else if options.create_if_missing {
            std::fs::create_dir_all(&path)?;
        } else {
            return Err(Error::not_found(format!("{:?}", path)));
        }

        log::info!("Opening environment at {:?}", path);
        let store = VersionedStore::new();
        let recovered = recover(&path, &store)?;
        store.prune_all(recovered.committed);

        let mut tables = HashMap::new();
        let catalog = store.scan(CATALOG.id, Bound::Unbounded, Bound::Unbounded, recovered.committed, Direction::Forward);
        for (_, name, id) in catalog {
            let name = String::decode(&name)?;
            tables.insert(name, Table::from_id(u32::decode(&id)?));
        }

        let wal = Wal::open(&path, recovered.next_file_number)?;
        let (sender, receiver) = channel::bounded(options.command_queue_capacity);

        let shared = Arc::new(Shared {
            path: path.clone(),
            readers: ReaderRegistry::new(options.max_readers),
            options,
            store,
            committed: AtomicU64::new(recovered.committed),
            tables: RwLock::new(tables),
            hooks: Hooks::default(),
            wal_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let writer = Writer::new(Arc::clone(&shared), receiver, wal, recovered.stale_wals);
        let handle = std::thread::Builder::new().name("proxydb-writer".to_string()).spawn(move || writer.run())?;

        log::info!(
            "Environment open at sequence {} with {} tables",
            recovered.committed,
            shared.tables.read().len()
        );

        Ok(Arc::new(Self {
            shared,
            sender: RwLock::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
        }))
    }

    /// Deletes the directory of a closed environment.
    pub fn destroy<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            log::info!("Destroying environment at {:?}", path);
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Environment directory.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Options the environment was opened with.
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Last committed sequence.
    pub fn committed_sequence(&self) -> u64 {
        self.shared.committed.load(Ordering::Acquire)
    }

    /// Returns true once [`Environment::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Opens the table called `name`, creating it if needed.
    ///
    /// A newly created table is durable when this returns.
    pub fn open_table(&self, name: &str) -> Result<Table> {
        if name.is_empty() {
            return Err(Error::invalid_argument("table name must not be empty"));
        }
        if let Some(table) = self.shared.tables.read().get(name) {
            return Ok(*table);
        }

        let max_tables = self.shared.options.max_tables;
        let key = name.as_bytes().to_vec();
        let table = self.execute(move |txn| {
            if let Some(id) = txn.get(CATALOG, &key) {
                return Ok(Table::from_id(u32::decode(&id)?));
            }
            let existing = txn.count(CATALOG, &KeyRange::all());
            if existing >= max_tables {
                return Err(Error::TooManyTables(max_tables));
            }
            let id = existing as u32 + 1;
            txn.put(CATALOG, &key, &id.to_bytes())?;
            Ok(Table::from_id(id))
        })?;
        self.sync()?;

        self.shared.tables.write().insert(name.to_string(), table);
        log::debug!("Opened table {:?} with id {}", name, table.id());
        Ok(table)
    }

    /// Names of every table, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.read(|txn| {
            txn.scan(CATALOG, &KeyRange::all(), Direction::Forward)
                .map(|(name, _)| String::decode(&name))
                .collect()
        })
    }

    /// Queues a mutation for the writer thread.
    ///
    /// Blocks only while the command queue is full. Errors returned by `f`
    /// roll back its changes and are logged by the writer.
    pub fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<()> + Send + 'static,
    {
        self.send(Command::Write(Box::new(f)))
    }

    /// Runs `f` on the writer thread and returns its result once applied.
    ///
    /// The changes are part of the open write transaction and become
    /// visible to readers, and durable, at its commit. If `f` fails its
    /// changes are rolled back and the error is returned here.
    pub fn execute<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WriteTxn<'_>) -> Result<R> + Send + 'static,
    {
        let (done, result) = channel::bounded(1);
        self.send(Command::Write(Box::new(move |txn| {
            let outcome = f(txn);
            if outcome.is_err() {
                txn.rollback_command();
            }
            let _ = done.send(outcome);
            Ok(())
        })))?;
        result.recv().map_err(|_| Error::internal("write command did not complete"))?
    }

    /// Runs `f` on a snapshot of the last committed state.
    ///
    /// Blocks while `max_readers` read transactions are open.
    pub fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<R>,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let snapshot = self.shared.readers.acquire(&self.shared.committed);
        let txn = ReadTxn::new(&self.shared.store, &self.shared.readers, snapshot);
        f(&txn)
    }

    /// Asks the writer to commit without waiting.
    pub fn commit(&self) -> Result<()> {
        self.send(Command::Commit)
    }

    /// Commits and fsyncs everything queued before this call.
    pub fn sync(&self) -> Result<()> {
        let (done, result) = channel::bounded(1);
        self.send(Command::Sync(done))?;
        result.recv().map_err(|_| Error::Closed)?
    }

    /// Commits, then writes a checkpoint and starts a new WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let (done, result) = channel::bounded(1);
        self.send(Command::Checkpoint(done))?;
        result.recv().map_err(|_| Error::Closed)?
    }

    /// Registers a callback run on the writer thread before every commit.
    pub fn add_pre_commit_hook<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.shared.hooks.pre_commit.write().push(Arc::new(hook));
    }

    /// Registers a callback run on the writer thread after every commit.
    pub fn add_post_commit_hook<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.shared.hooks.post_commit.write().push(Arc::new(hook));
    }

    /// Registers a callback run once when the environment closes.
    pub fn add_close_hook<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.shared.hooks.close.lock().push(Arc::new(hook));
    }

    /// Collects diagnostics about the environment.
    pub fn info(&self) -> Result<EnvInfo> {
        let names = self.shared.tables.read().clone();
        let mut tables = self.read(|txn| {
            Ok(names
                .into_iter()
                .map(|(name, table)| TableInfo { entries: txn.count(table, &KeyRange::all()), id: table.id(), name })
                .collect::<Vec<_>>())
        })?;
        tables.sort_by_key(|t| t.id);

        let mut disk_bytes = 0;
        for entry in std::fs::read_dir(&self.shared.path)? {
            disk_bytes += entry?.metadata()?.len();
        }

        Ok(EnvInfo {
            path: self.shared.path.clone(),
            committed_sequence: self.committed_sequence(),
            active_readers: self.shared.readers.active(),
            max_readers: self.shared.options.max_readers,
            versions: self.shared.store.len(),
            approximate_size: self.shared.store.approximate_size(),
            max_store_size: self.shared.options.max_store_size,
            wal_bytes: self.shared.wal_bytes.load(Ordering::Relaxed),
            disk_bytes,
            tables,
        })
    }

    /// Writes every entry of `table` to `out` as `key => value` hex lines.
    /// Returns the number of entries written.
    pub fn dump_table<W: Write>(&self, table: Table, out: &mut W) -> Result<usize> {
        self.read(|txn| {
            let mut count = 0;
            for (key, value) in txn.scan(table, &KeyRange::all(), Direction::Forward) {
                writeln!(out, "{} => {}", hex(&key), hex(&value))?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Commits pending work, writes a final checkpoint, stops the writer and
    /// wakes every waiter registered through a close hook.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Closing environment at {:?}", self.shared.path);

        let on_writer = self
            .writer
            .lock()
            .as_ref()
            .map_or(false, |handle| handle.thread().id() == std::thread::current().id());
        if on_writer {
            // The last handle went away inside a write command. Dropping the
            // sender lets the writer drain, commit and stop on its own.
            log::warn!("Environment released on its writer thread, stopping asynchronously");
            self.sender.write().take();
            self.writer.lock().take();
            self.run_close_hooks();
            return Ok(());
        }

        let result = match self.sender.write().take() {
            Some(sender) => {
                let (done, stopped) = channel::bounded(1);
                match sender.send(Command::Shutdown(done)) {
                    Ok(()) => stopped.recv().unwrap_or_else(|_| Err(Error::internal("writer exited during shutdown"))),
                    Err(_) => Err(Error::internal("writer thread is gone")),
                }
            }
            None => Ok(()),
        };

        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                log::error!("Writer thread panicked");
            }
        }

        self.run_close_hooks();
        result
    }

    fn run_close_hooks(&self) {
        let hooks: Vec<Hook> = self.shared.hooks.close.lock().drain(..).collect();
        for hook in hooks {
            hook();
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.read().clone().ok_or(Error::Closed)?;
        sender.send(command).map_err(|_| Error::Closed)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close environment {:?}: {}", self.shared.path, e);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

struct Recovered {
    committed: u64,
    next_file_number: u64,
    stale_wals: bool,
}

fn recover(path: &Path, store: &VersionedStore) -> Result<Recovered> {
    let files = LogFiles::scan(path)?;
    let mut committed = 0;
    let mut base = 0;

    for &number in files.checkpoints.iter().rev() {
        match Checkpoint::load(&path.join(checkpoint_filename(number))) {
            Ok(checkpoint) => {
                let entries = checkpoint.entries.len();
                for (table, key, value) in checkpoint.entries {
                    store.insert(InternalKey::new(table, key, checkpoint.sequence, ValueType::Value), value);
                }
                committed = checkpoint.sequence;
                base = number;
                log::info!("Loaded checkpoint {} at sequence {} ({} entries)", number, committed, entries);
                break;
            }
            Err(e) => log::warn!("Skipping unreadable checkpoint {}: {}", number, e),
        }
    }

    let replay: Vec<u64> = files.wals.iter().copied().filter(|n| *n > base).collect();
    for &number in &replay {
        let after = committed;
        let applied = Wal::replay(wal_path(path, number), after, |batch| {
            committed = committed.max(batch.sequence());
            store.apply(&batch);
        })?;
        log::info!("Replayed {} batches from WAL {}", applied, number);
    }

    Ok(Recovered { committed, next_file_number: files.max_number() + 1, stale_wals: !replay.is_empty() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options() -> Options {
        Options::default().auto_commit(10, Duration::from_millis(10))
    }

    #[test]
    fn test_open_table_is_stable() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), options()).unwrap();

        let a = env.open_table("a").unwrap();
        let b = env.open_table("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(env.open_table("a").unwrap(), a);
        assert_eq!(env.table_names().unwrap(), vec!["a".to_string(), "b".to_string()]);
        env.close().unwrap();

        let env = Environment::open(dir.path(), options()).unwrap();
        assert_eq!(env.open_table("b").unwrap(), b);
    }

    #[test]
    fn test_table_limit() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), options().max_tables(1)).unwrap();

        env.open_table("only").unwrap();
        assert!(matches!(env.open_table("another"), Err(Error::TooManyTables(1))));
    }

    #[test]
    fn test_execute_error_rolls_back() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), options()).unwrap();
        let table = env.open_table("t").unwrap();

        let result: Result<()> = env.execute(move |txn| {
            txn.put(table, b"partial", b"v")?;
            Err(Error::invalid_argument("nope"))
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        env.sync().unwrap();
        assert_eq!(env.read(|txn| Ok(txn.get(table, b"partial"))).unwrap(), None);
    }

    #[test]
    fn test_error_if_exists() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), options()).unwrap();
        env.open_table("t").unwrap();
        env.close().unwrap();

        let mut opts = options();
        opts.error_if_exists = true;
        assert!(matches!(Environment::open(dir.path(), opts), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_missing_dir_without_create() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let result = Environment::open(&missing, options().create_if_missing(false));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_dump_table() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), options()).unwrap();
        let table = env.open_table("t").unwrap();
        env.execute(move |txn| txn.put(table, &[0x01, 0xab], b"\x10").map(|_| ())).unwrap();
        env.sync().unwrap();

        let mut out = Vec::new();
        assert_eq!(env.dump_table(table, &mut out).unwrap(), 1);
        assert_eq!(String::from_utf8(out).unwrap(), "01ab => 10\n");
    }
}
