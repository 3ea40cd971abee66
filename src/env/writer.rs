//! The single writer thread.
//!
//! Every mutation of an environment is a command applied by this thread to
//! its open [`WriteTxn`]. The transaction is committed when a caller asks for
//! it, when a `sync` barrier arrives, or when the auto-commit policy's item
//! count or interval is exceeded.
//!
//! Commit order: pre-commit hooks, WAL append (fsync for durable commits),
//! apply to the store, publish the sequence, version GC, post-commit hooks,
//! then a checkpoint if the WAL has grown past its limit.

use super::Shared;
use crate::error::Result;
use crate::txn::WriteTxn;
use crate::wal::{checkpoint_filename, wal_path, CheckpointWriter, LogFiles, Wal};
use crate::write_batch::WriteBatch;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// A mutation applied on the writer thread.
pub(crate) type WriteCommand = Box<dyn FnOnce(&mut WriteTxn<'_>) -> Result<()> + Send>;

pub(crate) enum Command {
    Write(WriteCommand),
    Commit,
    Sync(Sender<Result<()>>),
    Checkpoint(Sender<Result<()>>),
    Shutdown(Sender<Result<()>>),
}

pub(crate) struct Writer {
    shared: Arc<Shared>,
    receiver: Receiver<Command>,
    wal: Wal,
    /// WAL files from earlier runs not yet folded into a checkpoint
    stale_wals: bool,
    /// Keys whose old versions are still pinned by readers
    pending_gc: BTreeSet<(u32, Vec<u8>)>,
}

impl Writer {
    pub(crate) fn new(shared: Arc<Shared>, receiver: Receiver<Command>, wal: Wal, stale_wals: bool) -> Self {
        Self { shared, receiver, wal, stale_wals, pending_gc: BTreeSet::new() }
    }

    pub(crate) fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let options = &shared.options;
        let mut txn =
            WriteTxn::new(&shared.store, shared.committed.load(Ordering::Acquire), options.max_store_size);
        let mut commands = 0usize;
        let mut opened = Instant::now();

        loop {
            let wait = if commands == 0 {
                options.auto_commit_interval
            } else {
                options.auto_commit_interval.saturating_sub(opened.elapsed())
            };

            match self.receiver.recv_timeout(wait) {
                Ok(Command::Write(command)) => {
                    if commands == 0 {
                        opened = Instant::now();
                    }
                    apply(&mut txn, command);
                    commands += 1;
                }
                Ok(Command::Commit) => {
                    self.commit_logged(&mut txn);
                    commands = 0;
                }
                Ok(Command::Sync(done)) => {
                    let result = self.commit(&mut txn, true);
                    commands = 0;
                    let _ = done.send(result);
                }
                Ok(Command::Checkpoint(done)) => {
                    let result = self.commit(&mut txn, true).and_then(|_| self.checkpoint());
                    commands = 0;
                    let _ = done.send(result);
                }
                Ok(Command::Shutdown(done)) => {
                    let _ = done.send(self.shutdown(&mut txn));
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if let Err(e) = self.shutdown(&mut txn) {
                        log::error!("Writer shutdown failed: {}", e);
                    }
                    return;
                }
            }

            if commands > 0
                && (commands >= options.auto_commit_max_items
                    || opened.elapsed() >= options.auto_commit_interval)
            {
                self.commit_logged(&mut txn);
                commands = 0;
            }
        }
    }

    fn commit_logged(&mut self, txn: &mut WriteTxn<'_>) {
        if let Err(e) = self.commit(txn, false) {
            log::error!("Commit failed: {}", e);
        }
    }

    fn commit(&mut self, txn: &mut WriteTxn<'_>, durable: bool) -> Result<()> {
        if txn.is_empty() {
            if durable {
                self.wal.sync()?;
            }
            return Ok(());
        }

        let hooks = self.shared.hooks.pre_commit.read().clone();
        for hook in hooks {
            hook();
        }

        let sequence = txn.base_sequence() + 1;
        let batch = txn.take_batch(sequence);
        if let Err(e) = self.log_batch(&batch, durable || self.shared.options.sync_on_commit) {
            // The batch may or may not have reached the disk; never reuse its
            // sequence and never append after a possibly torn record.
            self.shared.committed.store(sequence, Ordering::Release);
            self.rotate_wal();
            return Err(e);
        }

        self.shared.store.apply(&batch);
        self.shared.committed.store(sequence, Ordering::Release);
        self.shared.wal_bytes.store(self.wal.size(), Ordering::Relaxed);
        log::debug!(
            "Committed sequence {} ({} ops, ~{} bytes{})",
            sequence,
            batch.len(),
            batch.approximate_size(),
            if durable { ", synced" } else { "" }
        );

        self.collect_garbage(&batch, sequence);

        let hooks = self.shared.hooks.post_commit.read().clone();
        for hook in hooks {
            hook();
        }

        if self.wal.size() >= self.shared.options.checkpoint_wal_size {
            if let Err(e) = self.checkpoint() {
                log::error!("Checkpoint failed: {}", e);
            }
        }
        Ok(())
    }

    fn log_batch(&mut self, batch: &WriteBatch, sync: bool) -> Result<()> {
        self.wal.append_batch(batch)?;
        if sync {
            self.wal.sync()
        } else {
            self.wal.flush()
        }
    }

    fn rotate_wal(&mut self) {
        let next = self.wal.number() + 1;
        match Wal::open(&self.shared.path, next) {
            Ok(wal) => {
                log::warn!("Switching to WAL {} after a failed write", next);
                self.wal = wal;
                self.stale_wals = true;
            }
            Err(e) => log::error!("Failed to open WAL {}: {}", next, e),
        }
    }

    fn collect_garbage(&mut self, batch: &WriteBatch, committed: u64) {
        for op in batch.iter() {
            self.pending_gc.insert((op.table(), op.key().to_vec()));
        }
        let horizon = self.shared.readers.horizon(committed);
        let store = &self.shared.store;
        self.pending_gc.retain(|(table, key)| store.prune(*table, key, horizon));
    }

    /// Writes the live state to a checkpoint named after the active WAL, then
    /// moves to a new WAL and removes the files the checkpoint supersedes.
    fn checkpoint(&mut self) -> Result<()> {
        let number = self.wal.number();
        let sequence = self.shared.committed.load(Ordering::Acquire);
        let path = self.shared.path.join(checkpoint_filename(number));

        let mut writer = CheckpointWriter::create(&path, sequence, self.shared.options.compression)?;
        for (table, key, value) in self.shared.store.iter_all(sequence) {
            writer.add(table, &key, &value)?;
        }
        let entries = writer.finish()?;

        self.wal = Wal::open(&self.shared.path, number + 1)?;
        self.stale_wals = false;
        self.shared.wal_bytes.store(0, Ordering::Relaxed);

        let files = LogFiles::scan(&self.shared.path)?;
        for old in files.wals.into_iter().filter(|n| *n <= number) {
            remove_logged(&wal_path(&self.shared.path, old));
        }
        for old in files.checkpoints.into_iter().filter(|n| *n < number) {
            remove_logged(&self.shared.path.join(checkpoint_filename(old)));
        }

        log::info!("Checkpoint {} written at sequence {} ({} entries)", number, sequence, entries);
        Ok(())
    }

    fn shutdown(&mut self, txn: &mut WriteTxn<'_>) -> Result<()> {
        self.commit(txn, true)?;
        if self.wal.size() > 0 || self.stale_wals {
            self.checkpoint()?;
        }
        log::info!("Writer stopped at sequence {}", self.shared.committed.load(Ordering::Acquire));
        Ok(())
    }
}

/// Runs one command inside a savepoint.
fn apply(txn: &mut WriteTxn<'_>, command: WriteCommand) {
    txn.begin_command();
    match panic::catch_unwind(AssertUnwindSafe(|| command(txn))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::warn!("Write command failed, rolling back its changes: {}", e);
            txn.rollback_command();
        }
        Err(_) => {
            log::error!("Write command panicked, rolling back its changes");
            txn.rollback_command();
        }
    }
}

fn remove_logged(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove {:?}: {}", path, e);
    }
}
