//! Reader slots and snapshot tracking.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct ReaderState {
    /// Snapshot sequence -> number of open readers on it
    active: BTreeMap<u64, usize>,
    count: usize,
}

/// Bounds concurrent read transactions and records the snapshots they pin.
pub(crate) struct ReaderRegistry {
    state: Mutex<ReaderState>,
    freed: Condvar,
    max_readers: usize,
}

impl ReaderRegistry {
    pub(crate) fn new(max_readers: usize) -> Self {
        Self { state: Mutex::new(ReaderState::default()), freed: Condvar::new(), max_readers }
    }

    /// Takes a reader slot, blocking while all slots are in use, and pins the
    /// current committed sequence.
    pub(crate) fn acquire(&self, committed: &AtomicU64) -> u64 {
        let mut state = self.state.lock();
        while state.count >= self.max_readers {
            self.freed.wait(&mut state);
        }
        // Read under the lock so the writer's horizon never skips this reader.
        let snapshot = committed.load(Ordering::Acquire);
        *state.active.entry(snapshot).or_insert(0) += 1;
        state.count += 1;
        snapshot
    }

    pub(crate) fn release(&self, snapshot: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(&snapshot);
            }
            state.count -= 1;
        }
        self.freed.notify_one();
    }

    /// Oldest snapshot any reader may still observe.
    pub(crate) fn horizon(&self, committed: u64) -> u64 {
        let state = self.state.lock();
        state.active.keys().next().map_or(committed, |oldest| (*oldest).min(committed))
    }

    /// Number of open read transactions.
    pub(crate) fn active(&self) -> usize {
        self.state.lock().count
    }
}
