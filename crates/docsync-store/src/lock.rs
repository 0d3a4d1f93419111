//! Hierarchical collection write locks.
//!
//! A lock on a collection covers its whole subtree: two lock sets conflict
//! when any path in one equals, contains, or is contained by any path in the
//! other. A lock set is acquired all at once, so callers touching several
//! collections (move/copy) never hold one lock while waiting for another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::path::DocPath;

#[derive(Debug)]
struct HeldLock {
    id: u64,
    paths: Vec<DocPath>,
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<Vec<HeldLock>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl LockTable {
    fn held(&self) -> MutexGuard<'_, Vec<HeldLock>> {
        // The table holds no invariant a panicking holder could break.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn conflicts(held: &[HeldLock], wanted: &[DocPath]) -> bool {
        held.iter()
            .flat_map(|h| h.paths.iter())
            .any(|h| wanted.iter().any(|w| w.overlaps(h)))
    }
}

/// Grants subtree write locks on collections.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every path in `paths` can be locked, then lock them together.
    pub fn lock(&self, paths: &[DocPath]) -> LockGuard {
        let wanted = normalize(paths);
        let mut held = self.table.held();
        while LockTable::conflicts(&held, &wanted) {
            held = self
                .table
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        self.grant(&mut held, wanted)
    }

    /// Like [`lock`](Self::lock) but gives up after `timeout`.
    pub fn try_lock_for(&self, paths: &[DocPath], timeout: Duration) -> Option<LockGuard> {
        let wanted = normalize(paths);
        let deadline = Instant::now() + timeout;
        let mut held = self.table.held();
        while LockTable::conflicts(&held, &wanted) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .table
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            held = guard;
        }
        Some(self.grant(&mut held, wanted))
    }

    /// Number of lock sets currently held.
    pub fn held_count(&self) -> usize {
        self.table.held().len()
    }

    /// True if some held lock covers `path`.
    pub fn is_locked(&self, path: &DocPath) -> bool {
        LockTable::conflicts(&self.table.held(), std::slice::from_ref(path))
    }

    fn grant(&self, held: &mut Vec<HeldLock>, paths: Vec<DocPath>) -> LockGuard {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(lock_id = id, ?paths, "collection locks acquired");
        held.push(HeldLock { id, paths });
        LockGuard {
            table: Arc::clone(&self.table),
            id,
        }
    }
}

fn normalize(paths: &[DocPath]) -> Vec<DocPath> {
    let mut wanted = paths.to_vec();
    wanted.sort();
    wanted.dedup();
    wanted
}

/// Releases its lock set when dropped.
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    id: u64,
}

impl LockGuard {
    /// Identifier of this lock set, for diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.table.held();
        held.retain(|h| h.id != self.id);
        drop(held);
        trace!(lock_id = self.id, "collection locks released");
        self.table.released.notify_all();
    }
}
