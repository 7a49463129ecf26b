use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::EngineError;

/// In-process advisory locks, one per scan.
///
/// Every read-check-write sequence against a scan's recommendations runs
/// while holding that scan's guard. Waiting is bounded; a timeout surfaces
/// as [`EngineError::ConcurrencyConflict`].
#[derive(Clone, Default)]
pub struct ScanLocks {
    inner: Arc<LockTable>,
}

#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl ScanLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, scan_id: i64, timeout: Duration) -> Result<ScanLockGuard, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.inner.held.lock().unwrap();

        while held.contains(&scan_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Timed out waiting for the lock on scan {}", scan_id);
                return Err(EngineError::ConcurrencyConflict { scan_id });
            }
            let (guard, _) = self.inner.released.wait_timeout(held, remaining).unwrap();
            held = guard;
        }

        held.insert(scan_id);

        Ok(ScanLockGuard {
            table: Arc::clone(&self.inner),
            scan_id,
        })
    }

    pub fn is_locked(&self, scan_id: i64) -> bool {
        self.inner.held.lock().unwrap().contains(&scan_id)
    }
}

/// Releases the scan's lock when dropped
pub struct ScanLockGuard {
    table: Arc<LockTable>,
    scan_id: i64,
}

impl ScanLockGuard {
    pub fn scan_id(&self) -> i64 {
        self.scan_id
    }
}

impl Drop for ScanLockGuard {
    fn drop(&mut self) {
        let mut held = match self.table.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.scan_id);
        self.table.released.notify_all();
    }
}
