use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Coalescing cross-core signal.
///
/// Ringing an already raised doorbell is a no-op apart from the ring
/// counter, so the receiving side sees at most one pending wakeup.
#[derive(Debug, Default)]
pub struct Doorbell {
    raised: Mutex<bool>,
    cv: Condvar,
    rings: AtomicU64,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the doorbell. Returns true if it was not already raised.
    pub fn ring(&self) -> bool {
        self.rings.fetch_add(1, Ordering::Relaxed);
        let mut raised = self.raised.lock();
        let newly = !*raised;
        *raised = true;
        if newly {
            self.cv.notify_all();
        }
        newly
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Lower the doorbell, returning whether it was raised.
    pub fn take(&self) -> bool {
        std::mem::replace(&mut *self.raised.lock(), false)
    }

    /// Wait for the doorbell to be raised and lower it.
    ///
    /// Returns false if `timeout` expired first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock();
        loop {
            if *raised {
                *raised = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut raised, deadline - now);
        }
    }

    /// Total number of `ring` calls, coalesced or not.
    pub fn ring_count(&self) -> u64 {
        self.rings.load(Ordering::Relaxed)
    }
}
