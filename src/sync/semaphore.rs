//! Plain counting semaphore

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Counting semaphore without priorities.
///
/// Used as the finished-operations counter: every finished task calls
/// [`notify`](Semaphore::notify) and observers block in [`wait`](Semaphore::wait).
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self, units: u64) {
        let mut count = self.lock();
        *count += units;
        self.cond.notify_all();
    }

    pub fn wait(&self, units: u64) {
        let mut count = self.lock();
        while *count < units {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= units;
    }

    /// Returns `false` if `units` did not become available within `timeout`
    pub fn wait_timeout(&self, units: u64, timeout: Duration) -> bool {
        let count = self.lock();
        let (mut count, result) = self
            .cond
            .wait_timeout_while(count, timeout, |c| *c < units)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && *count < units {
            return false;
        }
        *count -= units;
        true
    }

    pub fn count(&self) -> u64 {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
