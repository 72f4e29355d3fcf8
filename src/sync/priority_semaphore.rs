//! Counting semaphore with strict-priority admission
//!
//! A request at priority `p` is never granted while a request at a strictly
//! higher priority (lower number) is pending. Priority 0 is the highest.
//! Requests at the same level are not ordered among themselves.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SemState {
    count: u64,
    /// Blocked requests per priority level
    pending: Vec<u64>,
}

impl SemState {
    /// A woken waiter has not yet left `pending[p]`, so only levels strictly
    /// above `p` are consulted.
    fn can_take(&self, units: u64, priority: usize) -> bool {
        self.pending[..priority].iter().all(|&n| n == 0) && self.count >= units
    }
}

/// Priority-ordered counting semaphore
#[derive(Debug)]
pub struct PrioritySemaphore {
    state: Mutex<SemState>,
    /// One wait queue per priority level
    queues: Vec<Condvar>,
}

impl PrioritySemaphore {
    /// Create a semaphore with `levels` priority levels and `initial` units
    pub fn new(levels: usize, initial: u64) -> Self {
        let levels = levels.max(1);
        PrioritySemaphore {
            state: Mutex::new(SemState {
                count: initial,
                pending: vec![0; levels],
            }),
            queues: (0..levels).map(|_| Condvar::new()).collect(),
        }
    }

    pub fn levels(&self) -> usize {
        self.queues.len()
    }

    /// Units currently available
    pub fn available(&self) -> u64 {
        self.lock().count
    }

    /// Number of blocked requests at `priority`
    pub fn pending_at(&self, priority: usize) -> u64 {
        let priority = self.clamp(priority);
        self.lock().pending[priority]
    }

    /// Credit `units` and wake the highest priority level with pending waiters
    pub fn post(&self, units: u64) {
        let mut state = self.lock();
        state.count += units;
        if let Some(level) = state.pending.iter().position(|&n| n > 0) {
            tracing::trace!(units, level, count = state.count, "Waking priority level");
            self.queues[level].notify_all();
        }
    }

    /// Block until `units` are available and no higher-priority request is
    /// pending, then debit them
    pub fn wait(&self, units: u64, priority: usize) {
        let priority = self.clamp(priority);
        let mut state = self.lock();
        if !state.can_take(units, priority) {
            state.pending[priority] += 1;
            while !state.can_take(units, priority) {
                state = self.queues[priority]
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.pending[priority] -= 1;
        }
        state.count -= units;
        self.wake_next(&state);
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if the units were debited.
    pub fn wait_timeout(&self, units: u64, priority: usize, timeout: Duration) -> bool {
        let priority = self.clamp(priority);
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if !state.can_take(units, priority) {
            state.pending[priority] += 1;
            while !state.can_take(units, priority) {
                let now = Instant::now();
                if now >= deadline {
                    state.pending[priority] -= 1;
                    // Lower levels may have been held back by this request
                    self.wake_next(&state);
                    return false;
                }
                state = self.queues[priority]
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            state.pending[priority] -= 1;
        }
        state.count -= units;
        self.wake_next(&state);
        true
    }

    /// Take `units` only if that is possible right now. Never registers as
    /// pending, but still yields to pending higher-priority requests.
    pub fn try_wait(&self, units: u64, priority: usize) -> bool {
        let priority = self.clamp(priority);
        let mut state = self.lock();
        if state.can_take(units, priority) {
            state.count -= units;
            true
        } else {
            false
        }
    }

    /// Blocking acquire returning a guard that posts the units back on drop
    pub fn acquire(&self, units: u64, priority: usize) -> PermitGuard<'_> {
        self.wait(units, priority);
        PermitGuard { sem: self, units }
    }

    /// Units left over after a grant may satisfy the next pending level
    fn wake_next(&self, state: &SemState) {
        if state.count == 0 {
            return;
        }
        if let Some(level) = state.pending.iter().position(|&n| n > 0) {
            self.queues[level].notify_all();
        }
    }

    fn clamp(&self, priority: usize) -> usize {
        let max = self.queues.len() - 1;
        if priority > max {
            tracing::warn!(priority, max, "Priority out of range, clamping to lowest level");
            max
        } else {
            priority
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Units held from a [`PrioritySemaphore`], returned on drop
#[derive(Debug)]
pub struct PermitGuard<'a> {
    sem: &'a PrioritySemaphore,
    units: u64,
}

impl PermitGuard<'_> {
    pub fn units(&self) -> u64 {
        self.units
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.sem.post(self.units);
    }
}
