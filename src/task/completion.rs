//! Completion path of one execution attempt
//!
//! [`Completion`] owns everything the attempt holds (per-task device,
//! callbacks, outcome channel). Consuming it by value makes finishing happen
//! at most once; dropping it unconsumed finishes the attempt as failed.

use super::types::{ExecStatus, NodeKey, TaskOutcome, TaskState};
use crate::error::DevmuxError;
use crate::metrics::Metrics;
use crate::sync::Semaphore;
use crate::vdevice::{DeviceHandle, PerTaskDevice};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

pub type DoneCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;
pub type MemoryFailureCallback = Box<dyn FnOnce(u32) + Send>;

/// Notification hooks for one attempt
#[derive(Default)]
pub struct TaskCallbacks {
    done: Option<DoneCallback>,
    memory_failure: Option<MemoryFailureCallback>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after resources are released when the attempt completes or
    /// fails for good
    pub fn on_done(mut self, f: impl FnOnce(&TaskOutcome) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    /// Called after resources are released when the attempt ran out of
    /// memory, with the updated failure count
    pub fn on_memory_failure(mut self, f: impl FnOnce(u32) + Send + 'static) -> Self {
        self.memory_failure = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("done", &self.done.is_some())
            .field("memory_failure", &self.memory_failure.is_some())
            .finish()
    }
}

/// State shared between a task and its in-flight completion
#[derive(Debug)]
pub(crate) struct TaskShared {
    state: Mutex<TaskState>,
    failures: AtomicU32,
}

impl TaskShared {
    pub(crate) fn new() -> Self {
        TaskShared {
            state: Mutex::new(TaskState::Created),
            failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Passed to [`Operation::execute`](super::Operation::execute)
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: DeviceHandle,
    attempt: u32,
}

impl ExecutionContext {
    pub(crate) fn new(device: DeviceHandle, attempt: u32) -> Self {
        ExecutionContext { device, attempt }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// 1 for the first run, incremented on every retry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub(crate) struct AttemptParts {
    pub key: NodeKey,
    pub has_ref_input: bool,
    pub device: PerTaskDevice,
    pub shared: Arc<TaskShared>,
    pub finished_ops: Arc<Semaphore>,
    pub metrics: Option<Arc<Metrics>>,
    pub callbacks: TaskCallbacks,
    pub sender: oneshot::Sender<TaskOutcome>,
}

/// Owned completion token for one attempt
pub struct Completion {
    parts: Option<AttemptParts>,
}

impl Completion {
    pub(crate) fn new(parts: AttemptParts) -> Self {
        Completion { parts: Some(parts) }
    }

    /// Report the kernel's status. Safe to call from any thread.
    pub fn complete(mut self, status: ExecStatus) {
        if let Some(parts) = self.parts.take() {
            finish(parts, status);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            tracing::warn!(op = %parts.key, "Completion dropped without a status");
            finish(
                parts,
                ExecStatus::Failed("completion dropped without a status".to_string()),
            );
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("op", &self.parts.as_ref().map(|p| p.key))
            .finish()
    }
}

fn finish(parts: AttemptParts, status: ExecStatus) {
    let AttemptParts {
        key,
        has_ref_input,
        device,
        shared,
        finished_ops,
        metrics,
        callbacks,
        sender,
    } = parts;

    shared.set_state(TaskState::Finishing);
    let device_name = device.name();
    let released = device.release();
    if let Some(m) = &metrics {
        m.running_ops.dec();
    }

    let mut outcome = match status {
        ExecStatus::ResourceExhausted if has_ref_input => {
            tracing::error!(op = %key, device = %device_name, "Memory failure on operation with reference-typed inputs");
            TaskOutcome::Failed(DevmuxError::RefInputRetry(key.to_string()))
        }
        ExecStatus::ResourceExhausted => {
            let failures = shared.record_failure();
            tracing::info!(op = %key, device = %device_name, failures, "Operation ran out of memory");
            TaskOutcome::MemoryFailure { failures }
        }
        ExecStatus::Ok => TaskOutcome::Completed,
        ExecStatus::Failed(msg) => TaskOutcome::Failed(DevmuxError::ExecutionFailed(msg)),
    };
    if let Err(e) = released {
        tracing::error!(op = %key, error = %e, "Failed to release per-task device");
        outcome = TaskOutcome::Failed(e);
    }

    match &outcome {
        TaskOutcome::MemoryFailure { failures } => {
            shared.set_state(TaskState::Retrying);
            if let Some(m) = &metrics {
                m.memory_failures.inc();
            }
            if let Some(cb) = callbacks.memory_failure {
                cb(*failures);
            }
        }
        TaskOutcome::Completed | TaskOutcome::Failed(_) => {
            let completed = outcome.is_completed();
            shared.set_state(if completed {
                TaskState::Completed
            } else {
                TaskState::Failed
            });
            if let Some(m) = &metrics {
                if completed {
                    m.ops_completed.inc();
                } else {
                    m.ops_failed.inc();
                }
            }
            finished_ops.notify(1);
            if let Some(cb) = callbacks.done {
                cb(&outcome);
            }
        }
    }

    tracing::debug!(op = %key, ?outcome, "Attempt finished");
    // The receiver may already be gone if nobody waits on the handle
    let _ = sender.send(outcome);
}

/// Receiving side of an attempt's outcome
#[derive(Debug)]
pub struct AttemptHandle {
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl AttemptHandle {
    pub(crate) fn new(receiver: oneshot::Receiver<TaskOutcome>) -> Self {
        AttemptHandle { receiver }
    }

    /// Block the current thread until the attempt finishes.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`outcome`](Self::outcome) there.
    pub fn wait(self) -> TaskOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| TaskOutcome::Failed(crate::internal_error!("completion channel closed")))
    }

    pub async fn outcome(self) -> TaskOutcome {
        self.receiver
            .await
            .unwrap_or_else(|_| TaskOutcome::Failed(crate::internal_error!("completion channel closed")))
    }

    /// Outcome if the attempt has already finished
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        self.receiver.try_recv().ok()
    }
}

impl std::future::IntoFuture for AttemptHandle {
    type Output = TaskOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.outcome())
    }
}
