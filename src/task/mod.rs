//! Operation tasks: estimate, admit, bind, execute, then finish or retry
//!
//! An [`OperationTask`] wraps one [`Operation`] for its whole life. Each call
//! to [`prepare`](OperationTask::prepare) starts a new attempt on a concrete
//! device; [`run`](OperationTask::run) hands the bound device to the kernel
//! and returns an [`AttemptHandle`] that yields the attempt's outcome once
//! every resource it held has been returned.

pub mod completion;
pub mod operation;
pub mod types;

pub use completion::{AttemptHandle, Completion, ExecutionContext, TaskCallbacks};
pub use operation::{Operation, OutputSpec};
pub use types::{ExecStatus, GraphId, NodeId, NodeKey, TaskOutcome, TaskState};

use crate::device::{DeviceItem, DeviceSpec, DeviceType};
use crate::error::{DevmuxError, DevmuxResult};
use crate::estimator::UsageEstimator;
use crate::metrics::Metrics;
use crate::resources::{ResourceContext, ResourceMap, ResourceMonitor};
use crate::sync::Semaphore;
use crate::vdevice::{PerTaskDevice, VirtualDeviceManager};
use completion::{AttemptParts, TaskShared};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Collaborators shared by every task of one executor
#[derive(Debug, Clone)]
pub struct ExecutionEnv {
    pub monitor: Arc<ResourceMonitor>,
    pub estimator: Arc<UsageEstimator>,
    pub devices: Arc<VirtualDeviceManager>,
    /// Bumped once per finished (completed or failed) task
    pub finished_ops: Arc<Semaphore>,
    pub metrics: Option<Arc<Metrics>>,
    pub max_failures: u32,
}

/// One operation moving through admission and execution
pub struct OperationTask {
    op: Arc<dyn Operation>,
    env: ExecutionEnv,
    supported: Vec<DeviceType>,
    shared: Arc<TaskShared>,
    items: HashMap<DeviceSpec, DeviceItem>,
    prepared: Option<PerTaskDevice>,
    attempts: u32,
}

impl OperationTask {
    /// Wrap `op` and pre-compute its estimate on each supported device
    /// type's first device
    pub fn new(op: Arc<dyn Operation>, env: ExecutionEnv) -> Self {
        let mut supported = op.supported_device_types();
        supported.sort();
        supported.dedup();

        for device_type in &supported {
            let spec = DeviceSpec::new(*device_type, 0);
            if let Err(e) = env.estimator.estimate(op.as_ref(), &spec, 0) {
                tracing::warn!(op = %op.key(), device = %spec, error = %e, "Initial estimate failed");
            }
        }

        OperationTask {
            op,
            env,
            supported,
            shared: Arc::new(TaskShared::new()),
            items: HashMap::new(),
            prepared: None,
            attempts: 0,
        }
    }

    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.op
    }

    pub fn key(&self) -> NodeKey {
        self.op.key()
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn supported_device_types(&self) -> &[DeviceType] {
        &self.supported
    }

    pub fn failed_times(&self) -> u32 {
        self.shared.failures()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Device the current attempt is bound to, if prepared
    pub fn prepared_device(&self) -> Option<DeviceSpec> {
        self.prepared.as_ref().map(PerTaskDevice::spec)
    }

    /// Current estimate on `device`, decayed by the failure count
    pub fn estimated_usage(&self, device: &DeviceSpec) -> DevmuxResult<ResourceMap> {
        self.env
            .estimator
            .estimate(self.op.as_ref(), device, self.failed_times())
    }

    /// Last cached estimate on `device`
    pub fn last_usage(&self, device: &DeviceSpec) -> DevmuxResult<Option<ResourceMap>> {
        self.env.estimator.last_usage(self.op.key(), device)
    }

    /// Admit and bind the next attempt on `device`.
    ///
    /// `ResourceExhausted`, `UnsupportedDevice` and `DeviceUnavailable` leave
    /// the task preparable so the caller can try elsewhere. Placement
    /// conflicts and an exhausted failure budget fail the task.
    pub fn prepare(&mut self, device: &DeviceSpec) -> DevmuxResult<()> {
        let idle = self.state();
        if !idle.can_prepare() || self.prepared.is_some() {
            return Err(DevmuxError::InvalidState {
                expected: "Created or Retrying".to_string(),
                actual: idle.to_string(),
            });
        }

        let failures = self.failed_times();
        if failures > self.env.max_failures {
            tracing::error!(op = %self.key(), failures, max = self.env.max_failures, "Giving up after repeated memory failures");
            self.fail();
            return Err(DevmuxError::MaxFailuresExceeded {
                node: self.key().to_string(),
                failures,
                max: self.env.max_failures,
            });
        }

        if !self.supported.contains(&device.device_type) {
            return Err(DevmuxError::UnsupportedDevice {
                node: self.key().to_string(),
                device_type: device.device_type.to_string(),
            });
        }

        // Nothing is reserved for a device the registry does not know
        let item = match self.device_item(device) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(op = %self.key(), %device, error = %e, "Device lookup failed");
                return Err(self.abort(idle, e));
            }
        };

        self.shared.set_state(TaskState::Estimating);
        let usage = match self.estimated_usage(device) {
            Ok(usage) => usage,
            Err(e) => return Err(self.abort(idle, e)),
        };

        self.shared.set_state(TaskState::Admitting);
        let ticket = match self.env.monitor.reserve(&usage) {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                if let Some(m) = &self.env.metrics {
                    m.admission_rejections.inc();
                }
                self.shared.set_state(idle);
                return Err(DevmuxError::exhausted(
                    device,
                    format!("can not reserve {}", usage),
                ));
            }
            Err(e) => return Err(self.abort(idle, e)),
        };
        let resources = ResourceContext::new(*device, ticket, Arc::clone(&self.env.monitor));

        self.shared.set_state(TaskState::Binding);
        match self.env.devices.bind(self.op.as_ref(), &item, resources) {
            Ok(bound) => {
                self.prepared = Some(bound);
                self.shared.set_state(TaskState::Prepared);
                tracing::debug!(op = %self.key(), %device, %usage, failures, "Prepared");
                Ok(())
            }
            Err(e) => {
                tracing::error!(op = %self.key(), %device, error = %e, "Binding failed");
                self.fail();
                Err(e)
            }
        }
    }

    /// Hand the prepared device to the kernel
    pub fn run(&mut self, callbacks: TaskCallbacks) -> DevmuxResult<AttemptHandle> {
        let Some(device) = self.prepared.take() else {
            return Err(DevmuxError::InvalidState {
                expected: TaskState::Prepared.to_string(),
                actual: self.state().to_string(),
            });
        };

        self.attempts += 1;
        self.shared.set_state(TaskState::Executing);
        self.env.devices.record_kernel(self.key(), &device.name())?;

        let ctx = ExecutionContext::new(device.handle(), self.attempts);
        let (sender, receiver) = oneshot::channel();
        let completion = Completion::new(AttemptParts {
            key: self.key(),
            has_ref_input: self.op.has_ref_input(),
            device,
            shared: Arc::clone(&self.shared),
            finished_ops: Arc::clone(&self.env.finished_ops),
            metrics: self.env.metrics.clone(),
            callbacks,
            sender,
        });

        if let Some(m) = &self.env.metrics {
            m.ops_started.inc();
            m.running_ops.inc();
        }
        tracing::trace!(op = %self.key(), op_type = self.op.op_type(), attempt = self.attempts, "Executing");
        self.op.execute(ctx, completion);
        Ok(AttemptHandle::new(receiver))
    }

    /// Give back a prepared attempt that will not run
    pub fn unprepare(&mut self) -> DevmuxResult<()> {
        if let Some(device) = self.prepared.take() {
            device.release()?;
            let idle = if self.failed_times() > 0 {
                TaskState::Retrying
            } else {
                TaskState::Created
            };
            self.shared.set_state(idle);
        }
        Ok(())
    }

    fn device_item(&mut self, device: &DeviceSpec) -> DevmuxResult<DeviceItem> {
        if let Some(item) = self.items.get(device) {
            return Ok(item.clone());
        }
        let item = self.env.devices.lookup(device)?;
        self.items.insert(*device, item.clone());
        Ok(item)
    }

    /// Terminal failure outside an attempt
    fn fail(&self) {
        self.shared.set_state(TaskState::Failed);
        if let Some(m) = &self.env.metrics {
            m.ops_failed.inc();
        }
        self.env.finished_ops.notify(1);
    }

    fn abort(&self, idle: TaskState, err: DevmuxError) -> DevmuxError {
        self.shared.set_state(idle);
        err
    }
}

impl fmt::Display for OperationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OperationTask({} {}, state={}, failures={}",
            self.key(),
            self.op.op_type(),
            self.state(),
            self.failed_times()
        )?;
        if let Some(device) = self.prepared_device() {
            write!(f, ", device={}", device)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for OperationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
