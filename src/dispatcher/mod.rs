//! Worker-side driver for operation tasks
//!
//! The dispatcher owns the collaborators every task shares and drives one
//! task at a time per calling thread:
//!
//! 1. wait for an admission slot at the caller's priority
//! 2. try devices in preference order, falling back on exhaustion
//! 3. back off and retry when no device can admit the operation
//! 4. run the attempt and, on memory failure, go back to step 2 with a
//!    decayed estimate until the failure budget runs out

use crate::config::ExecConfig;
use crate::device::{DeviceRegistry, DeviceSpec, DeviceType};
use crate::error::{DevmuxError, DevmuxResult};
use crate::estimator::{OutputSizeEstimator, ShapeEstimator, UsageEstimator};
use crate::metrics::Metrics;
use crate::resources::{ResourceMonitor, ResourceTracker};
use crate::sync::{PrioritySemaphore, Semaphore};
use crate::task::{ExecutionEnv, GraphId, Operation, OperationTask, TaskCallbacks, TaskOutcome};
use crate::vdevice::VirtualDeviceManager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub device: DeviceSpec,
    /// Kernel runs, including the successful one
    pub attempts: u32,
    pub memory_failures: u32,
    /// Backoff rounds spent waiting for capacity
    pub admission_retries: usize,
}

/// Point-in-time view of dispatcher activity
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub finished_ops: u64,
    pub outstanding_tickets: usize,
    pub streams_in_use: usize,
    pub outstanding: BTreeMap<String, u64>,
    pub free_slots: u64,
    /// Callers blocked on an admission slot, indexed by priority
    pub waiting: Vec<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Admission-controlled executor over a device registry
#[derive(Debug)]
pub struct Dispatcher {
    config: ExecConfig,
    env: ExecutionEnv,
    tracker: Arc<ResourceTracker>,
    slots: PrioritySemaphore,
    counters: Counters,
}

impl Dispatcher {
    /// Dispatcher using [`OutputSizeEstimator`] for structural estimates
    pub fn new(config: ExecConfig, registry: Arc<dyn DeviceRegistry>) -> DevmuxResult<Self> {
        Self::with_shape_estimator(config, registry, Arc::new(OutputSizeEstimator))
    }

    pub fn with_shape_estimator(
        config: ExecConfig,
        registry: Arc<dyn DeviceRegistry>,
        shapes: Arc<dyn ShapeEstimator>,
    ) -> DevmuxResult<Self> {
        config.validate()?;
        let tracker = Arc::new(ResourceTracker::new());
        let env = ExecutionEnv {
            monitor: Arc::new(ResourceMonitor::new(config.memory_limits()?)),
            estimator: Arc::new(UsageEstimator::new(
                shapes,
                Arc::clone(&tracker),
                config.max_failures,
            )),
            devices: Arc::new(VirtualDeviceManager::new(
                registry,
                config.max_streams_per_gpu,
            )),
            finished_ops: Arc::new(Semaphore::new(0)),
            metrics: None,
            max_failures: config.max_failures,
        };
        tracing::info!(
            max_failures = config.max_failures,
            priorities = config.max_priority,
            slots = config.max_concurrent_ops,
            "Dispatcher ready"
        );
        Ok(Dispatcher {
            slots: PrioritySemaphore::new(config.max_priority, config.max_concurrent_ops),
            config,
            env,
            tracker,
            counters: Counters::default(),
        })
    }

    /// Record metrics for every task created from now on
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.env.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn env(&self) -> &ExecutionEnv {
        &self.env
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.env.monitor
    }

    pub fn create_task(&self, op: Arc<dyn Operation>) -> OperationTask {
        OperationTask::new(op, self.env.clone())
    }

    /// Devices to try for `task`, GPUs first. A task whose kernel already
    /// exists somewhere only gets that device.
    pub fn candidate_devices(&self, task: &OperationTask) -> DevmuxResult<Vec<DeviceSpec>> {
        if let Some(name) = self.env.devices.kernel_device(task.key())? {
            if let Some(spec) = DeviceSpec::parse(&name) {
                return Ok(vec![spec]);
            }
        }
        let registry = self.env.devices.registry();
        Ok(DeviceType::ALL
            .iter()
            .filter(|t| task.supported_device_types().contains(t))
            .flat_map(|t| registry.devices_of_type(*t))
            .collect())
    }

    /// [`dispatch`](Self::dispatch) at the configured default priority
    pub fn dispatch_default(&self, task: &mut OperationTask) -> DevmuxResult<DispatchReport> {
        self.dispatch(task, self.config.default_priority)
    }

    /// Drive `task` to completion at `priority`, blocking the calling thread
    pub fn dispatch(&self, task: &mut OperationTask, priority: usize) -> DevmuxResult<DispatchReport> {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let result = self.dispatch_inner(task, priority);
        match &result {
            Ok(report) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(op = %task.key(), device = %report.device, attempts = report.attempts, "Dispatched");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op = %task.key(), error = %e, category = %e.category(), "Dispatch failed");
            }
        }
        result
    }

    fn dispatch_inner(&self, task: &mut OperationTask, priority: usize) -> DevmuxResult<DispatchReport> {
        let waited = Instant::now();
        let _slot = self.slots.acquire(1, priority);
        if let Some(m) = &self.env.metrics {
            m.record_admission_wait(waited.elapsed());
        }

        let mut admission_retries = 0;
        loop {
            let Some(device) = self.admit_any(task)? else {
                if admission_retries >= self.config.retry.max_retries {
                    return Err(DevmuxError::exhausted(
                        task.key(),
                        format!("no device could admit after {} retries", admission_retries),
                    ));
                }
                let delay = self.config.retry.delay_for_attempt(admission_retries);
                tracing::debug!(op = %task.key(), retry = admission_retries, ?delay, "No capacity, backing off");
                std::thread::sleep(delay);
                admission_retries += 1;
                continue;
            };

            self.publish_streams();
            let outcome = task.run(TaskCallbacks::new())?.wait();
            self.publish_streams();
            match outcome {
                TaskOutcome::Completed => {
                    return Ok(DispatchReport {
                        device,
                        attempts: task.attempts(),
                        memory_failures: task.failed_times(),
                        admission_retries,
                    })
                }
                TaskOutcome::MemoryFailure { failures } => {
                    tracing::debug!(op = %task.key(), %device, failures, "Retrying after memory failure");
                }
                TaskOutcome::Failed(e) => return Err(e),
            }
        }
    }

    /// Prepare `task` on the first candidate that admits it.
    ///
    /// `Ok(None)` means at least one device was merely out of capacity.
    fn admit_any(&self, task: &mut OperationTask) -> DevmuxResult<Option<DeviceSpec>> {
        let candidates = self.candidate_devices(task)?;
        let mut last_unavailable = None;
        let mut exhausted = false;
        for device in &candidates {
            match task.prepare(device) {
                Ok(()) => return Ok(Some(*device)),
                Err(e) if e.is_retryable() => {
                    tracing::trace!(op = %task.key(), %device, "Device full, trying next");
                    exhausted = true;
                }
                Err(DevmuxError::DeviceUnavailable(name)) => {
                    last_unavailable = Some(name);
                }
                Err(e) => return Err(e),
            }
        }
        if exhausted {
            return Ok(None);
        }
        Err(DevmuxError::DeviceUnavailable(last_unavailable.unwrap_or_else(|| {
            format!("no device supports {}", task.key())
        })))
    }

    /// Forget everything cached for `graph`
    pub fn flush_graph(&self, graph: GraphId) -> DevmuxResult<()> {
        let evicted = self.env.estimator.evict_graph(graph)?;
        self.env.devices.flush_graph(graph)?;
        let kernels = self.env.devices.forget_kernels(graph)?;
        tracing::debug!(graph = graph.0, evicted, kernels, "Flushed graph caches");
        Ok(())
    }

    /// Block until `count` more tasks have finished
    pub fn wait_finished(&self, count: u64) {
        self.env.finished_ops.wait(count);
    }

    /// Like [`wait_finished`](Self::wait_finished), giving up after `timeout`.
    /// Returns `false` on timeout without consuming anything.
    pub fn wait_finished_timeout(&self, count: u64, timeout: Duration) -> bool {
        self.env.finished_ops.wait_timeout(count, timeout)
    }

    pub fn stats(&self) -> DevmuxResult<DispatcherStats> {
        Ok(DispatcherStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            finished_ops: self.env.finished_ops.count(),
            outstanding_tickets: self.env.monitor.outstanding_tickets()?,
            streams_in_use: self.env.devices.streams_in_use()?,
            outstanding: self.env.monitor.outstanding()?.to_labeled(),
            free_slots: self.slots.available(),
            waiting: (0..self.slots.levels())
                .map(|level| self.slots.pending_at(level))
                .collect(),
        })
    }

    fn publish_streams(&self) {
        if let Some(m) = &self.env.metrics {
            match self.env.devices.streams_in_use() {
                Ok(n) => m.set_streams_in_use(n),
                Err(e) => tracing::warn!(error = %e, "Could not read stream usage"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDeviceRegistry;
    use crate::resources::JobId;
    use crate::task::{Completion, ExecStatus, ExecutionContext, NodeId, NodeKey, OutputSpec};

    #[derive(Debug)]
    struct SizedOp {
        bytes: u64,
        types: Vec<DeviceType>,
    }

    impl Operation for SizedOp {
        fn key(&self) -> NodeKey {
            NodeKey::new(GraphId(1), NodeId(self.bytes as u32))
        }
        fn job(&self) -> JobId {
            JobId(1)
        }
        fn op_type(&self) -> &str {
            "Fill"
        }
        fn supported_device_types(&self) -> Vec<DeviceType> {
            self.types.clone()
        }
        fn output_specs(&self) -> Option<Vec<OutputSpec>> {
            Some(vec![OutputSpec::new(&[self.bytes], 1)])
        }
        fn execute(&self, _ctx: ExecutionContext, completion: Completion) {
            completion.complete(ExecStatus::Ok);
        }
    }

    fn dispatcher(gpu: u64, cpu: u64) -> Dispatcher {
        let config = ExecConfig::new()
            .with_device_memory(DeviceSpec::gpu(0), gpu)
            .with_device_memory(DeviceSpec::cpu(0), cpu)
            .with_retry(crate::config::RetryConfig::no_retry());
        Dispatcher::new(config, Arc::new(StaticDeviceRegistry::with_host_and_gpus(1))).unwrap()
    }

    #[test]
    fn test_candidates_prefer_gpu() {
        let d = dispatcher(10, 10);
        let task = d.create_task(Arc::new(SizedOp {
            bytes: 1,
            types: vec![DeviceType::Cpu, DeviceType::Gpu],
        }));
        assert_eq!(
            d.candidate_devices(&task).unwrap(),
            vec![DeviceSpec::gpu(0), DeviceSpec::cpu(0)]
        );
    }

    #[test]
    fn test_dispatch_falls_back_to_cpu() {
        let d = dispatcher(10, 100);
        let mut task = d.create_task(Arc::new(SizedOp {
            bytes: 50,
            types: vec![DeviceType::Cpu, DeviceType::Gpu],
        }));
        let report = d.dispatch(&mut task, 0).unwrap();
        assert_eq!(report.device, DeviceSpec::cpu(0));
        assert_eq!(report.attempts, 1);

        let stats = d.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.outstanding_tickets, 0);
        assert_eq!(stats.finished_ops, 1);
        assert_eq!(stats.free_slots, 64);
    }

    #[test]
    fn test_dispatch_exhausted_everywhere() {
        let d = dispatcher(10, 10);
        let mut task = d.create_task(Arc::new(SizedOp {
            bytes: 50,
            types: vec![DeviceType::Cpu, DeviceType::Gpu],
        }));
        let err = d.dispatch(&mut task, 0).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(d.monitor().outstanding_tickets().unwrap(), 0);
        assert_eq!(d.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_dispatch_with_no_supported_device() {
        let registry = Arc::new(StaticDeviceRegistry::with_host_and_gpus(0));
        let d = Dispatcher::new(ExecConfig::new(), registry).unwrap();
        let mut task = d.create_task(Arc::new(SizedOp {
            bytes: 1,
            types: vec![DeviceType::Gpu],
        }));
        let err = d.dispatch(&mut task, 0).unwrap_err();
        assert!(matches!(err, DevmuxError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_stats_serialize() {
        let d = dispatcher(10, 10);
        let json = serde_json::to_value(d.stats().unwrap()).unwrap();
        assert_eq!(json["dispatched"], 0);
        assert_eq!(json["free_slots"], 64);
        assert_eq!(json["waiting"], serde_json::json!([0, 0, 0, 0]));
    }
}
