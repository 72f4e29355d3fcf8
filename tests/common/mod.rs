//! Shared fixtures for integration tests
//!
//! [`FakeOp`] stands in for a real kernel: it records where it ran and
//! completes according to its [`Behavior`].

#![allow(dead_code)]

use devmux::device::StaticDeviceRegistry;
use devmux::task::{GraphId, NodeId, OutputSpec};
use devmux::{
    Completion, DeviceSpec, DeviceType, Dispatcher, ExecConfig, ExecStatus, ExecutionContext,
    JobId, NodeKey, Operation, RetryConfig,
};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use serial_test::serial;

static LOGGING: Lazy<()> = Lazy::new(devmux::logging::init_logging_default);

pub fn init_logging() {
    Lazy::force(&LOGGING);
}

#[derive(Debug)]
pub enum Behavior {
    Succeed,
    /// Complete from another thread after a short sleep
    SucceedLater(Duration),
    /// Report running out of memory this many times, then succeed
    ExhaustTimes(AtomicU32),
    Fail(String),
    /// Charge this many bytes through the device handle before finishing
    Allocate(u64),
    /// Never call `complete`
    DropCompletion,
}

/// What a [`FakeOp`] saw on one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub device: DeviceSpec,
    pub stream: Option<usize>,
    pub attempt: u32,
    pub allocated: Option<bool>,
}

#[derive(Debug)]
pub struct FakeOp {
    pub key: NodeKey,
    pub job: JobId,
    pub bytes: u64,
    pub types: Vec<DeviceType>,
    pub ref_input: bool,
    pub behavior: Behavior,
    pub runs: Mutex<Vec<Execution>>,
}

impl FakeOp {
    pub fn new(graph: u64, node: u32, bytes: u64) -> Self {
        FakeOp {
            key: NodeKey::new(GraphId(graph), NodeId(node)),
            job: JobId(graph),
            bytes,
            types: vec![DeviceType::Cpu, DeviceType::Gpu],
            ref_input: false,
            behavior: Behavior::Succeed,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, types: &[DeviceType]) -> Self {
        self.types = types.to_vec();
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn exhausting(self, times: u32) -> Self {
        self.with_behavior(Behavior::ExhaustTimes(AtomicU32::new(times)))
    }

    pub fn with_ref_input(mut self) -> Self {
        self.ref_input = true;
        self
    }

    pub fn runs(&self) -> Vec<Execution> {
        self.runs.lock().unwrap().clone()
    }
}

impl Operation for FakeOp {
    fn key(&self) -> NodeKey {
        self.key
    }

    fn job(&self) -> JobId {
        self.job
    }

    fn op_type(&self) -> &str {
        "Fake"
    }

    fn supported_device_types(&self) -> Vec<DeviceType> {
        self.types.clone()
    }

    fn has_ref_input(&self) -> bool {
        self.ref_input
    }

    fn output_specs(&self) -> Option<Vec<OutputSpec>> {
        Some(vec![OutputSpec::new(&[self.bytes], 1)])
    }

    fn execute(&self, ctx: ExecutionContext, completion: Completion) {
        let mut run = Execution {
            device: ctx.device().spec(),
            stream: ctx.device().stream(),
            attempt: ctx.attempt(),
            allocated: None,
        };
        let status = match &self.behavior {
            Behavior::Succeed => ExecStatus::Ok,
            Behavior::SucceedLater(delay) => {
                let delay = *delay;
                self.runs.lock().unwrap().push(run);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    completion.complete(ExecStatus::Ok);
                });
                return;
            }
            Behavior::ExhaustTimes(left) => {
                let remaining = left.load(Ordering::SeqCst);
                if remaining > 0 {
                    left.store(remaining - 1, Ordering::SeqCst);
                    ExecStatus::ResourceExhausted
                } else {
                    ExecStatus::Ok
                }
            }
            Behavior::Fail(msg) => ExecStatus::Failed(msg.clone()),
            Behavior::Allocate(bytes) => {
                let granted = ctx.device().allocate(*bytes);
                run.allocated = Some(granted);
                if granted {
                    ExecStatus::Ok
                } else {
                    ExecStatus::ResourceExhausted
                }
            }
            Behavior::DropCompletion => {
                self.runs.lock().unwrap().push(run);
                drop(completion);
                return;
            }
        };
        self.runs.lock().unwrap().push(run);
        completion.complete(status);
    }
}

/// Dispatcher over one CPU and `gpus` GPUs with the given memory limits and
/// no admission backoff
pub fn dispatcher(gpus: u32, gpu_memory: u64, cpu_memory: u64) -> Dispatcher {
    init_logging();
    let mut config = ExecConfig::new()
        .with_device_memory(DeviceSpec::cpu(0), cpu_memory)
        .with_retry(RetryConfig::no_retry());
    for id in 0..gpus {
        config = config.with_device_memory(DeviceSpec::gpu(id), gpu_memory);
    }
    dispatcher_with(config, gpus)
}

pub fn dispatcher_with(config: ExecConfig, gpus: u32) -> Dispatcher {
    init_logging();
    Dispatcher::new(config, Arc::new(StaticDeviceRegistry::with_host_and_gpus(gpus)))
        .expect("valid test config")
}
