//! devmux - admission-controlled operation scheduling
//!
//! Runs operations on CPU and GPU devices under per-device memory limits.
//! Every attempt reserves its estimated usage before it is bound to a device
//! and releases it when it finishes; attempts that run out of memory retry
//! with a smaller estimate until a failure budget runs out.

#![allow(clippy::type_complexity)] // Boxed callbacks
#![allow(clippy::new_without_default)]

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod estimator;
pub mod lane;
pub mod logging;
pub mod metrics;
pub mod resources;
pub mod stream;
pub mod sync;
pub mod task;
pub mod vdevice;

pub use config::{ExecConfig, RetryConfig};
pub use device::{DeviceRegistry, DeviceSpec, DeviceType, StaticDeviceRegistry};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherStats};
pub use error::{DevmuxError, DevmuxResult, ErrorCategory};
pub use estimator::{OutputSizeEstimator, ShapeEstimator, UsageEstimator};
pub use lane::{LaneHolder, LaneManager};
pub use metrics::Metrics;
pub use resources::{JobId, ResourceMap, ResourceMonitor, ResourceTag, ResourceTracker};
pub use sync::{PrioritySemaphore, Semaphore};
pub use task::{
    Completion, ExecStatus, ExecutionContext, NodeKey, Operation, OperationTask, TaskCallbacks,
    TaskOutcome, TaskState,
};
pub use vdevice::VirtualDeviceManager;
