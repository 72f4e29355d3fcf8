//! The operation descriptor the host runtime hands to the scheduler

use super::completion::{Completion, ExecutionContext};
use super::types::NodeKey;
use crate::device::DeviceType;
use crate::resources::JobId;
use std::fmt;

/// Metadata for one output tensor, used by structural estimators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// `None` when even the rank is unknown; `Some(None)` marks an unknown dim
    pub dims: Option<Vec<Option<u64>>>,
    /// Bytes per element
    pub dtype_size: u64,
    /// Output lives in host memory regardless of the executing device
    pub host_memory: bool,
}

impl OutputSpec {
    pub fn new(dims: &[u64], dtype_size: u64) -> Self {
        OutputSpec {
            dims: Some(dims.iter().map(|d| Some(*d)).collect()),
            dtype_size,
            host_memory: false,
        }
    }

    pub fn unknown_rank(dtype_size: u64) -> Self {
        OutputSpec {
            dims: None,
            dtype_size,
            host_memory: false,
        }
    }

    pub fn in_host_memory(mut self) -> Self {
        self.host_memory = true;
        self
    }
}

/// One unit of work pulled from a job's graph
///
/// Kernel semantics stay with the implementor: the scheduler only reads
/// metadata and calls [`execute`](Operation::execute) once per attempt.
pub trait Operation: Send + Sync + fmt::Debug {
    fn key(&self) -> NodeKey;

    fn job(&self) -> JobId;

    /// Kernel type name, for logs
    fn op_type(&self) -> &str;

    /// Device types this operation has kernels for
    fn supported_device_types(&self) -> Vec<DeviceType>;

    /// Inputs are references to mutable state; such an operation can not be
    /// re-executed after a partial run
    fn has_ref_input(&self) -> bool {
        false
    }

    fn output_specs(&self) -> Option<Vec<OutputSpec>> {
        None
    }

    /// Run the kernel. The implementation must eventually consume
    /// `completion`, either before returning or from another thread.
    fn execute(&self, ctx: ExecutionContext, completion: Completion);
}
