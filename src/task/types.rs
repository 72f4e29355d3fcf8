//! Identifiers and lifecycle types for operation tasks

use crate::error::DevmuxError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub u64);

/// Identifies a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Globally unique operation identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub graph: GraphId,
    pub node: NodeId,
}

impl NodeKey {
    pub const fn new(graph: GraphId, node: NodeId) -> Self {
        NodeKey { graph, node }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}/n{}", self.graph.0, self.node.0)
    }
}

/// Lifecycle of an [`OperationTask`](super::OperationTask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Created,
    Estimating,
    Admitting,
    Binding,
    /// Bound to a per-task device, waiting for `run`
    Prepared,
    Executing,
    Finishing,
    /// Last attempt hit exhaustion; the next `prepare` re-estimates
    Retrying,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// States from which `prepare` may start a new attempt
    pub fn can_prepare(&self) -> bool {
        matches!(
            self,
            TaskState::Created | TaskState::Estimating | TaskState::Retrying
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the operation reports when its kernel finishes
#[derive(Debug)]
pub enum ExecStatus {
    Ok,
    /// Kernel ran out of memory; eligible for retry
    ResourceExhausted,
    /// Any other failure; terminal
    Failed(String),
}

/// Outcome of one attempt, delivered after resources are released
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    /// The attempt hit exhaustion and the task may be prepared again
    MemoryFailure { failures: u32 },
    Failed(DevmuxError),
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}
