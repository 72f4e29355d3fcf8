//! Resource-usage estimates for operations
//!
//! The first estimate for an (operation, device) pair comes from a pluggable
//! [`ShapeEstimator`] and is cached. After an operation runs out of memory,
//! its estimate is replaced by the owning job's baseline temporary memory
//! scaled by `1 / 2^(min(failures, max_failures) + 1)` and charged to the
//! device being estimated, so each retry asks for half as much as the last.

use crate::device::DeviceSpec;
use crate::error::DevmuxResult;
use crate::resources::{ResourceMap, ResourceTag, ResourceTracker, ResourceType};
use crate::task::{GraphId, NodeKey, Operation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Structural estimate plus whether every input to it was known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralEstimate {
    pub usage: ResourceMap,
    pub complete: bool,
}

/// Computes an operation's resource need from its metadata
pub trait ShapeEstimator: Send + Sync {
    fn estimate(&self, op: &dyn Operation, device: &DeviceSpec) -> StructuralEstimate;
}

/// Sums output sizes. Host-memory outputs are charged to `CPU:0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputSizeEstimator;

impl ShapeEstimator for OutputSizeEstimator {
    fn estimate(&self, op: &dyn Operation, device: &DeviceSpec) -> StructuralEstimate {
        let Some(outputs) = op.output_specs() else {
            tracing::warn!(op = %op.key(), op_type = op.op_type(), "No output shape available");
            return StructuralEstimate::default();
        };

        let mut result = StructuralEstimate {
            usage: ResourceMap::new(),
            complete: true,
        };
        for (index, output) in outputs.iter().enumerate() {
            let Some(dims) = &output.dims else {
                tracing::warn!(op = %op.key(), output = index, "Output rank unknown, skipping");
                result.complete = false;
                continue;
            };
            let mut elements: u64 = 1;
            for dim in dims {
                match dim {
                    Some(d) => elements = elements.saturating_mul(*d),
                    None => {
                        tracing::warn!(op = %op.key(), output = index, "Unknown dimension treated as 1");
                        result.complete = false;
                    }
                }
            }
            let target = if output.host_memory {
                DeviceSpec::cpu(0)
            } else {
                *device
            };
            result.usage.add(
                ResourceTag::memory(target),
                elements.saturating_mul(output.dtype_size),
            );
        }
        result
    }
}

/// Right-shift applied to a baseline after `failures` memory failures
pub fn decay_shift(failures: u32, max_failures: u32) -> u32 {
    failures.min(max_failures) + 1
}

/// Per-(operation, device) estimate cache with failure decay
pub struct UsageEstimator {
    shapes: Arc<dyn ShapeEstimator>,
    tracker: Arc<ResourceTracker>,
    max_failures: u32,
    cache: Mutex<HashMap<(NodeKey, DeviceSpec), ResourceMap>>,
}

impl UsageEstimator {
    pub fn new(
        shapes: Arc<dyn ShapeEstimator>,
        tracker: Arc<ResourceTracker>,
        max_failures: u32,
    ) -> Self {
        UsageEstimator {
            shapes,
            tracker,
            max_failures,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// Estimated usage of `op` on `device` given its failure count so far
    pub fn estimate(
        &self,
        op: &dyn Operation,
        device: &DeviceSpec,
        failures: u32,
    ) -> DevmuxResult<ResourceMap> {
        let key = (op.key(), *device);

        if failures > 0 {
            if let Some(baseline) = self.tracker.baseline(op.job())? {
                if failures > self.max_failures {
                    tracing::warn!(
                        op = %op.key(),
                        failures,
                        max = self.max_failures,
                        "Failure count above bound, clamping decay"
                    );
                }
                let usage = ResourceMap::single(
                    ResourceTag::memory(*device),
                    baseline_memory(&baseline.temporary, device),
                )
                .halved(decay_shift(failures, self.max_failures));
                tracing::debug!(op = %op.key(), %device, failures, %usage, "Decayed estimate from job baseline");
                self.cache.lock()?.insert(key, usage.clone());
                return Ok(usage);
            }
            tracing::error!(op = %op.key(), job = %op.job(), "No baseline usage for job, keeping structural estimate");
        }

        if let Some(cached) = self.cache.lock()?.get(&key) {
            return Ok(cached.clone());
        }

        let structural = self.shapes.estimate(op, device);
        if !structural.complete {
            tracing::warn!(op = %op.key(), %device, usage = %structural.usage, "Partial usage estimate");
        }
        self.cache.lock()?.insert(key, structural.usage.clone());
        Ok(structural.usage)
    }

    /// Cached estimate without computing one
    pub fn last_usage(&self, key: NodeKey, device: &DeviceSpec) -> DevmuxResult<Option<ResourceMap>> {
        Ok(self.cache.lock()?.get(&(key, *device)).cloned())
    }

    /// Drop every cached estimate of `graph`'s operations
    pub fn evict_graph(&self, graph: GraphId) -> DevmuxResult<usize> {
        let mut cache = self.cache.lock()?;
        let before = cache.len();
        cache.retain(|(key, _), _| key.graph != graph);
        Ok(before - cache.len())
    }
}

/// Memory the job's baseline holds on `device`, or its memory on every
/// device when the baseline never touched this one
fn baseline_memory(temporary: &ResourceMap, device: &DeviceSpec) -> u64 {
    let memory = |map: &ResourceMap| {
        map.iter()
            .filter(|(tag, _)| tag.resource_type == ResourceType::Memory)
            .fold(0u64, |acc, (_, amount)| acc.saturating_add(amount))
    };
    match memory(&temporary.for_device(device)) {
        0 => memory(temporary),
        amount => amount,
    }
}

impl std::fmt::Debug for UsageEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageEstimator")
            .field("max_failures", &self.max_failures)
            .finish_non_exhaustive()
    }
}
