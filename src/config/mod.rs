//! Executor configuration
//!
//! [`ExecConfig`] controls failure bounds, priority levels, stream pool size,
//! admission concurrency, per-device memory limits and admission backoff.
//! It can be built programmatically, read from a JSON file, or overridden
//! through `DEVMUX_*` environment variables.

pub mod retry;

pub use retry::RetryConfig;

use crate::config_error;
use crate::device::DeviceSpec;
use crate::error::DevmuxResult;
use crate::lane::LaneHolder;
use crate::resources::{ResourceMap, ResourceTag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const MAX_FAILURES_ENV: &str = "DEVMUX_MAX_FAILURES";
const MAX_PRIORITY_ENV: &str = "DEVMUX_MAX_PRIORITY";
const MAX_STREAMS_ENV: &str = "DEVMUX_MAX_STREAMS";
const MAX_CONCURRENT_OPS_ENV: &str = "DEVMUX_MAX_CONCURRENT_OPS";

/// Streams per GPU when nothing else is configured
pub const DEFAULT_MAX_STREAMS: usize = 128;

/// Configuration shared by every task a dispatcher creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Memory failures tolerated per operation before it fails for good
    pub max_failures: u32,

    /// Number of admission priority levels; 0 is the highest
    pub max_priority: usize,

    /// Priority used when the caller does not pick one
    pub default_priority: usize,

    /// Size of each GPU's stream pool
    pub max_streams_per_gpu: usize,

    /// Operations allowed between admission and finish at once
    pub max_concurrent_ops: u64,

    /// Memory limit per device, keyed `"GPU:0"`, `"CPU:0"`, ...
    pub device_memory: BTreeMap<String, u64>,

    pub retry: RetryConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            max_failures: 3,
            max_priority: 4,
            default_priority: 1,
            max_streams_per_gpu: DEFAULT_MAX_STREAMS,
            max_concurrent_ops: 64,
            device_memory: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl ExecConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `DEVMUX_*` variables that are set
    pub fn from_env() -> DevmuxResult<Self> {
        let mut config = ExecConfig::default();
        if let Some(v) = env_number(MAX_FAILURES_ENV)? {
            config.max_failures = v;
        }
        if let Some(v) = env_number(MAX_PRIORITY_ENV)? {
            config.max_priority = v;
        }
        if let Some(v) = env_number(MAX_STREAMS_ENV)? {
            config.max_streams_per_gpu = v;
        }
        if let Some(v) = env_number(MAX_CONCURRENT_OPS_ENV)? {
            config.max_concurrent_ops = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> DevmuxResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ExecConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_max_priority(mut self, max_priority: usize) -> Self {
        self.max_priority = max_priority;
        self
    }

    pub fn with_default_priority(mut self, priority: usize) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_max_streams_per_gpu(mut self, streams: usize) -> Self {
        self.max_streams_per_gpu = streams;
        self
    }

    pub fn with_max_concurrent_ops(mut self, ops: u64) -> Self {
        self.max_concurrent_ops = ops;
        self
    }

    /// Set the memory limit for one device
    pub fn with_device_memory(mut self, device: DeviceSpec, bytes: u64) -> Self {
        self.device_memory.insert(device.to_string(), bytes);
        self
    }

    /// Limit the lane's GPU to the scratch space left in `lane` after the
    /// holder's persistent memory
    pub fn with_lane(self, lane: &LaneHolder) -> Self {
        let scratch = lane.memory_limit().saturating_sub(lane.persistent());
        self.with_device_memory(lane.gpu(), scratch)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> DevmuxResult<()> {
        if self.max_priority == 0 {
            return Err(config_error!("max_priority must be at least 1"));
        }
        if self.default_priority >= self.max_priority {
            return Err(config_error!(
                "default_priority {} must be below max_priority {}",
                self.default_priority,
                self.max_priority
            ));
        }
        if self.max_concurrent_ops == 0 {
            return Err(config_error!("max_concurrent_ops must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            ));
        }
        self.memory_limits().map(|_| ())
    }

    /// Parsed `device_memory` as monitor limits
    pub fn memory_limits(&self) -> DevmuxResult<ResourceMap> {
        self.device_memory
            .iter()
            .map(|(name, bytes)| {
                DeviceSpec::parse(name)
                    .map(|spec| (ResourceTag::memory(spec), *bytes))
                    .ok_or_else(|| config_error!("invalid device name in device_memory: {}", name))
            })
            .collect()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> DevmuxResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| config_error!("{} is not a valid number: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
