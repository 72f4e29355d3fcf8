//! Device types, device specifications and the device capability table

pub mod registry;

pub use registry::{ComputeDevice, DeviceItem, DeviceRegistry, SimDevice, StaticDeviceRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of device kinds the scheduler knows how to place work on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// What a device kind can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Allocations go through a per-task allocator bound to a reservation
    pub has_allocator: bool,
    pub has_compute: bool,
    /// Per-task execution streams are drawn from a pool
    pub supports_streams: bool,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Gpu, DeviceType::Cpu];

    /// Parse a device type name.
    ///
    /// Unknown names are not an error: they log a warning and classify as CPU.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "CPU" => DeviceType::Cpu,
            "GPU" | "CUDA" | "HIP" | "ROCM" => DeviceType::Gpu,
            other => {
                tracing::warn!(device_type = other, "Unknown device type, treating as CPU");
                DeviceType::Cpu
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        match self {
            DeviceType::Cpu => DeviceCapabilities {
                has_allocator: true,
                has_compute: true,
                supports_streams: false,
            },
            DeviceType::Gpu => DeviceCapabilities {
                has_allocator: true,
                has_compute: true,
                supports_streams: true,
            },
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete device: type plus ordinal, rendered as `"GPU:0"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub id: u32,
}

impl DeviceSpec {
    pub const fn new(device_type: DeviceType, id: u32) -> Self {
        DeviceSpec { device_type, id }
    }

    pub const fn cpu(id: u32) -> Self {
        DeviceSpec::new(DeviceType::Cpu, id)
    }

    pub const fn gpu(id: u32) -> Self {
        DeviceSpec::new(DeviceType::Gpu, id)
    }

    /// Parse `"TYPE:ID"`. A missing or malformed id yields `None`; an unknown
    /// type name follows [`DeviceType::from_name`].
    pub fn parse(name: &str) -> Option<Self> {
        let (ty, id) = name.split_once(':')?;
        let id = id.trim().parse().ok()?;
        Some(DeviceSpec::new(DeviceType::from_name(ty.trim()), id))
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec_display_and_parse() {
        let spec = DeviceSpec::gpu(2);
        assert_eq!(spec.to_string(), "GPU:2");
        assert_eq!(DeviceSpec::parse("GPU:2"), Some(spec));
        assert_eq!(DeviceSpec::parse("cpu:0"), Some(DeviceSpec::cpu(0)));
        assert_eq!(DeviceSpec::parse("GPU"), None);
        assert_eq!(DeviceSpec::parse("GPU:x"), None);
    }

    #[test]
    fn test_unknown_device_type_defaults_to_cpu() {
        assert_eq!(DeviceType::from_name("TPU"), DeviceType::Cpu);
        assert_eq!(DeviceSpec::parse("TPU:1"), Some(DeviceSpec::cpu(1)));
    }

    #[test]
    fn test_capability_table() {
        assert!(DeviceType::Gpu.capabilities().supports_streams);
        assert!(!DeviceType::Cpu.capabilities().supports_streams);
        assert!(DeviceType::Cpu.capabilities().has_allocator);
    }

    #[test]
    fn test_gpu_preferred_over_cpu() {
        assert_eq!(DeviceType::ALL[0], DeviceType::Gpu);
    }
}
