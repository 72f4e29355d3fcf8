//! Device registry: resolves a [`DeviceSpec`] to a real device handle

use super::{DeviceCapabilities, DeviceSpec, DeviceType};
use crate::error::{DevmuxError, DevmuxResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A real compute device the host runtime owns
pub trait ComputeDevice: Send + Sync + fmt::Debug {
    fn spec(&self) -> DeviceSpec;

    /// Name used for kernel placement checks
    fn name(&self) -> String {
        self.spec().to_string()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.spec().device_type.capabilities()
    }
}

/// Lookup service over the devices available to this process
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, spec: &DeviceSpec) -> Option<Arc<dyn ComputeDevice>>;

    /// All devices, in no particular order
    fn devices(&self) -> Vec<DeviceSpec>;

    /// Devices of one type, sorted by ordinal
    fn devices_of_type(&self, device_type: DeviceType) -> Vec<DeviceSpec> {
        let mut specs: Vec<_> = self
            .devices()
            .into_iter()
            .filter(|spec| spec.device_type == device_type)
            .collect();
        specs.sort();
        specs
    }
}

/// A resolved device. Cached per task so a kernel never silently moves.
#[derive(Debug, Clone)]
pub struct DeviceItem {
    pub device: Arc<dyn ComputeDevice>,
}

impl DeviceItem {
    pub fn spec(&self) -> DeviceSpec {
        self.device.spec()
    }

    pub fn name(&self) -> String {
        self.device.name()
    }

    /// Resolve through a registry, turning a miss into `DeviceUnavailable`
    pub fn resolve(registry: &dyn DeviceRegistry, spec: &DeviceSpec) -> DevmuxResult<Self> {
        registry
            .lookup(spec)
            .map(|device| DeviceItem { device })
            .ok_or_else(|| DevmuxError::DeviceUnavailable(spec.to_string()))
    }
}

/// Plain device handle identified only by its spec
#[derive(Debug, Clone)]
pub struct SimDevice {
    spec: DeviceSpec,
}

impl SimDevice {
    pub fn new(spec: DeviceSpec) -> Self {
        SimDevice { spec }
    }
}

impl ComputeDevice for SimDevice {
    fn spec(&self) -> DeviceSpec {
        self.spec
    }
}

/// Registry over a fixed device set, built once at startup
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceRegistry {
    devices: BTreeMap<DeviceSpec, Arc<dyn ComputeDevice>>,
}

impl StaticDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One CPU plus `num_gpus` GPUs, all [`SimDevice`]s
    pub fn with_host_and_gpus(num_gpus: u32) -> Self {
        let mut registry = StaticDeviceRegistry::new();
        registry.register(Arc::new(SimDevice::new(DeviceSpec::cpu(0))));
        for id in 0..num_gpus {
            registry.register(Arc::new(SimDevice::new(DeviceSpec::gpu(id))));
        }
        registry
    }

    pub fn register(&mut self, device: Arc<dyn ComputeDevice>) {
        self.devices.insert(device.spec(), device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for StaticDeviceRegistry {
    fn lookup(&self, spec: &DeviceSpec) -> Option<Arc<dyn ComputeDevice>> {
        self.devices.get(spec).cloned()
    }

    fn devices(&self) -> Vec<DeviceSpec> {
        self.devices.keys().copied().collect()
    }
}
