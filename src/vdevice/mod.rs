//! Per-task virtual devices
//!
//! After admission, an operation is bound to a [`PerTaskDevice`]: the real
//! device, the reservation its allocations are charged to, and on GPUs a
//! private stream from the device's pool. Stateful kernels are pinned to the
//! device they were first created on.

use crate::device::{DeviceItem, DeviceRegistry, DeviceSpec};
use crate::error::{DevmuxError, DevmuxResult};
use crate::resources::{ResourceContext, ResourceMonitor, ResourceTag, Ticket};
use crate::stream::{StreamAllocator, StreamId, StreamLease};
use crate::task::{GraphId, NodeKey, Operation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Resolves devices, enforces kernel placement and hands out per-task devices
pub struct VirtualDeviceManager {
    registry: Arc<dyn DeviceRegistry>,
    max_streams: usize,
    streams: Mutex<HashMap<DeviceSpec, Arc<StreamAllocator>>>,
    /// Device name each stateful kernel was created on
    kernels: Mutex<HashMap<NodeKey, String>>,
}

impl VirtualDeviceManager {
    pub fn new(registry: Arc<dyn DeviceRegistry>, max_streams: usize) -> Self {
        VirtualDeviceManager {
            registry,
            max_streams,
            streams: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn lookup(&self, spec: &DeviceSpec) -> DevmuxResult<DeviceItem> {
        DeviceItem::resolve(self.registry.as_ref(), spec)
    }

    /// Fails if `key`'s kernel already lives on a device other than `item`
    pub fn check_placement(&self, key: NodeKey, item: &DeviceItem) -> DevmuxResult<()> {
        let kernels = self.kernels.lock()?;
        match kernels.get(&key) {
            Some(bound) if *bound != item.name() => Err(DevmuxError::KernelDeviceMismatch {
                node: key.to_string(),
                bound: bound.clone(),
                requested: item.name(),
            }),
            _ => Ok(()),
        }
    }

    /// Bind `op` to `item` under `resources`.
    ///
    /// On error `resources` is dropped, which releases the reservation.
    pub fn bind(
        &self,
        op: &dyn Operation,
        item: &DeviceItem,
        resources: ResourceContext,
    ) -> DevmuxResult<PerTaskDevice> {
        let spec = item.spec();
        if !op.supported_device_types().contains(&spec.device_type) {
            return Err(DevmuxError::UnsupportedDevice {
                node: op.key().to_string(),
                device_type: spec.device_type.to_string(),
            });
        }
        if resources.device() != spec {
            return Err(crate::internal_error!(
                "reservation for {} bound to {}",
                resources.device(),
                spec
            ));
        }
        self.check_placement(op.key(), item)?;

        let stream = match self.stream_pool(&spec)? {
            Some(pool) => {
                let lease = pool.lease_for(op.key().graph, op.key().node);
                if lease.is_none() {
                    tracing::debug!(op = %op.key(), device = %spec, "Stream pool exhausted, using default stream");
                }
                lease
            }
            None => None,
        };

        tracing::debug!(
            op = %op.key(),
            device = %spec,
            ticket = %resources.ticket(),
            stream = ?stream.as_ref().map(StreamLease::id),
            "Bound per-task device"
        );
        Ok(PerTaskDevice {
            item: item.clone(),
            resources,
            stream,
        })
    }

    /// Record that `key`'s kernel now exists on `device_name`
    pub fn record_kernel(&self, key: NodeKey, device_name: &str) -> DevmuxResult<()> {
        self.kernels
            .lock()?
            .entry(key)
            .or_insert_with(|| device_name.to_string());
        Ok(())
    }

    pub fn kernel_device(&self, key: NodeKey) -> DevmuxResult<Option<String>> {
        Ok(self.kernels.lock()?.get(&key).cloned())
    }

    /// Stream pool of a stream-capable device, created on first use
    pub fn stream_pool(&self, spec: &DeviceSpec) -> DevmuxResult<Option<Arc<StreamAllocator>>> {
        if !spec.device_type.capabilities().supports_streams {
            return Ok(None);
        }
        let mut streams = self.streams.lock()?;
        let pool = streams
            .entry(*spec)
            .or_insert_with(|| Arc::new(StreamAllocator::new(self.max_streams)));
        Ok(Some(Arc::clone(pool)))
    }

    pub fn streams_in_use(&self) -> DevmuxResult<usize> {
        Ok(self.streams.lock()?.values().map(|pool| pool.in_use()).sum())
    }

    /// Forget stream assignments of `graph`
    pub fn flush_graph(&self, graph: GraphId) -> DevmuxResult<()> {
        for pool in self.streams.lock()?.values() {
            pool.flush_cache_for(graph);
        }
        Ok(())
    }

    /// Forget kernel placements of `graph`'s nodes, returning how many were
    /// dropped
    pub fn forget_kernels(&self, graph: GraphId) -> DevmuxResult<usize> {
        let mut kernels = self.kernels.lock()?;
        let before = kernels.len();
        kernels.retain(|key, _| key.graph != graph);
        Ok(before - kernels.len())
    }
}

impl std::fmt::Debug for VirtualDeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDeviceManager")
            .field("max_streams", &self.max_streams)
            .finish_non_exhaustive()
    }
}

/// A device bound to one attempt of one operation
#[derive(Debug)]
pub struct PerTaskDevice {
    item: DeviceItem,
    resources: ResourceContext,
    stream: Option<StreamLease>,
}

impl PerTaskDevice {
    pub fn spec(&self) -> DeviceSpec {
        self.item.spec()
    }

    pub fn name(&self) -> String {
        self.item.name()
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.stream.as_ref().map(StreamLease::id)
    }

    pub fn ticket(&self) -> Ticket {
        self.resources.ticket()
    }

    /// View handed to the kernel
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            name: self.name(),
            spec: self.spec(),
            stream: self.stream(),
            ticket: self.resources.ticket(),
            monitor: Arc::clone(self.resources.monitor()),
        }
    }

    /// Return the stream, then the reservation
    pub fn release(self) -> DevmuxResult<()> {
        let PerTaskDevice {
            resources, stream, ..
        } = self;
        if let Some(lease) = stream {
            lease.release();
        }
        resources.release()?;
        Ok(())
    }
}

/// What a running kernel sees of its device.
///
/// Allocations are charged to the attempt's reservation; once the attempt has
/// finished they fail.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    name: String,
    spec: DeviceSpec,
    stream: Option<StreamId>,
    ticket: Ticket,
    monitor: Arc<ResourceMonitor>,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Returns `false` when the device can not satisfy the allocation
    pub fn allocate(&self, bytes: u64) -> bool {
        match self
            .monitor
            .allocate(self.ticket, ResourceTag::memory(self.spec), bytes)
        {
            Ok(granted) => granted,
            Err(e) => {
                tracing::error!(device = %self.spec, error = %e, "Allocation bookkeeping failed");
                false
            }
        }
    }

    pub fn deallocate(&self, bytes: u64) {
        if let Err(e) = self
            .monitor
            .deallocate(self.ticket, ResourceTag::memory(self.spec), bytes)
        {
            tracing::error!(device = %self.spec, error = %e, "Deallocation bookkeeping failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceType, StaticDeviceRegistry};
    use crate::resources::{JobId, ResourceMap};
    use crate::task::{Completion, ExecStatus, ExecutionContext, NodeId};

    #[derive(Debug)]
    struct GpuOnly;

    impl Operation for GpuOnly {
        fn key(&self) -> NodeKey {
            NodeKey::new(GraphId(1), NodeId(1))
        }
        fn job(&self) -> JobId {
            JobId(1)
        }
        fn op_type(&self) -> &str {
            "Conv2D"
        }
        fn supported_device_types(&self) -> Vec<DeviceType> {
            vec![DeviceType::Gpu]
        }
        fn execute(&self, _ctx: ExecutionContext, completion: Completion) {
            completion.complete(ExecStatus::Ok);
        }
    }

    fn setup() -> (VirtualDeviceManager, Arc<ResourceMonitor>) {
        let registry = Arc::new(StaticDeviceRegistry::with_host_and_gpus(2));
        let limits: ResourceMap = [
            (ResourceTag::memory(DeviceSpec::gpu(0)), 100),
            (ResourceTag::memory(DeviceSpec::gpu(1)), 100),
            (ResourceTag::memory(DeviceSpec::cpu(0)), 100),
        ]
        .into_iter()
        .collect();
        (
            VirtualDeviceManager::new(registry, 2),
            Arc::new(ResourceMonitor::new(limits)),
        )
    }

    fn admit(monitor: &Arc<ResourceMonitor>, spec: DeviceSpec, bytes: u64) -> ResourceContext {
        let ticket = monitor
            .reserve(&ResourceMap::single(ResourceTag::memory(spec), bytes))
            .unwrap()
            .unwrap();
        ResourceContext::new(spec, ticket, Arc::clone(monitor))
    }

    #[test]
    fn test_bind_gpu_gets_stream() {
        let (mgr, monitor) = setup();
        let item = mgr.lookup(&DeviceSpec::gpu(0)).unwrap();
        let dev = mgr
            .bind(&GpuOnly, &item, admit(&monitor, DeviceSpec::gpu(0), 10))
            .unwrap();
        assert_eq!(dev.stream(), Some(0));
        assert_eq!(mgr.streams_in_use().unwrap(), 1);

        dev.release().unwrap();
        assert_eq!(mgr.streams_in_use().unwrap(), 0);
        assert_eq!(monitor.outstanding_tickets().unwrap(), 0);
    }

    #[test]
    fn test_bind_unsupported_type_releases_ticket() {
        let (mgr, monitor) = setup();
        let item = mgr.lookup(&DeviceSpec::cpu(0)).unwrap();
        let err = mgr
            .bind(&GpuOnly, &item, admit(&monitor, DeviceSpec::cpu(0), 10))
            .unwrap_err();
        assert!(matches!(err, DevmuxError::UnsupportedDevice { .. }));
        assert_eq!(monitor.outstanding_tickets().unwrap(), 0);
    }

    #[test]
    fn test_kernel_pinned_to_first_device() {
        let (mgr, monitor) = setup();
        mgr.record_kernel(GpuOnly.key(), "GPU:0").unwrap();
        mgr.record_kernel(GpuOnly.key(), "GPU:1").unwrap();
        assert_eq!(mgr.kernel_device(GpuOnly.key()).unwrap().as_deref(), Some("GPU:0"));

        let item = mgr.lookup(&DeviceSpec::gpu(1)).unwrap();
        let err = mgr
            .bind(&GpuOnly, &item, admit(&monitor, DeviceSpec::gpu(1), 10))
            .unwrap_err();
        assert!(matches!(err, DevmuxError::KernelDeviceMismatch { .. }));
        assert_eq!(monitor.outstanding_tickets().unwrap(), 0);
        assert_eq!(mgr.streams_in_use().unwrap(), 0);

        mgr.flush_graph(GraphId(1)).unwrap();
        assert!(mgr.kernel_device(GpuOnly.key()).unwrap().is_some());
        assert_eq!(mgr.forget_kernels(GraphId(1)).unwrap(), 1);
        assert!(mgr.kernel_device(GpuOnly.key()).unwrap().is_none());
    }

    #[test]
    fn test_exhausted_stream_pool_uses_default_stream() {
        let (mgr, monitor) = setup();
        let item = mgr.lookup(&DeviceSpec::gpu(0)).unwrap();
        let pool = mgr.stream_pool(&DeviceSpec::gpu(0)).unwrap().unwrap();
        let held = pool.allocate(2);

        let dev = mgr
            .bind(&GpuOnly, &item, admit(&monitor, DeviceSpec::gpu(0), 10))
            .unwrap();
        assert_eq!(dev.stream(), None);
        pool.free(&held);
    }

    #[test]
    fn test_device_handle_charges_reservation() {
        let (mgr, monitor) = setup();
        let item = mgr.lookup(&DeviceSpec::gpu(0)).unwrap();
        let dev = mgr
            .bind(&GpuOnly, &item, admit(&monitor, DeviceSpec::gpu(0), 10))
            .unwrap();
        let handle = dev.handle();
        assert!(handle.allocate(50));
        assert!(!handle.allocate(60));
        handle.deallocate(50);

        dev.release().unwrap();
        assert!(!handle.allocate(1));
        assert_eq!(monitor.outstanding().unwrap().total(), 0);
    }

    #[test]
    fn test_cpu_has_no_stream_pool() {
        let (mgr, _) = setup();
        assert!(mgr.stream_pool(&DeviceSpec::cpu(0)).unwrap().is_none());
    }
}
