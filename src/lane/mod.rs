//! GPU memory lanes
//!
//! A lane is a fixed slice of one GPU's memory that several jobs can share.
//! Each job holding a lane pins its persistent memory inside it; the rest of
//! the lane is scratch space its operations take turns using. Lanes are
//! created on demand and disappear when their last holder goes away.
//!
//! Placement is best fit: open a new lane when the GPU still has room,
//! otherwise share the tightest existing lane that is large enough and still
//! has room for the job's persistent memory. Requests that can not be placed
//! wait in FIFO order and are retried whenever a holder is dropped.
//!
//! The manager does not talk to a [`Dispatcher`](crate::Dispatcher) itself.
//! A caller that places a job in a lane hands the holder to
//! [`ExecConfig::with_lane`](crate::ExecConfig::with_lane) so the job's
//! dispatcher admits work only within the lane's scratch space.

use crate::device::DeviceSpec;
use crate::error::{DevmuxError, DevmuxResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type LaneCallback = Box<dyn FnOnce(LaneHolder) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneId(u64);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane{}", self.0)
    }
}

#[derive(Debug)]
struct Lane {
    id: LaneId,
    total: u64,
    available: u64,
    holders: usize,
    base_stream: usize,
}

#[derive(Debug)]
struct GpuControlBlock {
    spec: DeviceSpec,
    total: u64,
    available: u64,
    /// Sorted by available memory, smallest first
    lanes: Vec<Lane>,
    next_stream: usize,
}

impl GpuControlBlock {
    fn insert_sorted(&mut self, lane: Lane) {
        let at = self
            .lanes
            .iter()
            .position(|l| l.available > lane.available)
            .unwrap_or(self.lanes.len());
        self.lanes.insert(at, lane);
    }

    fn resort(&mut self) {
        self.lanes.sort_by_key(|l| l.available);
    }
}

struct Pending {
    memory: u64,
    persistent: u64,
    callback: LaneCallback,
}

struct LaneState {
    gpus: Vec<GpuControlBlock>,
    pending: VecDeque<Pending>,
    next_lane: u64,
}

struct Shared {
    state: Mutex<LaneState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Summary of one lane, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneInfo {
    pub id: LaneId,
    pub gpu: DeviceSpec,
    pub total: u64,
    pub available: u64,
    pub holders: usize,
    pub base_stream: usize,
}

/// Partitions GPU memory into lanes
#[derive(Clone)]
pub struct LaneManager {
    shared: Arc<Shared>,
}

impl LaneManager {
    /// `gpus` lists each GPU with its usable memory
    pub fn new(gpus: impl IntoIterator<Item = (DeviceSpec, u64)>) -> Self {
        let gpus = gpus
            .into_iter()
            .map(|(spec, total)| GpuControlBlock {
                spec,
                total,
                available: total,
                lanes: Vec::new(),
                next_stream: 0,
            })
            .collect();
        LaneManager {
            shared: Arc::new(Shared {
                state: Mutex::new(LaneState {
                    gpus,
                    pending: VecDeque::new(),
                    next_lane: 0,
                }),
            }),
        }
    }

    /// Place a job right now, or return `None`
    pub fn try_acquire(&self, memory: u64, persistent: u64) -> DevmuxResult<Option<LaneHolder>> {
        validate(memory, persistent)?;
        let mut state = self.shared.lock();
        Ok(best_fit(&mut state, memory, persistent).map(|placed| self.holder(placed, persistent)))
    }

    /// Place a job as soon as possible. `callback` runs on the thread that
    /// makes room, or on this thread if room is available now.
    ///
    /// Fails immediately if no GPU is large enough to ever satisfy `memory`.
    pub fn request(
        &self,
        memory: u64,
        persistent: u64,
        callback: impl FnOnce(LaneHolder) + Send + 'static,
    ) -> DevmuxResult<()> {
        validate(memory, persistent)?;
        {
            let mut state = self.shared.lock();
            if !state.gpus.iter().any(|g| g.total >= memory) {
                return Err(DevmuxError::exhausted(
                    "GPU",
                    format!("no GPU has {} bytes for a lane", memory),
                ));
            }
            state.pending.push_back(Pending {
                memory,
                persistent,
                callback: Box::new(callback),
            });
        }
        self.process_requests();
        Ok(())
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Memory not assigned to any lane on `gpu`
    pub fn unassigned_memory(&self, gpu: &DeviceSpec) -> Option<u64> {
        self.shared
            .lock()
            .gpus
            .iter()
            .find(|g| g.spec == *gpu)
            .map(|g| g.available)
    }

    pub fn lanes(&self) -> Vec<LaneInfo> {
        let state = self.shared.lock();
        state
            .gpus
            .iter()
            .flat_map(|g| {
                g.lanes.iter().map(|l| LaneInfo {
                    id: l.id,
                    gpu: g.spec,
                    total: l.total,
                    available: l.available,
                    holders: l.holders,
                    base_stream: l.base_stream,
                })
            })
            .collect()
    }

    /// Serve queued requests in order until the head can not be placed
    fn process_requests(&self) {
        let mut ready = Vec::new();
        {
            let mut state = self.shared.lock();
            while let Some(head) = state.pending.front() {
                let (memory, persistent) = (head.memory, head.persistent);
                let Some(placed) = best_fit(&mut state, memory, persistent) else {
                    tracing::debug!(memory, persistent, queued = state.pending.len(), "Lane request waits");
                    break;
                };
                if let Some(request) = state.pending.pop_front() {
                    ready.push((self.holder(placed, persistent), request.callback));
                }
            }
        }
        for (holder, callback) in ready {
            callback(holder);
        }
    }

    fn holder(&self, placed: Placement, persistent: u64) -> LaneHolder {
        LaneHolder {
            manager: self.clone(),
            gpu: placed.gpu,
            lane: placed.lane,
            total: placed.total,
            persistent,
            base_stream: placed.base_stream,
        }
    }

    fn release(&self, gpu: DeviceSpec, lane: LaneId, persistent: u64) {
        {
            let mut state = self.shared.lock();
            let Some(gcb) = state.gpus.iter_mut().find(|g| g.spec == gpu) else {
                return;
            };
            let Some(index) = gcb.lanes.iter().position(|l| l.id == lane) else {
                tracing::warn!(%lane, %gpu, "Releasing hold on unknown lane");
                return;
            };
            let entry = &mut gcb.lanes[index];
            entry.available += persistent;
            entry.holders -= 1;
            if entry.holders == 0 {
                let removed = gcb.lanes.remove(index);
                gcb.available += removed.total;
                tracing::debug!(%lane, %gpu, total = removed.total, "Lane removed");
            } else {
                gcb.resort();
            }
        }
        self.process_requests();
    }
}

impl fmt::Debug for LaneManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneManager")
            .field("lanes", &self.lanes())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

fn validate(memory: u64, persistent: u64) -> DevmuxResult<()> {
    if persistent > memory {
        return Err(crate::config_error!(
            "persistent memory {} exceeds lane request {}",
            persistent,
            memory
        ));
    }
    Ok(())
}

struct Placement {
    gpu: DeviceSpec,
    lane: LaneId,
    total: u64,
    base_stream: usize,
}

fn best_fit(state: &mut LaneState, memory: u64, persistent: u64) -> Option<Placement> {
    for gcb in state.gpus.iter_mut() {
        if gcb.available >= memory {
            gcb.available -= memory;
            let lane = Lane {
                id: LaneId(state.next_lane),
                total: memory,
                available: memory - persistent,
                holders: 1,
                base_stream: gcb.next_stream,
            };
            state.next_lane += 1;
            gcb.next_stream += 1;
            let placed = Placement {
                gpu: gcb.spec,
                lane: lane.id,
                total: lane.total,
                base_stream: lane.base_stream,
            };
            tracing::debug!(lane = %lane.id, gpu = %gcb.spec, memory, "Opened lane");
            gcb.insert_sorted(lane);
            return Some(placed);
        }
    }

    for gcb in state.gpus.iter_mut() {
        if let Some(lane) = gcb
            .lanes
            .iter_mut()
            .find(|l| l.total >= memory && l.available >= persistent)
        {
            lane.available -= persistent;
            lane.holders += 1;
            let placed = Placement {
                gpu: gcb.spec,
                lane: lane.id,
                total: lane.total,
                base_stream: lane.base_stream,
            };
            gcb.resort();
            return Some(placed);
        }
    }
    None
}

/// A job's hold on a lane; released on drop
pub struct LaneHolder {
    manager: LaneManager,
    gpu: DeviceSpec,
    lane: LaneId,
    total: u64,
    persistent: u64,
    base_stream: usize,
}

impl LaneHolder {
    pub fn gpu(&self) -> DeviceSpec {
        self.gpu
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    /// Size of the whole lane
    pub fn memory_limit(&self) -> u64 {
        self.total
    }

    pub fn persistent(&self) -> u64 {
        self.persistent
    }

    pub fn base_stream(&self) -> usize {
        self.base_stream
    }
}

impl fmt::Debug for LaneHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneHolder")
            .field("gpu", &self.gpu)
            .field("lane", &self.lane)
            .field("total", &self.total)
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl Drop for LaneHolder {
    fn drop(&mut self) {
        self.manager.release(self.gpu, self.lane, self.persistent);
    }
}
