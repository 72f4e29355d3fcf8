//! Reservation bookkeeping.
//!
//! The monitor is the only source of truth for free capacity. Admission takes
//! a [`Ticket`] for an estimated amount; allocations made while the operation
//! runs are charged against that ticket and may grow it from free capacity.

use super::{ResourceMap, ResourceTag};
use crate::device::DeviceSpec;
use crate::error::DevmuxResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Handle to one outstanding reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Reservation {
    /// Amount currently counted against capacity
    charged: ResourceMap,
    /// Amount the operation has actually allocated
    used: ResourceMap,
}

#[derive(Debug, Default)]
struct MonitorState {
    limits: ResourceMap,
    in_use: ResourceMap,
    reservations: HashMap<Ticket, Reservation>,
    next_ticket: u64,
}

impl MonitorState {
    fn fits(&self, request: &ResourceMap) -> bool {
        request.iter().all(|(tag, amount)| {
            amount == 0 || self.in_use.get(tag).saturating_add(amount) <= self.limits.get(tag)
        })
    }
}

/// Tracks capacity limits and outstanding reservations
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// Tags absent from `limits` have zero capacity
    pub fn new(limits: ResourceMap) -> Self {
        ResourceMonitor {
            state: Mutex::new(MonitorState {
                limits,
                ..Default::default()
            }),
        }
    }

    /// Atomically reserve `request`, or return `None` if any entry does not fit.
    /// Never blocks.
    pub fn reserve(&self, request: &ResourceMap) -> DevmuxResult<Option<Ticket>> {
        let mut state = self.state.lock()?;
        if !state.fits(request) {
            tracing::debug!(%request, "Reservation rejected");
            return Ok(None);
        }

        state.in_use.merge(request);
        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;
        state.reservations.insert(
            ticket,
            Reservation {
                charged: request.clone(),
                used: ResourceMap::new(),
            },
        );
        tracing::trace!(%ticket, %request, "Reserved");
        Ok(Some(ticket))
    }

    /// Return everything charged to `ticket`.
    ///
    /// Returns `false` for an unknown or already released ticket.
    pub fn release(&self, ticket: Ticket) -> DevmuxResult<bool> {
        let mut state = self.state.lock()?;
        match state.reservations.remove(&ticket) {
            Some(reservation) => {
                state.in_use.subtract(&reservation.charged);
                tracing::trace!(%ticket, charged = %reservation.charged, "Released");
                Ok(true)
            }
            None => {
                tracing::warn!(%ticket, "Release of unknown ticket");
                Ok(false)
            }
        }
    }

    /// Charge an allocation against `ticket`, growing the reservation from
    /// free capacity when the reserved amount is exceeded.
    ///
    /// Returns `false` when the device has no room left or the ticket is gone.
    pub fn allocate(&self, ticket: Ticket, tag: ResourceTag, amount: u64) -> DevmuxResult<bool> {
        let mut state = self.state.lock()?;
        let state = &mut *state;
        let Some(reservation) = state.reservations.get_mut(&ticket) else {
            tracing::warn!(%ticket, %tag, amount, "Allocation against unknown ticket");
            return Ok(false);
        };

        let wanted = reservation.used.get(&tag).saturating_add(amount);
        let charged = reservation.charged.get(&tag);
        if wanted > charged {
            let extra = wanted - charged;
            if state.in_use.get(&tag).saturating_add(extra) > state.limits.get(&tag) {
                tracing::debug!(%ticket, %tag, amount, extra, "Allocation exceeds device capacity");
                return Ok(false);
            }
            state.in_use.add(tag, extra);
            reservation.charged.add(tag, extra);
        }
        reservation.used.add(tag, amount);
        Ok(true)
    }

    /// Return an allocation to the ticket. The reservation itself keeps its
    /// charge until released.
    pub fn deallocate(&self, ticket: Ticket, tag: ResourceTag, amount: u64) -> DevmuxResult<()> {
        let mut state = self.state.lock()?;
        if let Some(reservation) = state.reservations.get_mut(&ticket) {
            reservation.used.remove(&tag, amount);
        }
        Ok(())
    }

    /// Total amount charged across outstanding tickets
    pub fn outstanding(&self) -> DevmuxResult<ResourceMap> {
        Ok(self.state.lock()?.in_use.clone())
    }

    pub fn outstanding_tickets(&self) -> DevmuxResult<usize> {
        Ok(self.state.lock()?.reservations.len())
    }

    /// Free capacity for one tag
    pub fn available(&self, tag: &ResourceTag) -> DevmuxResult<u64> {
        let state = self.state.lock()?;
        Ok(state.limits.get(tag).saturating_sub(state.in_use.get(tag)))
    }

    pub fn limits(&self) -> DevmuxResult<ResourceMap> {
        Ok(self.state.lock()?.limits.clone())
    }
}

/// A granted reservation bound to the device it was admitted on.
///
/// Released exactly once: explicitly through [`release`](Self::release) or
/// when dropped.
#[derive(Debug)]
pub struct ResourceContext {
    device: DeviceSpec,
    ticket: Ticket,
    monitor: Arc<ResourceMonitor>,
    released: bool,
}

impl ResourceContext {
    pub fn new(device: DeviceSpec, ticket: Ticket, monitor: Arc<ResourceMonitor>) -> Self {
        ResourceContext {
            device,
            ticket,
            monitor,
            released: false,
        }
    }

    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Charge `bytes` of this device's memory against the reservation
    pub fn allocate_memory(&self, bytes: u64) -> DevmuxResult<bool> {
        self.monitor
            .allocate(self.ticket, ResourceTag::memory(self.device), bytes)
    }

    pub fn deallocate_memory(&self, bytes: u64) -> DevmuxResult<()> {
        self.monitor
            .deallocate(self.ticket, ResourceTag::memory(self.device), bytes)
    }

    pub fn release(mut self) -> DevmuxResult<bool> {
        self.released = true;
        self.monitor.release(self.ticket)
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.monitor.release(self.ticket) {
                tracing::error!(ticket = %self.ticket, error = %e, "Failed to release reservation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu0() -> ResourceTag {
        ResourceTag::memory(DeviceSpec::gpu(0))
    }

    fn monitor(limit: u64) -> ResourceMonitor {
        ResourceMonitor::new(ResourceMap::single(gpu0(), limit))
    }

    #[test]
    fn test_reserve_within_limit() {
        let monitor = monitor(100);
        let ticket = monitor.reserve(&ResourceMap::single(gpu0(), 60)).unwrap();
        assert!(ticket.is_some());
        assert_eq!(monitor.available(&gpu0()).unwrap(), 40);
        assert!(monitor
            .reserve(&ResourceMap::single(gpu0(), 41))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unconfigured_tag_has_no_capacity() {
        let monitor = monitor(100);
        let cpu = ResourceTag::memory(DeviceSpec::cpu(0));
        assert!(monitor.reserve(&ResourceMap::single(cpu, 1)).unwrap().is_none());
        assert!(monitor.reserve(&ResourceMap::single(cpu, 0)).unwrap().is_some());
    }

    #[test]
    fn test_double_release_is_reported() {
        let monitor = monitor(100);
        let ticket = monitor
            .reserve(&ResourceMap::single(gpu0(), 10))
            .unwrap()
            .unwrap();
        assert!(monitor.release(ticket).unwrap());
        assert!(!monitor.release(ticket).unwrap());
        assert_eq!(monitor.outstanding().unwrap().get(&gpu0()), 0);
    }

    #[test]
    fn test_allocate_grows_reservation() {
        let monitor = monitor(100);
        let ticket = monitor
            .reserve(&ResourceMap::single(gpu0(), 10))
            .unwrap()
            .unwrap();

        assert!(monitor.allocate(ticket, gpu0(), 8).unwrap());
        assert_eq!(monitor.outstanding().unwrap().get(&gpu0()), 10);

        assert!(monitor.allocate(ticket, gpu0(), 12).unwrap());
        assert_eq!(monitor.outstanding().unwrap().get(&gpu0()), 20);

        assert!(!monitor.allocate(ticket, gpu0(), 81).unwrap());

        monitor.deallocate(ticket, gpu0(), 20).unwrap();
        assert!(monitor.allocate(ticket, gpu0(), 20).unwrap());
        assert_eq!(monitor.outstanding().unwrap().get(&gpu0()), 20);

        monitor.release(ticket).unwrap();
        assert_eq!(monitor.outstanding().unwrap().get(&gpu0()), 0);
    }

    #[test]
    fn test_resource_context_releases_on_drop() {
        let monitor = Arc::new(monitor(100));
        let ticket = monitor
            .reserve(&ResourceMap::single(gpu0(), 30))
            .unwrap()
            .unwrap();
        {
            let ctx = ResourceContext::new(DeviceSpec::gpu(0), ticket, Arc::clone(&monitor));
            assert!(ctx.allocate_memory(30).unwrap());
        }
        assert_eq!(monitor.outstanding_tickets().unwrap(), 0);
        assert_eq!(monitor.available(&gpu0()).unwrap(), 100);
    }

    #[test]
    fn test_resource_context_explicit_release_once() {
        let monitor = Arc::new(monitor(100));
        let ticket = monitor
            .reserve(&ResourceMap::single(gpu0(), 30))
            .unwrap()
            .unwrap();
        let ctx = ResourceContext::new(DeviceSpec::gpu(0), ticket, Arc::clone(&monitor));
        assert!(ctx.release().unwrap());
        assert_eq!(monitor.outstanding_tickets().unwrap(), 0);
    }
}
