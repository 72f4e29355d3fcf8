//! GPU execution stream pool
//!
//! Each GPU owns a fixed pool of stream slots. A slot is held by at most one
//! task at a time. The pool also remembers which stream a graph node last ran
//! on so a re-dispatched node lands on the same stream when it is free.
//!
//! Occupancy and the assignment cache are guarded by separate locks; no code
//! path holds both at once.

use crate::task::{GraphId, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type StreamId = usize;

/// Fixed-size pool of stream slots for one GPU
#[derive(Debug)]
pub struct StreamAllocator {
    used: Mutex<Vec<bool>>,
    assignments: Mutex<HashMap<GraphId, HashMap<NodeId, StreamId>>>,
}

impl StreamAllocator {
    pub fn new(capacity: usize) -> Self {
        StreamAllocator {
            used: Mutex::new(vec![false; capacity]),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.occupancy().len()
    }

    pub fn in_use(&self) -> usize {
        self.occupancy().iter().filter(|u| **u).count()
    }

    /// Take up to `num` free slots. May return fewer, possibly none.
    pub fn allocate(&self, num: usize) -> Vec<StreamId> {
        let mut used = self.occupancy();
        let mut granted = Vec::with_capacity(num);
        for (id, slot) in used.iter_mut().enumerate() {
            if granted.len() == num {
                break;
            }
            if !*slot {
                *slot = true;
                granted.push(id);
            }
        }
        if granted.len() < num {
            tracing::debug!(requested = num, granted = granted.len(), "Stream pool short");
        }
        granted
    }

    /// Return slots to the pool. Freeing a free or out-of-range slot is logged
    /// and ignored.
    pub fn free(&self, ids: &[StreamId]) {
        let mut used = self.occupancy();
        for &id in ids {
            match used.get_mut(id) {
                Some(slot) if *slot => *slot = false,
                _ => tracing::warn!(stream = id, "Freeing stream that is not allocated"),
            }
        }
    }

    /// Lease a stream for `(graph, node)`.
    ///
    /// The node's previous stream is reused when free. Otherwise any free slot
    /// is taken, and remembered if the node had no assignment yet. Returns
    /// `None` when the pool is exhausted.
    pub fn lease_for(self: &Arc<Self>, graph: GraphId, node: NodeId) -> Option<StreamLease> {
        let cached = self
            .cache()
            .get(&graph)
            .and_then(|nodes| nodes.get(&node))
            .copied();

        if let Some(id) = cached {
            if self.claim(id) {
                tracing::trace!(graph = graph.0, node = node.0, stream = id, "Reusing cached stream");
                return Some(StreamLease::new(Arc::clone(self), id));
            }
        }

        let id = self.allocate(1).pop()?;
        if cached.is_none() {
            self.cache().entry(graph).or_default().insert(node, id);
        }
        Some(StreamLease::new(Arc::clone(self), id))
    }

    /// Forget every node→stream assignment of `graph`
    pub fn flush_cache_for(&self, graph: GraphId) -> bool {
        self.cache().remove(&graph).is_some()
    }

    pub fn cached_stream(&self, graph: GraphId, node: NodeId) -> Option<StreamId> {
        self.cache()
            .get(&graph)
            .and_then(|nodes| nodes.get(&node))
            .copied()
    }

    fn claim(&self, id: StreamId) -> bool {
        match self.occupancy().get_mut(id) {
            Some(slot) if !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    fn occupancy(&self) -> MutexGuard<'_, Vec<bool>> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<GraphId, HashMap<NodeId, StreamId>>> {
        self.assignments.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one stream slot, returned on drop
#[derive(Debug)]
pub struct StreamLease {
    pool: Arc<StreamAllocator>,
    id: StreamId,
    released: bool,
}

impl StreamLease {
    fn new(pool: Arc<StreamAllocator>, id: StreamId) -> Self {
        StreamLease {
            pool,
            id,
            released: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.free(&[self.id]);
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.free(&[self.id]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_grant() {
        let pool = StreamAllocator::new(3);
        assert_eq!(pool.allocate(2), vec![0, 1]);
        assert_eq!(pool.allocate(5), vec![2]);
        assert!(pool.allocate(1).is_empty());
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_free_makes_slot_reusable() {
        let pool = StreamAllocator::new(2);
        let ids = pool.allocate(2);
        pool.free(&ids[..1]);
        assert_eq!(pool.allocate(1), vec![0]);
        // Double free and out-of-range are ignored
        pool.free(&[1]);
        pool.free(&[1]);
        pool.free(&[99]);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_lease_reuses_cached_stream() {
        let pool = Arc::new(StreamAllocator::new(4));
        let first = pool.lease_for(GraphId(1), NodeId(5)).unwrap();
        let other = pool.lease_for(GraphId(1), NodeId(6)).unwrap();
        let first_id = first.id();
        assert_ne!(first_id, other.id());
        drop(first);

        let again = pool.lease_for(GraphId(1), NodeId(5)).unwrap();
        assert_eq!(again.id(), first_id);
    }

    #[test]
    fn test_busy_cached_stream_falls_back_without_overwriting() {
        let pool = Arc::new(StreamAllocator::new(4));
        let held = pool.lease_for(GraphId(1), NodeId(5)).unwrap();
        let second = pool.lease_for(GraphId(1), NodeId(5)).unwrap();
        assert_ne!(held.id(), second.id());
        assert_eq!(pool.cached_stream(GraphId(1), NodeId(5)), Some(held.id()));
    }

    #[test]
    fn test_lease_exhausted_pool() {
        let pool = Arc::new(StreamAllocator::new(1));
        let _held = pool.lease_for(GraphId(1), NodeId(1)).unwrap();
        assert!(pool.lease_for(GraphId(1), NodeId(2)).is_none());
    }

    #[test]
    fn test_flush_cache_for_graph() {
        let pool = Arc::new(StreamAllocator::new(2));
        pool.lease_for(GraphId(1), NodeId(1)).unwrap().release();
        pool.lease_for(GraphId(2), NodeId(1)).unwrap().release();
        assert!(pool.flush_cache_for(GraphId(1)));
        assert!(!pool.flush_cache_for(GraphId(1)));
        assert_eq!(pool.cached_stream(GraphId(1), NodeId(1)), None);
        assert!(pool.cached_stream(GraphId(2), NodeId(1)).is_some());
        assert_eq!(pool.in_use(), 0);
    }
}
