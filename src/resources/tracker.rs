//! Per-job baseline usage.
//!
//! A job's baseline is learned from earlier iterations: `persistent` memory
//! outlives a single operation (variables, caches), `temporary` memory is the
//! peak scratch usage of individual operations. The estimator falls back to
//! the baseline after an operation hits exhaustion.

use super::{ResourceMap, ResourceTag};
use crate::error::DevmuxResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Identifies the job (session) an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job{}", self.0)
    }
}

/// Baseline usage for one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUsage {
    pub persistent: ResourceMap,
    pub temporary: ResourceMap,
}

/// Shared handle over all known job baselines
#[derive(Debug, Default)]
pub struct ResourceTracker {
    jobs: RwLock<HashMap<JobId, JobUsage>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_baseline(&self, job: JobId, usage: JobUsage) -> DevmuxResult<()> {
        self.jobs.write()?.insert(job, usage);
        Ok(())
    }

    pub fn baseline(&self, job: JobId) -> DevmuxResult<Option<JobUsage>> {
        Ok(self.jobs.read()?.get(&job).cloned())
    }

    /// Raise the job's temporary peak for `tag` if `amount` exceeds it
    pub fn observe_temporary(&self, job: JobId, tag: ResourceTag, amount: u64) -> DevmuxResult<()> {
        let mut jobs = self.jobs.write()?;
        let usage = jobs.entry(job).or_default();
        if amount > usage.temporary.get(&tag) {
            usage.temporary.set(tag, amount);
        }
        Ok(())
    }

    pub fn add_persistent(&self, job: JobId, tag: ResourceTag, amount: u64) -> DevmuxResult<()> {
        self.jobs
            .write()?
            .entry(job)
            .or_default()
            .persistent
            .add(tag, amount);
        Ok(())
    }

    /// Drop a finished job's baseline
    pub fn forget(&self, job: JobId) -> DevmuxResult<bool> {
        Ok(self.jobs.write()?.remove(&job).is_some())
    }

    pub fn len(&self) -> DevmuxResult<usize> {
        Ok(self.jobs.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;

    fn gpu0() -> ResourceTag {
        ResourceTag::memory(DeviceSpec::gpu(0))
    }

    #[test]
    fn test_set_and_get_baseline() {
        let tracker = ResourceTracker::new();
        assert!(tracker.baseline(JobId(1)).unwrap().is_none());

        let usage = JobUsage {
            persistent: ResourceMap::single(gpu0(), 10),
            temporary: ResourceMap::single(gpu0(), 1000),
        };
        tracker.set_baseline(JobId(1), usage.clone()).unwrap();
        assert_eq!(tracker.baseline(JobId(1)).unwrap(), Some(usage));
    }

    #[test]
    fn test_observe_temporary_keeps_peak() {
        let tracker = ResourceTracker::new();
        tracker.observe_temporary(JobId(7), gpu0(), 300).unwrap();
        tracker.observe_temporary(JobId(7), gpu0(), 100).unwrap();
        tracker.observe_temporary(JobId(7), gpu0(), 500).unwrap();
        let usage = tracker.baseline(JobId(7)).unwrap().unwrap();
        assert_eq!(usage.temporary.get(&gpu0()), 500);
    }

    #[test]
    fn test_persistent_accumulates_and_forget() {
        let tracker = ResourceTracker::new();
        tracker.add_persistent(JobId(2), gpu0(), 64).unwrap();
        tracker.add_persistent(JobId(2), gpu0(), 64).unwrap();
        assert_eq!(
            tracker.baseline(JobId(2)).unwrap().unwrap().persistent.get(&gpu0()),
            128
        );
        assert!(tracker.forget(JobId(2)).unwrap());
        assert!(!tracker.forget(JobId(2)).unwrap());
        assert_eq!(tracker.len().unwrap(), 0);
    }
}
