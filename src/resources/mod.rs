//! Resource accounting: tagged resource amounts, the reservation monitor and
//! per-job usage baselines

pub mod monitor;
pub mod tracker;

pub use monitor::{ResourceContext, ResourceMonitor, Ticket};
pub use tracker::{JobId, JobUsage, ResourceTracker};

use crate::device::DeviceSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of resource being accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Bytes of device memory
    Memory,
    /// Abstract compute slots
    Compute,
}

/// A resource type on a particular device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceTag {
    pub resource_type: ResourceType,
    pub device: DeviceSpec,
}

impl ResourceTag {
    pub const fn memory(device: DeviceSpec) -> Self {
        ResourceTag {
            resource_type: ResourceType::Memory,
            device,
        }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.resource_type, self.device)
    }
}

/// Ordered map from resource tag to amount.
///
/// Ordered so two estimates built from the same inputs compare and print
/// identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMap(BTreeMap<ResourceTag, u64>);

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-entry map
    pub fn single(tag: ResourceTag, amount: u64) -> Self {
        let mut map = ResourceMap::new();
        map.add(tag, amount);
        map
    }

    pub fn get(&self, tag: &ResourceTag) -> u64 {
        self.0.get(tag).copied().unwrap_or(0)
    }

    pub fn set(&mut self, tag: ResourceTag, amount: u64) {
        self.0.insert(tag, amount);
    }

    pub fn add(&mut self, tag: ResourceTag, amount: u64) {
        let entry = self.0.entry(tag).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Subtract, flooring at zero and dropping emptied entries
    pub fn remove(&mut self, tag: &ResourceTag, amount: u64) {
        if let Some(entry) = self.0.get_mut(tag) {
            *entry = entry.saturating_sub(amount);
            if *entry == 0 {
                self.0.remove(tag);
            }
        }
    }

    /// Add every entry of `other` into `self`
    pub fn merge(&mut self, other: &ResourceMap) {
        for (tag, amount) in other.iter() {
            self.add(*tag, amount);
        }
    }

    /// Subtract every entry of `other` from `self`
    pub fn subtract(&mut self, other: &ResourceMap) {
        for (tag, amount) in other.iter() {
            self.remove(tag, amount);
        }
    }

    /// Copy with every amount divided by `2^shift`
    pub fn halved(&self, shift: u32) -> ResourceMap {
        ResourceMap(
            self.0
                .iter()
                .map(|(tag, amount)| (*tag, amount.checked_shr(shift).unwrap_or(0)))
                .collect(),
        )
    }

    /// Entries for one device only
    pub fn for_device(&self, device: &DeviceSpec) -> ResourceMap {
        ResourceMap(
            self.0
                .iter()
                .filter(|(tag, _)| tag.device == *device)
                .map(|(tag, amount)| (*tag, *amount))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceTag, u64)> {
        self.0.iter().map(|(tag, amount)| (tag, *amount))
    }

    pub fn total(&self) -> u64 {
        self.0.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// String-keyed view for JSON reports
    pub fn to_labeled(&self) -> BTreeMap<String, u64> {
        self.0
            .iter()
            .map(|(tag, amount)| (tag.to_string(), *amount))
            .collect()
    }
}

impl FromIterator<(ResourceTag, u64)> for ResourceMap {
    fn from_iter<I: IntoIterator<Item = (ResourceTag, u64)>>(iter: I) -> Self {
        let mut map = ResourceMap::new();
        for (tag, amount) in iter {
            map.add(tag, amount);
        }
        map
    }
}

impl fmt::Display for ResourceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (tag, amount)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", tag, amount)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu0() -> ResourceTag {
        ResourceTag::memory(DeviceSpec::gpu(0))
    }

    fn cpu0() -> ResourceTag {
        ResourceTag::memory(DeviceSpec::cpu(0))
    }

    #[test]
    fn test_merge_and_subtract() {
        let mut a = ResourceMap::single(gpu0(), 100);
        let b: ResourceMap = [(gpu0(), 50), (cpu0(), 10)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(&gpu0()), 150);
        assert_eq!(a.get(&cpu0()), 10);

        a.subtract(&b);
        assert_eq!(a.get(&gpu0()), 100);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_remove_floors_at_zero() {
        let mut a = ResourceMap::single(gpu0(), 5);
        a.remove(&gpu0(), 10);
        assert_eq!(a.get(&gpu0()), 0);
        assert!(a.is_empty());
    }

    #[test]
    fn test_halved() {
        let a: ResourceMap = [(gpu0(), 1000), (cpu0(), 7)].into_iter().collect();
        let h = a.halved(3);
        assert_eq!(h.get(&gpu0()), 125);
        assert_eq!(h.get(&cpu0()), 0);
        assert_eq!(a.halved(64).get(&gpu0()), 0);
    }

    #[test]
    fn test_for_device() {
        let a: ResourceMap = [(gpu0(), 1), (cpu0(), 2)].into_iter().collect();
        assert_eq!(a.for_device(&DeviceSpec::cpu(0)), ResourceMap::single(cpu0(), 2));
    }

    #[test]
    fn test_display_is_ordered() {
        let a: ResourceMap = [(gpu0(), 1), (cpu0(), 2)].into_iter().collect();
        assert_eq!(a.to_string(), "{Memory@CPU:0: 2, Memory@GPU:0: 1}");
    }
}
