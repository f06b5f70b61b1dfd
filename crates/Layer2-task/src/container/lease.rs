//! Container leases
//!
//! A container leased to a task is busy and the collector must not touch
//! it. Claiming a container for eviction and leasing it are mutually
//! exclusive under one lock, so a task can never acquire a container that
//! is halfway through being removed.

use super::ContainerId;
use crate::task::TaskId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Leases {
    leased: HashMap<ContainerId, TaskId>,
    evicting: HashSet<ContainerId>,
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    inner: Mutex<Leases>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `container` to `task`; false if it is leased or being evicted
    pub fn lease(&self, container: &ContainerId, task: TaskId) -> bool {
        let mut inner = self.inner.lock();
        if inner.evicting.contains(container) || inner.leased.contains_key(container) {
            return false;
        }
        inner.leased.insert(container.clone(), task);
        true
    }

    pub fn release(&self, container: &ContainerId) {
        self.inner.lock().leased.remove(container);
    }

    pub fn is_busy(&self, container: &ContainerId) -> bool {
        self.inner.lock().leased.contains_key(container)
    }

    pub fn holder(&self, container: &ContainerId) -> Option<TaskId> {
        self.inner.lock().leased.get(container).copied()
    }

    /// Reserve `container` for removal; false if a task holds it
    pub fn claim_for_eviction(&self, container: &ContainerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.leased.contains_key(container) {
            return false;
        }
        inner.evicting.insert(container.clone())
    }

    pub fn finish_eviction(&self, container: &ContainerId) {
        self.inner.lock().evicting.remove(container);
    }

    pub fn busy_count(&self) -> usize {
        self.inner.lock().leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_excludes_eviction() {
        let table = LeaseTable::new();
        let c = ContainerId::from("bst-1");
        let task = TaskId::new();

        assert!(table.lease(&c, task));
        assert!(!table.lease(&c, TaskId::new()));
        assert!(!table.claim_for_eviction(&c));
        assert_eq!(table.holder(&c), Some(task));

        table.release(&c);
        assert!(table.claim_for_eviction(&c));
        assert!(!table.lease(&c, task));
        assert!(!table.claim_for_eviction(&c));

        table.finish_eviction(&c);
        assert!(table.lease(&c, task));
        assert_eq!(table.busy_count(), 1);
    }
}
