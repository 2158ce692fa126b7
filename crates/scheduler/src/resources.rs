//! Shared resource budget.
//!
//! Capacities come from configuration. Units are reserved when a task is
//! assigned and released when it completes, fails or times out. Resources
//! without a configured capacity are unconstrained: they are tracked in
//! [`ResourcePool::in_use`] but never block an assignment.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePool {
    capacity: BTreeMap<String, u32>,
    in_use: BTreeMap<String, u32>,
}

impl ResourcePool {
    pub fn new(capacity: BTreeMap<String, u32>) -> Self {
        Self {
            capacity,
            in_use: BTreeMap::new(),
        }
    }

    /// Configured totals.
    pub fn capacity(&self) -> &BTreeMap<String, u32> {
        &self.capacity
    }

    /// Units currently reserved by running tasks.
    pub fn in_use(&self) -> &BTreeMap<String, u32> {
        &self.in_use
    }

    /// Remaining units of `name`, or `None` when the resource is unconstrained.
    pub fn available(&self, name: &str) -> Option<u32> {
        self.capacity.get(name).map(|total| {
            let used = self.in_use.get(name).copied().unwrap_or(0);
            total.saturating_sub(used)
        })
    }

    /// Whether every constrained requirement fits in what is left.
    pub fn can_reserve(&self, needs: &BTreeMap<String, u32>) -> bool {
        needs.iter().all(|(name, &units)| match self.available(name) {
            Some(left) => units <= left,
            None => true,
        })
    }

    /// Usage saturates at `u32::MAX`; unconstrained resources can be asked
    /// for more than that in total.
    pub fn reserve(&mut self, needs: &BTreeMap<String, u32>) {
        for (name, &units) in needs {
            let used = self.in_use.entry(name.clone()).or_default();
            *used = used.saturating_add(units);
        }
    }

    pub fn release(&mut self, needs: &BTreeMap<String, u32>) {
        for (name, &units) in needs {
            if let Some(used) = self.in_use.get_mut(name) {
                *used = used.saturating_sub(units);
                if *used == 0 {
                    self.in_use.remove(name);
                }
            }
        }
    }

    /// Recompute usage from the requirements of all running tasks.
    pub fn rebuild<'a>(&mut self, running: impl IntoIterator<Item = &'a BTreeMap<String, u32>>) {
        self.in_use.clear();
        for needs in running {
            self.reserve(needs);
        }
    }
}
