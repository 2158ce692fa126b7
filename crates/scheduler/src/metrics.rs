use std::collections::{BTreeMap, HashMap};

use batchd_core::TaskStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running counters kept alongside the task state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub assignments: u64,
    pub workers_pruned: u64,
    pub tasks_reclaimed: u64,
    pub last_prune: Option<DateTime<Utc>>,
}

impl Counters {
    pub fn record_prune(&mut self, pruned: usize, reclaimed: usize, now: DateTime<Utc>) {
        self.workers_pruned += pruned as u64;
        self.tasks_reclaimed += reclaimed as u64;
        self.last_prune = Some(now);
    }
}

/// Point-in-time view of the scheduler for dashboards and health checks.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Number of tasks per status.
    pub tasks_by_status: HashMap<TaskStatus, usize>,
    /// Currently registered workers.
    pub workers: usize,
    /// Total assignments handed out since startup.
    pub assignments: u64,
    /// Total workers removed by pruning.
    pub workers_pruned: u64,
    /// Total RUNNING tasks force-failed by the hard timeout.
    pub tasks_reclaimed: u64,
    pub last_prune: Option<DateTime<Utc>>,
    /// Units reserved per resource.
    pub resources_in_use: BTreeMap<String, u32>,
    /// Configured capacity per resource.
    pub resource_capacity: BTreeMap<String, u32>,
}

impl SchedulerStats {
    pub fn total_tasks(&self) -> usize {
        self.tasks_by_status.values().sum()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks_by_status.get(&status).copied().unwrap_or(0)
    }

    /// Fraction of a resource's capacity in use, or `None` when unconstrained.
    pub fn utilization(&self, resource: &str) -> Option<f64> {
        let total = *self.resource_capacity.get(resource)?;
        if total == 0 {
            return Some(1.0);
        }
        let used = self.resources_in_use.get(resource).copied().unwrap_or(0);
        Some(used as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> SchedulerStats {
        SchedulerStats {
            tasks_by_status: HashMap::from([(TaskStatus::Pending, 3), (TaskStatus::Running, 1)]),
            workers: 2,
            assignments: 1,
            workers_pruned: 0,
            tasks_reclaimed: 0,
            last_prune: None,
            resources_in_use: BTreeMap::from([("gpu".to_string(), 1)]),
            resource_capacity: BTreeMap::from([("gpu".to_string(), 4), ("db".to_string(), 0)]),
        }
    }

    #[test]
    fn counts_by_status() {
        let s = stats();
        assert_eq!(s.total_tasks(), 4);
        assert_eq!(s.count(TaskStatus::Pending), 3);
        assert_eq!(s.count(TaskStatus::Done), 0);
    }

    #[test]
    fn utilization_per_resource() {
        let s = stats();
        assert_eq!(s.utilization("gpu"), Some(0.25));
        assert_eq!(s.utilization("db"), Some(1.0));
        assert_eq!(s.utilization("licenses"), None);
    }

    #[test]
    fn record_prune_accumulates() {
        let mut c = Counters::default();
        let now = Utc::now();
        c.record_prune(2, 1, now);
        c.record_prune(1, 0, now);
        assert_eq!(c.workers_pruned, 3);
        assert_eq!(c.tasks_reclaimed, 1);
        assert_eq!(c.last_prune, Some(now));
    }

    #[test]
    fn stats_serialize_status_keys() {
        let json = serde_json::to_value(stats()).unwrap();
        assert_eq!(json["tasks_by_status"]["PENDING"], 3);
        assert_eq!(json["workers"], 2);
    }
}
