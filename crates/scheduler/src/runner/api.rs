use std::collections::{BTreeMap, BTreeSet};

use batchd_core::Task;
use chrono::Utc;
use tracing::debug;

use crate::error::Result;
use crate::metrics::SchedulerStats;
use crate::types::{ActiveTasks, AddTaskRequest, WorkResponse};

use super::Scheduler;

impl Scheduler {
    /// Declare or update a task on behalf of a worker.
    pub fn add_task(&self, req: AddTaskRequest) -> Result<()> {
        let policy = self.default_retry_policy();
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.state.add_task(&req, policy, &mut inner.pool, Utc::now());
        Ok(())
    }

    /// Assign the best eligible task to `worker`, if any.
    pub fn get_work(&self, worker: &str) -> Result<WorkResponse> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let now = Utc::now();
        let reclaimed = inner.state.reclaim_timed_out(&mut inner.pool, now);
        inner.counters.tasks_reclaimed += reclaimed.len() as u64;
        let assignment = inner.state.get_work(worker, &mut inner.pool, now);
        let pending = inner.state.pending_count(worker);

        Ok(match assignment {
            Some(assignment) => {
                inner.counters.assignments += 1;
                WorkResponse::assigned(assignment, pending)
            }
            None => {
                debug!(worker = %worker, pending, "no eligible task");
                WorkResponse::none(pending)
            }
        })
    }

    /// Record that `worker` is alive.
    pub fn ping(&self, worker: &str) -> Result<()> {
        self.lock()?.state.touch_worker(worker, Utc::now());
        Ok(())
    }

    /// Every task that is not DONE, as an owned snapshot.
    pub fn get_active_tasks(&self) -> Result<ActiveTasks> {
        let tasks = self.lock()?.state.active_tasks().cloned().collect();
        Ok(ActiveTasks::new(tasks))
    }

    pub fn get_worker_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.state.worker_ids().map(str::to_string).collect())
    }

    pub fn task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.lock()?.state.task(id).cloned())
    }

    /// DISABLED -> PENDING. Returns `false` when the task was not disabled.
    pub fn re_enable_task(&self, id: &str) -> Result<bool> {
        self.lock()?.state.re_enable(id)
    }

    /// Units currently reserved per resource.
    pub fn resources_in_use(&self) -> Result<BTreeMap<String, u32>> {
        Ok(self.lock()?.pool.in_use().clone())
    }

    pub fn stats(&self) -> Result<SchedulerStats> {
        let inner = self.lock()?;
        Ok(SchedulerStats {
            tasks_by_status: inner.state.status_counts(),
            workers: inner.state.worker_ids().count(),
            assignments: inner.counters.assignments,
            workers_pruned: inner.counters.workers_pruned,
            tasks_reclaimed: inner.counters.tasks_reclaimed,
            last_prune: inner.counters.last_prune,
            resources_in_use: inner.pool.in_use().clone(),
            resource_capacity: inner.pool.capacity().clone(),
        })
    }
}
