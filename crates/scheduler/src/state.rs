//! The task graph and worker registry.
//!
//! [`TaskState`] is plain data with no locking of its own. The
//! [`Scheduler`](crate::Scheduler) wraps it together with the
//! [`ResourcePool`] in a single mutex, so every method here runs with
//! exclusive access.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use batchd_core::{PruneConfig, RetryPolicy, Task, TaskStatus, Worker};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::resources::ResourcePool;
use crate::types::{AddTaskRequest, Assignment};

#[derive(Debug, Clone, Default)]
pub struct TaskState {
    pub(crate) tasks: BTreeMap<String, Task>,
    pub(crate) workers: BTreeMap<String, Worker>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch `id`, inserting the task built by `create` if it is missing.
    pub fn get_or_create<F>(&mut self, id: &str, create: F) -> &mut Task
    where
        F: FnOnce() -> Task,
    {
        self.tasks.entry(id.to_string()).or_insert_with(create)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn worker(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    /// Record activity for `worker`, registering it on first contact.
    pub fn touch_worker(&mut self, worker: &str, now: DateTime<Utc>) {
        self.workers
            .entry(worker.to_string())
            .or_insert_with(|| Worker::new(worker))
            .touch(now);
    }

    // ── Declaration ───────────────────────────────────────────

    /// Upsert a task declared by a worker.
    ///
    /// Missing dependencies become UNKNOWN placeholders. A task's retry
    /// policy is fixed when it is created, except that a placeholder adopts
    /// an explicit policy supplied later.
    pub fn add_task(
        &mut self,
        req: &AddTaskRequest,
        default_policy: RetryPolicy,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) {
        let task_id = req.task_id.as_str();
        self.touch_worker(&req.worker, now);

        let explicit = req.retry_policy.map(|o| default_policy.apply(&o));
        let task = self.get_or_create(task_id, || {
            Task::placeholder(task_id, explicit.unwrap_or(default_policy))
        });
        if let Some(policy) = explicit {
            if task.is_placeholder() && task.retry_policy != policy {
                task.set_retry_policy(policy);
            }
        }
        task.stakeholders.insert(req.worker.clone());
        if let Some(resources) = &req.resources {
            if task.status != TaskStatus::Running {
                task.resources = resources.clone();
            }
        }
        task.priority = task.priority.max(req.priority);

        if let Some(deps) = &req.deps {
            self.set_dependencies(task_id, deps.iter().cloned().collect(), default_policy);
        }
        self.apply_dep_policies(req, default_policy);
        self.propagate_priority(task_id);

        let status = req.status.unwrap_or(TaskStatus::Pending);
        match status {
            TaskStatus::Pending => self.mark_pending(task_id),
            TaskStatus::Running => self.mark_running(task_id, &req.worker, pool, now),
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Disabled => {
                // The task was inserted above, so the report cannot miss.
                let _ = self.report(task_id, status, pool, now);
            }
            TaskStatus::Unknown => {}
        }

        debug!(task_id = %task_id, worker = %req.worker, status = %status, "task declared");
    }

    /// Replace the dependency list of `task_id`, keeping the reverse index
    /// and creating placeholders for unseen dependencies.
    fn set_dependencies(&mut self, task_id: &str, deps: BTreeSet<String>, default_policy: RetryPolicy) {
        let old = match self.tasks.get_mut(task_id) {
            Some(task) => std::mem::replace(&mut task.dependencies, deps.clone()),
            None => return,
        };
        for dropped in old.difference(&deps) {
            if let Some(dep) = self.tasks.get_mut(dropped) {
                dep.remove_dependent(task_id);
            }
        }
        for dep in &deps {
            self.get_or_create(dep, || Task::placeholder(dep.as_str(), default_policy))
                .add_dependent(task_id);
        }
    }

    /// Bind per-dependency policies to dependencies that are still
    /// placeholders. Entries naming anything else are ignored.
    fn apply_dep_policies(&mut self, req: &AddTaskRequest, default_policy: RetryPolicy) {
        if req.deps_retry_policies.is_empty() {
            return;
        }
        let deps = match self.tasks.get(&req.task_id) {
            Some(task) => task.dependencies.clone(),
            None => return,
        };
        for (dep, overrides) in &req.deps_retry_policies {
            if !deps.contains(dep) {
                debug!(task_id = %req.task_id, dep = %dep, "ignoring policy for undeclared dependency");
                continue;
            }
            if let Some(task) = self.tasks.get_mut(dep) {
                let policy = default_policy.apply(overrides);
                if task.is_placeholder() && task.retry_policy != policy {
                    task.set_retry_policy(policy);
                }
            }
        }
    }

    /// Raise every transitive dependency of `root` to at least its priority.
    fn propagate_priority(&mut self, root: &str) {
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(id) = queue.pop_front() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            let priority = task.priority;
            let deps: Vec<String> = task.dependencies.iter().cloned().collect();
            for dep in deps {
                if let Some(dep_task) = self.tasks.get_mut(&dep) {
                    if dep_task.priority < priority {
                        dep_task.priority = priority;
                        queue.push_back(dep);
                    }
                }
            }
        }
    }

    /// A PENDING declaration never overrides RUNNING, FAILED or DISABLED.
    fn mark_pending(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            match task.status {
                TaskStatus::Unknown | TaskStatus::Pending | TaskStatus::Done => {
                    task.status = TaskStatus::Pending;
                }
                TaskStatus::Running | TaskStatus::Failed | TaskStatus::Disabled => {}
            }
        }
    }

    /// A RUNNING declaration never revives a DISABLED task.
    fn mark_running(&mut self, task_id: &str, worker: &str, pool: &mut ResourcePool, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Disabled {
                debug!(task_id = %task_id, worker = %worker, "ignoring RUNNING for disabled task");
                return;
            }
            if task.status != TaskStatus::Running {
                pool.reserve(&task.resources);
                task.time_running = Some(now);
            }
            task.status = TaskStatus::Running;
            task.assigned_worker = Some(worker.to_string());
        }
    }

    // ── Status reports ────────────────────────────────────────

    /// Apply a status reported by a worker and return the resulting status.
    ///
    /// Leaving RUNNING releases the task's resources. A FAILED report records
    /// a failure and disables the task once the failure limit is exceeded.
    /// A DISABLED task only leaves DISABLED on a DONE report or through
    /// [`TaskState::re_enable`]; other reports leave it untouched.
    pub fn report(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;

        if task.status == TaskStatus::Disabled && status != TaskStatus::Done {
            debug!(task_id = %task_id, reported = %status, "ignoring report for disabled task");
            return Ok(TaskStatus::Disabled);
        }
        if task.status == TaskStatus::Running && status != TaskStatus::Running {
            pool.release(&task.resources);
            task.assigned_worker = None;
            task.time_running = None;
        }

        task.status = match status {
            TaskStatus::Failed => {
                task.add_failure_at(now);
                if task.has_excessive_failures_at(now) {
                    info!(
                        task_id = %task_id,
                        failures = task.failures.num_failures(now),
                        "task disabled after excessive failures"
                    );
                    TaskStatus::Disabled
                } else {
                    TaskStatus::Failed
                }
            }
            other => other,
        };
        Ok(task.status)
    }

    /// DISABLED -> PENDING with the failure history cleared.
    ///
    /// Returns `false` when the task was not disabled.
    pub fn re_enable(&mut self, task_id: &str) -> Result<bool> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Disabled {
            return Ok(false);
        }
        task.status = TaskStatus::Pending;
        task.failures.clear();
        info!(task_id = %task_id, "task re-enabled");
        Ok(true)
    }

    // ── Assignment ────────────────────────────────────────────

    /// Hand the best eligible task to `worker`.
    ///
    /// Candidates are PENDING tasks the worker declared, ordered by priority
    /// (highest first) and then id. The first whose upstream condition holds
    /// and whose resources fit is marked RUNNING.
    pub fn get_work(
        &mut self,
        worker: &str,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        self.touch_worker(worker, now);
        self.reclaim_timed_out(pool, now);

        let mut candidates: Vec<(&str, i64)> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.stakeholders.contains(worker))
            .map(|t| (t.id(), t.priority))
            .collect();
        // Stable sort keeps id order among equal priorities.
        candidates.sort_by_key(|&(_, priority)| Reverse(priority));

        let chosen = candidates
            .into_iter()
            .find(|(id, _)| {
                self.tasks.get(*id).is_some_and(|task| {
                    task.dependencies_satisfied(|dep| self.tasks.get(dep).map(|d| d.status))
                        && pool.can_reserve(&task.resources)
                })
            })
            .map(|(id, _)| id.to_string())?;

        let task = self.tasks.get_mut(&chosen)?;
        pool.reserve(&task.resources);
        task.status = TaskStatus::Running;
        task.assigned_worker = Some(worker.to_string());
        task.time_running = Some(now);

        debug!(task_id = %chosen, worker = %worker, priority = task.priority, "task assigned");
        Some(Assignment {
            task_id: chosen,
            priority: task.priority,
            resources: task.resources.clone(),
        })
    }

    /// PENDING tasks declared by `worker`.
    pub fn pending_count(&self, worker: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.stakeholders.contains(worker))
            .count()
    }

    // ── Maintenance ───────────────────────────────────────────

    /// Force-fail every task that has been RUNNING past its hard timeout.
    ///
    /// Each reclaimed task records a failure and goes back to PENDING, or to
    /// DISABLED when that failure trips the limit.
    pub fn reclaim_timed_out(&mut self, pool: &mut ResourcePool, now: DateTime<Utc>) -> Vec<String> {
        let mut reclaimed = Vec::new();
        for task in self.tasks.values_mut() {
            if !task.is_hard_timed_out(now) {
                continue;
            }
            warn!(
                task_id = %task.id(),
                worker = ?task.assigned_worker,
                timeout_secs = task.disable_hard_timeout(),
                "task exceeded hard timeout"
            );
            pool.release(&task.resources);
            task.assigned_worker = None;
            task.time_running = None;
            task.add_failure_at(now);
            task.status = if task.has_excessive_failures_at(now) {
                info!(task_id = %task.id(), "task disabled after hard timeout");
                TaskStatus::Disabled
            } else {
                TaskStatus::Pending
            };
            reclaimed.push(task.id().to_string());
        }
        reclaimed
    }

    /// Forget workers that have been silent too long and reclaim hard
    /// timeouts. Returns the ids of the pruned workers.
    ///
    /// Pruned workers stay listed as task stakeholders.
    pub fn prune<C: PruneConfig + ?Sized>(
        &mut self,
        config: &C,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        self.reclaim_timed_out(pool, now);

        let stale: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.should_prune(config, now))
            .map(|w| w.id().to_string())
            .collect();
        for id in &stale {
            self.workers.remove(id);
            info!(worker = %id, "pruned inactive worker");
        }
        stale
    }

    /// Move FAILED tasks back to PENDING once `retry_delay` seconds have
    /// passed since their last failure.
    pub fn retry_failed(&mut self, retry_delay: u64, now: DateTime<Utc>) -> Vec<String> {
        let delay = batchd_core::retry::seconds(retry_delay);
        let mut retried = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status != TaskStatus::Failed {
                continue;
            }
            let due = task
                .failures
                .last_failure()
                .map_or(true, |last| now.signed_duration_since(last) >= delay);
            if due {
                task.status = TaskStatus::Pending;
                debug!(task_id = %task.id(), "failed task eligible for retry");
                retried.push(task.id().to_string());
            }
        }
        retried
    }

    // ── Queries ───────────────────────────────────────────────

    /// Every task whose status is not DONE.
    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| t.status != TaskStatus::Done)
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Resource requirements of every RUNNING task.
    pub fn running_resources(&self) -> impl Iterator<Item = &BTreeMap<String, u32>> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| &t.resources)
    }

    /// Recompute every task's dependents from the dependency lists.
    pub(crate) fn rebuild_dependents(&mut self) {
        let edges: Vec<(String, String)> = self
            .tasks
            .values()
            .flat_map(|t| t.dependencies.iter().map(|d| (d.clone(), t.id().to_string())))
            .collect();
        for task in self.tasks.values_mut() {
            let ids: Vec<String> = task.dependents().iter().cloned().collect();
            for id in ids {
                task.remove_dependent(&id);
            }
        }
        for (dep, dependent) in edges {
            if let Some(task) = self.tasks.get_mut(&dep) {
                task.add_dependent(dependent);
            }
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.workers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.workers.is_empty()
    }
}
