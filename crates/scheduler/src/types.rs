use std::collections::{BTreeMap, HashMap};

use batchd_core::{RetryPolicyOverride, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// Arguments of an `add_task` call as received from the transport layer.
///
/// `deps` and `resources` are optional so that re-declaring a task without
/// them leaves the stored metadata untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddTaskRequest {
    pub worker: String,
    pub task_id: String,
    pub deps: Option<Vec<String>>,
    pub priority: i64,
    pub resources: Option<BTreeMap<String, u32>>,
    /// Status reported by the worker. `None` declares the task as PENDING.
    pub status: Option<TaskStatus>,
    /// Explicit policy for `task_id` itself.
    pub retry_policy: Option<RetryPolicyOverride>,
    /// Policies for dependencies, keyed by dependency id.
    pub deps_retry_policies: HashMap<String, RetryPolicyOverride>,
}

impl AddTaskRequest {
    pub fn new(worker: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn resource(mut self, name: impl Into<String>, units: u32) -> Self {
        self.resources
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), units);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retry_policy(mut self, policy: impl Into<RetryPolicyOverride>) -> Self {
        self.retry_policy = Some(policy.into());
        self
    }

    pub fn dep_retry_policy(
        mut self,
        dep: impl Into<String>,
        policy: impl Into<RetryPolicyOverride>,
    ) -> Self {
        self.deps_retry_policies.insert(dep.into(), policy.into());
        self
    }
}

/// A task handed to a worker by `get_work`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub priority: i64,
    pub resources: BTreeMap<String, u32>,
}

/// Reply to `get_work`. `task_id` is `None` when nothing is eligible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub task_id: Option<String>,
    pub priority: i64,
    pub resources: BTreeMap<String, u32>,
    /// PENDING tasks still declared by the calling worker.
    pub n_pending_tasks: usize,
}

impl WorkResponse {
    pub fn none(n_pending_tasks: usize) -> Self {
        Self {
            n_pending_tasks,
            ..Default::default()
        }
    }

    pub fn assigned(assignment: Assignment, n_pending_tasks: usize) -> Self {
        Self {
            task_id: Some(assignment.task_id),
            priority: assignment.priority,
            resources: assignment.resources,
            n_pending_tasks,
        }
    }

    pub fn has_work(&self) -> bool {
        self.task_id.is_some()
    }
}

/// Snapshot of every task that is not DONE, taken under the scheduler lock.
///
/// Iterating does not hold the lock. Clone it to iterate again.
#[derive(Debug, Clone)]
pub struct ActiveTasks {
    inner: std::vec::IntoIter<Task>,
}

impl ActiveTasks {
    pub(crate) fn new(tasks: Vec<Task>) -> Self {
        Self {
            inner: tasks.into_iter(),
        }
    }
}

impl Iterator for ActiveTasks {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ActiveTasks {}
