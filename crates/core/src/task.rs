use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::{FailureTracker, RetryPolicy};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Disabled,
    /// Placeholder for a task that so far has only been named as a dependency.
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Disabled => "DISABLED",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: String,
    pub status: TaskStatus,
    /// Tasks that must reach DONE before this one is eligible.
    pub dependencies: BTreeSet<String>,
    /// Reverse index of `dependencies`, maintained by the state store and
    /// exposed for callers walking the graph downstream. Scheduling itself
    /// only reads `dependencies`.
    dependents: BTreeSet<String>,
    /// Resource name -> units required while running.
    pub resources: BTreeMap<String, u32>,
    /// Higher runs first.
    pub priority: i64,
    pub retry_policy: RetryPolicy,
    pub failures: FailureTracker,
    pub assigned_worker: Option<String>,
    /// When the task last moved to RUNNING.
    pub time_running: Option<DateTime<Utc>>,
    /// Workers that declared this task.
    pub stakeholders: BTreeSet<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, status: TaskStatus, retry_policy: RetryPolicy) -> Self {
        Self {
            id: id.into(),
            status,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            resources: BTreeMap::new(),
            priority: 0,
            failures: FailureTracker::new(retry_policy.failure_window),
            retry_policy,
            assigned_worker: None,
            time_running: None,
            stakeholders: BTreeSet::new(),
        }
    }

    /// A task created only because another task depends on it.
    pub fn placeholder(id: impl Into<String>, retry_policy: RetryPolicy) -> Self {
        Self::new(id, TaskStatus::Unknown, retry_policy)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_placeholder(&self) -> bool {
        self.status == TaskStatus::Unknown
    }

    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }

    pub fn add_dependent(&mut self, id: impl Into<String>) {
        self.dependents.insert(id.into());
    }

    pub fn remove_dependent(&mut self, id: &str) {
        self.dependents.remove(id);
    }

    pub fn disable_failures(&self) -> Option<u32> {
        self.retry_policy.disable_failures
    }

    pub fn disable_hard_timeout(&self) -> u64 {
        self.retry_policy.disable_hard_timeout
    }

    pub fn upstream_status_when_all(&self) -> bool {
        self.retry_policy.upstream_status_when_all
    }

    /// Replace the retry policy, rebinding the failure window.
    ///
    /// Recorded failures are kept.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.failures = FailureTracker::from_timestamps(
            retry_policy.failure_window,
            self.failures.timestamps().copied(),
        );
        self.retry_policy = retry_policy;
    }

    pub fn add_failure(&mut self) {
        self.add_failure_at(Utc::now());
    }

    pub fn add_failure_at(&mut self, now: DateTime<Utc>) {
        self.failures.add_failure(now);
    }

    pub fn has_excessive_failures(&self) -> bool {
        self.has_excessive_failures_at(Utc::now())
    }

    pub fn has_excessive_failures_at(&self, now: DateTime<Utc>) -> bool {
        self.failures
            .has_excessive_failures(self.retry_policy.disable_failures, now)
    }

    /// True when the task has been RUNNING for longer than its hard timeout.
    pub fn is_hard_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.time_running) {
            (TaskStatus::Running, Some(started)) => {
                now.signed_duration_since(started) > self.retry_policy.hard_timeout()
            }
            _ => false,
        }
    }

    /// Evaluate the upstream condition given a lookup of dependency statuses.
    ///
    /// Missing dependencies count as not DONE. A task with no dependencies is
    /// always satisfied.
    pub fn dependencies_satisfied<F>(&self, status_of: F) -> bool
    where
        F: Fn(&str) -> Option<TaskStatus>,
    {
        if self.dependencies.is_empty() {
            return true;
        }
        let mut done = self
            .dependencies
            .iter()
            .map(|dep| status_of(dep) == Some(TaskStatus::Done));
        if self.upstream_status_when_all() {
            done.all(|d| d)
        } else {
            done.any(|d| d)
        }
    }
}
