//! Versioned MessagePack snapshots of the task graph.
//!
//! A snapshot is written to a sibling temp file and renamed into place, so a
//! failed dump never clobbers the previous one. Loading never fails: anything
//! that cannot be read back resets the state to empty.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use batchd_core::{FailureTracker, RetryPolicy, Task, TaskStatus, Worker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::state::TaskState;

/// Tag identifying a batchd state file.
pub const SNAPSHOT_FORMAT: &str = "batchd.state";
/// Schema version written by this build.
pub const SNAPSHOT_VERSION: u16 = 1;

/// On-disk envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: String,
    pub version: u16,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub workers: BTreeMap<String, WorkerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub dependencies: BTreeSet<String>,
    pub resources: BTreeMap<String, u32>,
    pub priority: i64,
    pub disable_failures: Option<u32>,
    pub disable_hard_timeout: u64,
    pub failure_window: u64,
    pub upstream_status_when_all: bool,
    pub failures: Vec<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub time_running: Option<DateTime<Utc>>,
    pub stakeholders: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub first_seen: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Result of [`TaskState::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Restored { tasks: usize, workers: usize },
    /// No file at the path. State is empty.
    Missing,
    /// The file could not be decoded. State is empty.
    Corrupt(String),
}

impl LoadOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, LoadOutcome::Restored { .. })
    }
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            dependencies: task.dependencies.clone(),
            resources: task.resources.clone(),
            priority: task.priority,
            disable_failures: task.retry_policy.disable_failures,
            disable_hard_timeout: task.retry_policy.disable_hard_timeout,
            failure_window: task.retry_policy.failure_window,
            upstream_status_when_all: task.retry_policy.upstream_status_when_all,
            failures: task.failures.timestamps().copied().collect(),
            assigned_worker: task.assigned_worker.clone(),
            time_running: task.time_running,
            stakeholders: task.stakeholders.clone(),
        }
    }
}

impl TaskRecord {
    fn into_task(self, id: &str) -> Task {
        let policy = RetryPolicy {
            disable_failures: self.disable_failures,
            disable_hard_timeout: self.disable_hard_timeout,
            failure_window: self.failure_window,
            upstream_status_when_all: self.upstream_status_when_all,
        };
        let mut task = Task::new(id, self.status, policy);
        task.dependencies = self.dependencies;
        task.resources = self.resources;
        task.priority = self.priority;
        task.failures = FailureTracker::from_timestamps(self.failure_window, self.failures);
        task.assigned_worker = self.assigned_worker;
        task.time_running = self.time_running;
        task.stakeholders = self.stakeholders;
        task
    }
}

impl Snapshot {
    pub fn capture(state: &TaskState) -> Self {
        Self {
            format: SNAPSHOT_FORMAT.to_string(),
            version: SNAPSHOT_VERSION,
            tasks: state
                .tasks
                .iter()
                .map(|(id, task)| (id.clone(), TaskRecord::from(task)))
                .collect(),
            workers: state
                .workers
                .iter()
                .map(|(id, w)| {
                    let record = WorkerRecord {
                        first_seen: w.first_seen,
                        last_active: w.last_active,
                    };
                    (id.clone(), record)
                })
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode and validate the envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Snapshot = rmp_serde::from_slice(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(SchedulerError::Snapshot(format!(
                "unexpected format tag {:?}",
                snapshot.format
            )));
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SchedulerError::Snapshot(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn restore(self) -> TaskState {
        let mut state = TaskState::default();
        for (id, record) in self.tasks {
            let task = record.into_task(&id);
            state.tasks.insert(id, task);
        }
        for (id, record) in self.workers {
            let mut worker = Worker::new(id.as_str());
            worker.first_seen = record.first_seen;
            worker.last_active = record.last_active;
            state.workers.insert(id, worker);
        }
        state.rebuild_dependents();
        state
    }
}

impl TaskState {
    /// Write the state to `path`.
    ///
    /// On error the previous file at `path`, if any, is left as it was.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = Snapshot::capture(self).to_bytes()?;
        let tmp = temp_path(path);

        let written = write_synced(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(
            path = %path.display(),
            tasks = self.tasks.len(),
            workers = self.workers.len(),
            bytes = bytes.len(),
            "state snapshot written"
        );
        Ok(())
    }

    /// Replace the state with the snapshot at `path`.
    ///
    /// A missing or unreadable file leaves the state empty.
    pub fn load(&mut self, path: impl AsRef<Path>) -> LoadOutcome {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "no state snapshot found, starting empty");
                self.clear();
                return LoadOutcome::Missing;
            }
            Err(e) => return self.reset_corrupt(path, e.to_string()),
        };

        match Snapshot::from_bytes(&bytes) {
            Ok(snapshot) => {
                *self = snapshot.restore();
                let (tasks, workers) = (self.tasks.len(), self.workers.len());
                info!(path = %path.display(), tasks, workers, "state snapshot restored");
                LoadOutcome::Restored { tasks, workers }
            }
            Err(e) => self.reset_corrupt(path, e.to_string()),
        }
    }

    fn reset_corrupt(&mut self, path: &Path, reason: String) -> LoadOutcome {
        warn!(path = %path.display(), error = %reason, "state snapshot unreadable, starting empty");
        self.clear();
        LoadOutcome::Corrupt(reason)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
