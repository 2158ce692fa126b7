//! Central scheduler for dependency-aware batch workflows.
//!
//! Workers declare tasks together with their dependencies and resource
//! needs, then poll [`Scheduler::get_work`] for something to run. The
//! scheduler hands out PENDING tasks whose upstream condition holds and whose
//! resources fit, tracks failures against each task's [`RetryPolicy`], prunes
//! silent workers and persists its state as a versioned snapshot.

pub mod error;
pub mod metrics;
pub mod resources;
pub mod runner;
pub mod snapshot;
pub mod state;
pub mod types;

pub use batchd_core::{
    ConfigFile, PruneConfig, RetryPolicy, RetryPolicyOverride, SchedulerConfig, SchedulerOptions,
    Task, TaskStatus, Worker,
};
pub use error::{Result, SchedulerError};
pub use metrics::SchedulerStats;
pub use resources::ResourcePool;
pub use runner::Scheduler;
pub use snapshot::{LoadOutcome, Snapshot, SNAPSHOT_FORMAT, SNAPSHOT_VERSION};
pub use state::TaskState;
pub use types::{ActiveTasks, AddTaskRequest, Assignment, WorkResponse};
