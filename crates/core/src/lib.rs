pub mod config;
pub mod error;
pub mod retry;
pub mod task;
pub mod worker;

pub use config::{ConfigFile, PruneConfig, SchedulerConfig, SchedulerOptions};
pub use error::*;
pub use retry::{FailureTracker, RetryPolicy, RetryPolicyOverride};
pub use task::{Task, TaskStatus};
pub use worker::Worker;
