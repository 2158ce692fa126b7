use batchd_core::CoreError;
use thiserror::Error;

/// Errors surfaced to callers of the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("snapshot decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("config error: {0}")]
    Config(#[from] CoreError),

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
