use crate::core::models::RunId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("a refresh is already running")]
    AlreadyRunning,
    #[error("scheduler is disabled after {0} consecutive failures; re-enable it first")]
    Disabled(u32),
    #[error("scheduler is not disabled")]
    NotDisabled,
    #[error("unknown or already completed record: {0}")]
    UnknownRecord(RunId),
    #[error("record {0} is still pending")]
    DuplicateRun(RunId),
    #[error("stale attempt {attempt} (current generation {current})")]
    StaleAttempt { attempt: u64, current: u64 },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for SchedulerError {
    fn from(value: std::io::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failures reported by a data source's refresh call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("timeout")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
}
