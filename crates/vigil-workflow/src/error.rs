//! Error types for the workflow engine.

use thiserror::Error;

use crate::{JobId, WorkflowType};

/// Errors that can occur in workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The service has not been initialized, or has shut down.
    #[error("workflow service is not live")]
    ServiceNotLive,

    /// No observer registered for the workflow type.
    #[error("executor not found for workflow type: {0}")]
    ExecutorNotFound(WorkflowType),

    /// Job is not known.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Job already has a live context.
    #[error("job already active: {0}")]
    JobExists(JobId),

    /// Executor configuration cannot run.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),

    /// Executor was terminated and accepts no more work.
    #[error("executor has been terminated")]
    Terminated,

    /// Persistence collaborator failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// Enumeration of the collection failed.
    #[error("enumeration failed: {0}")]
    Source(String),

    /// Alerting collaborator failed.
    #[error("alert delivery failed: {0}")]
    Alert(String),

    /// A job's supervising task died.
    #[error("supervisor task failed: {0}")]
    Supervisor(String),
}

/// Failure of a single item's action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ItemFailure(pub String);

impl From<&str> for ItemFailure {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemFailure {
    fn from(s: String) -> Self {
        Self(s)
    }
}
