//! Error types for the scheduler.

use thiserror::Error;

use crate::ScheduleId;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed.
    #[error("invalid cron spec '{spec}': {reason}")]
    Parse { spec: String, reason: String },

    /// No scheduled function with this id.
    #[error("scheduled function not found: {0}")]
    NotFound(ScheduleId),

    /// An isolated unit of work panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// An isolated unit of work was aborted before it finished.
    #[error("task was aborted")]
    Aborted,
}
