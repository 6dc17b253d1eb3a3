//! Job model types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::WorkflowError;

/// Category of recurring work, each with its own observer and executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Send generated reports to workspace subscribers.
    ReportDispatch,
    /// Refresh screenshots of every active page.
    PageRefresh,
    /// Generate a report for every active workspace.
    ReportGeneration,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 3] = [
        WorkflowType::ReportDispatch,
        WorkflowType::PageRefresh,
        WorkflowType::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::ReportDispatch => "report_dispatch",
            WorkflowType::PageRefresh => "page_refresh",
            WorkflowType::ReportGeneration => "report_generation",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowType::ALL
            .into_iter()
            .find(|wt| wt.as_str() == s.replace('-', "_"))
            .ok_or_else(|| format!("unknown workflow type '{s}'"))
    }
}

/// Identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier of an enumerated item (a page or a workspace).
///
/// Sources order items by this id; a cursor is the id of the last item of
/// the previous batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    /// Cancelled or interrupted by shutdown.
    Aborted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Resumption cursor of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Last item advanced past. `None` starts from the beginning.
    pub batch_id: Option<ItemId>,
}

impl JobCheckpoint {
    pub fn at(item: ItemId) -> Self {
        Self {
            batch_id: Some(item),
        }
    }
}

/// Persisted projection of a job used for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub checkpoint: JobCheckpoint,
}

/// Progress counters of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Items counted as completed by batch summaries.
    pub completed: u64,
    /// Item and enumeration errors reported by the executor.
    pub failed: u64,
    /// Items a batch summary counted as not completed.
    pub skipped: u64,
}

/// Progress of one processed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub time: DateTime<Utc>,
    pub completed: usize,
    pub failed: usize,
    pub new_checkpoint: JobCheckpoint,
}

/// A failure reported while a job runs. Never terminates the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Item whose action failed; `None` for enumeration failures.
    pub item: Option<ItemId>,
    pub error: String,
    pub time: DateTime<Utc>,
}

impl JobError {
    pub fn new(item: Option<ItemId>, error: impl Into<String>) -> Self {
        Self {
            item,
            error: error.into(),
            time: Utc::now(),
        }
    }
}

/// Batch executor tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecutorConfig {
    /// Items per batch, all processed concurrently.
    pub parallelism: usize,
    /// Minimum spacing between the starts of consecutive batches.
    pub lower_bound: Duration,
    /// Hard deadline for each batch.
    pub upper_bound: Duration,
}

impl JobExecutorConfig {
    pub fn new(parallelism: usize, lower_bound: Duration, upper_bound: Duration) -> Self {
        Self {
            parallelism,
            lower_bound,
            upper_bound,
        }
    }

    /// Check the configuration can run.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.upper_bound.is_zero() {
            return Err(WorkflowError::InvalidConfig(
                "upper bound must be greater than zero".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(WorkflowError::InvalidConfig(
                "parallelism must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable record of a job, kept by the repository after the job ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub workflow_type: WorkflowType,
    pub status: JobStatus,
    pub checkpoint: JobCheckpoint,
    pub counters: JobCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the job failed.
    pub error: Option<String>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn running(job_id: JobId, workflow_type: WorkflowType) -> Self {
        Self {
            job_id,
            workflow_type,
            status: JobStatus::Running,
            checkpoint: JobCheckpoint::default(),
            counters: JobCounters::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn state(&self) -> JobState {
        JobState {
            status: self.status,
            checkpoint: self.checkpoint.clone(),
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub workflow_type: WorkflowType,
    pub status: JobStatus,
    pub checkpoint: JobCheckpoint,
    pub counters: JobCounters,
    pub started_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobSnapshot {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            workflow_type: record.workflow_type,
            status: record.status,
            checkpoint: record.checkpoint.clone(),
            counters: record.counters,
            started_at: record.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_type_round_trips_names() {
        for wt in WorkflowType::ALL {
            assert_eq!(wt.as_str().parse::<WorkflowType>(), Ok(wt));
        }
        assert_eq!(
            "page-refresh".parse::<WorkflowType>(),
            Ok(WorkflowType::PageRefresh)
        );
        assert!("screenshots".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn test_workflow_type_serializes_snake_case() {
        let json = serde_json::to_string(&WorkflowType::ReportGeneration).unwrap();
        assert_eq!(json, "\"report_generation\"");
    }

    #[test]
    fn test_config_validation() {
        let ok = JobExecutorConfig::new(4, Duration::ZERO, Duration::from_secs(1));
        assert!(ok.validate().is_ok());

        let no_deadline = JobExecutorConfig::new(4, Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            no_deadline.validate(),
            Err(WorkflowError::InvalidConfig(_))
        ));

        let no_parallelism = JobExecutorConfig::new(0, Duration::ZERO, Duration::from_secs(1));
        assert!(no_parallelism.validate().is_err());
    }

    #[test]
    fn test_checkpoint_defaults_to_beginning() {
        let record = JobRecord::running(JobId::new(), WorkflowType::PageRefresh);
        assert_eq!(record.checkpoint.batch_id, None);
        assert_eq!(record.state().status, JobStatus::Running);
        assert_eq!(JobSnapshot::from(&record).counters, JobCounters::default());
    }

    #[test]
    fn test_item_ids_order_lexically() {
        let mut ids: Vec<ItemId> = vec!["c".into(), "a".into(), "b".into()];
        ids.sort();
        assert_eq!(ids, vec![ItemId::new("a"), ItemId::new("b"), ItemId::new("c")]);
    }
}
