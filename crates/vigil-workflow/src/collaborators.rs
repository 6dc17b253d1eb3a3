//! Contracts of the external collaborators the engine consumes.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ItemFailure, ItemId, JobCounters, JobId, JobRecord, JobSnapshot, JobState, WorkflowError,
    WorkflowType,
};

/// Stream of batches produced by a [`BatchSource`].
///
/// Both channels close when enumeration ends.
#[derive(Debug)]
pub struct BatchStream {
    pub batches: mpsc::Receiver<Vec<ItemId>>,
    pub errors: mpsc::Receiver<WorkflowError>,
}

/// Paging enumeration of the active items of a collection.
pub trait BatchSource: Send + Sync {
    /// Stream batches of at most `batch_size` items ordered by id, starting
    /// after `cursor` (`None` starts at the beginning). Enumeration stops
    /// when `cancel` fires.
    fn list_batches(
        &self,
        cancel: CancellationToken,
        batch_size: usize,
        cursor: Option<ItemId>,
    ) -> BatchStream;
}

/// The per-item action of a workflow.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: ItemId) -> Result<(), ItemFailure>;
}

#[async_trait]
impl<F, Fut> ItemProcessor for F
where
    F: Fn(ItemId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ItemFailure>> + Send + 'static,
{
    async fn process(&self, item: ItemId) -> Result<(), ItemFailure> {
        self(item).await
    }
}

/// Durable storage of job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a newly submitted job.
    async fn start_job(&self, record: &JobRecord) -> Result<(), WorkflowError>;

    /// Persist the checkpoint and counters of a running job.
    async fn set_state(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError>;

    /// Mark a job completed.
    async fn complete_job(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError>;

    /// Mark a job aborted.
    async fn cancel_job(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError>;

    /// Mark a job failed.
    async fn fail_job(&self, job_id: JobId, error: &str) -> Result<(), WorkflowError>;

    async fn get_record(&self, job_id: JobId) -> Result<Option<JobRecord>, WorkflowError>;

    /// Jobs of the given type still persisted as running.
    async fn list_active_jobs(
        &self,
        workflow_type: WorkflowType,
    ) -> Result<Vec<JobRecord>, WorkflowError>;

    /// Job records, newest first.
    async fn list_records(
        &self,
        workflow_type: Option<WorkflowType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, WorkflowError>;
}

/// Lifecycle notification about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobAlert {
    Started,
    Completed,
    Failed { error: String },
    Cancelled,
}

/// Alerting sink. Delivery is fire-and-forget; failures never affect jobs.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, alert: &JobAlert, job: &JobSnapshot) -> Result<(), WorkflowError>;
}
