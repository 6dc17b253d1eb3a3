//! In-memory collaborators for dry runs and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_scheduler::Registry;

use crate::{
    Alerter, BatchSource, BatchStream, ItemId, JobAlert, JobCounters, JobId, JobRecord,
    JobRepository, JobSnapshot, JobState, JobStatus, WorkflowError, WorkflowType,
};

/// Job repository backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: Registry<JobId, JobRecord>,
    fail_writes: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a record, e.g. one left running by a previous process.
    pub fn insert(&self, record: JobRecord) {
        self.records.store(record.job_id, record);
    }

    pub fn record(&self, job_id: JobId) -> Option<JobRecord> {
        self.records.load(&job_id)
    }

    fn check_writable(&self) -> Result<(), WorkflowError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WorkflowError::Repository("writes disabled".to_string()));
        }
        Ok(())
    }

    fn modify(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobRecord),
    ) -> Result<(), WorkflowError> {
        self.check_writable()?;
        self.records
            .update(&job_id, f)
            .ok_or(WorkflowError::JobNotFound(job_id))
    }

    fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError> {
        self.modify(job_id, |record| {
            record.status = status;
            record.checkpoint = state.checkpoint.clone();
            record.counters = *counters;
            record.finished_at = Some(Utc::now());
        })
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn start_job(&self, record: &JobRecord) -> Result<(), WorkflowError> {
        self.check_writable()?;
        if !self.records.store_if_absent(record.job_id, record.clone()) {
            return Err(WorkflowError::JobExists(record.job_id));
        }
        Ok(())
    }

    async fn set_state(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError> {
        self.modify(job_id, |record| {
            record.checkpoint = state.checkpoint.clone();
            record.counters = *counters;
        })
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError> {
        self.finish(job_id, JobStatus::Completed, state, counters)
    }

    async fn cancel_job(
        &self,
        job_id: JobId,
        state: &JobState,
        counters: &JobCounters,
    ) -> Result<(), WorkflowError> {
        self.finish(job_id, JobStatus::Aborted, state, counters)
    }

    async fn fail_job(&self, job_id: JobId, error: &str) -> Result<(), WorkflowError> {
        self.modify(job_id, |record| {
            record.status = JobStatus::Failed;
            record.error = Some(error.to_string());
            record.finished_at = Some(Utc::now());
        })
    }

    async fn get_record(&self, job_id: JobId) -> Result<Option<JobRecord>, WorkflowError> {
        Ok(self.records.load(&job_id))
    }

    async fn list_active_jobs(
        &self,
        workflow_type: WorkflowType,
    ) -> Result<Vec<JobRecord>, WorkflowError> {
        let mut active = Vec::new();
        self.records.range(|_, record| {
            if record.workflow_type == workflow_type && record.status == JobStatus::Running {
                active.push(record.clone());
            }
            true
        });
        active.sort_by_key(|record| record.started_at);
        Ok(active)
    }

    async fn list_records(
        &self,
        workflow_type: Option<WorkflowType>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, WorkflowError> {
        let mut records: Vec<JobRecord> = self
            .records
            .values()
            .into_iter()
            .filter(|record| workflow_type.is_none_or(|wt| record.workflow_type == wt))
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

/// Batch source over a fixed set of items.
#[derive(Debug, Default)]
pub struct VecBatchSource {
    items: Arc<Vec<ItemId>>,
    cursors: Mutex<Vec<Option<ItemId>>>,
}

impl VecBatchSource {
    pub fn new(mut items: Vec<ItemId>) -> Self {
        items.sort();
        items.dedup();
        Self {
            items: Arc::new(items),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Cursors passed to `list_batches`, in call order.
    pub fn requested_cursors(&self) -> Vec<Option<ItemId>> {
        self.cursors.lock().clone()
    }
}

impl BatchSource for VecBatchSource {
    fn list_batches(
        &self,
        cancel: CancellationToken,
        batch_size: usize,
        cursor: Option<ItemId>,
    ) -> BatchStream {
        self.cursors.lock().push(cursor.clone());

        let (batch_tx, batches) = mpsc::channel(1);
        let (_error_tx, errors) = mpsc::channel(1);
        let items = Arc::clone(&self.items);
        let batch_size = batch_size.max(1);

        tokio::spawn(async move {
            let start = match &cursor {
                Some(cursor) => items.partition_point(|item| item <= cursor),
                None => 0,
            };

            for batch in items[start..].chunks(batch_size) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = batch_tx.send(batch.to_vec()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        BatchStream { batches, errors }
    }
}

/// Alerter that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn notify(&self, alert: &JobAlert, job: &JobSnapshot) -> Result<(), WorkflowError> {
        match alert {
            JobAlert::Failed { error } => warn!(
                job_id = %job.job_id,
                workflow = %job.workflow_type,
                error = %error,
                "job failed"
            ),
            _ => info!(
                job_id = %job.job_id,
                workflow = %job.workflow_type,
                alert = ?alert,
                completed = job.counters.completed,
                failed = job.counters.failed,
                "job alert"
            ),
        }
        Ok(())
    }
}

/// Alerter that keeps every alert it receives.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<(JobAlert, JobSnapshot)>>,
    fail: AtomicBool,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries fail. Alerts are still recorded.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Alerts received for one job, in delivery order.
    pub fn alerts_for(&self, job_id: JobId) -> Vec<JobAlert> {
        self.alerts
            .lock()
            .iter()
            .filter(|(_, job)| job.job_id == job_id)
            .map(|(alert, _)| alert.clone())
            .collect()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn notify(&self, alert: &JobAlert, job: &JobSnapshot) -> Result<(), WorkflowError> {
        self.alerts.lock().push((alert.clone(), job.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkflowError::Alert("delivery refused".to_string()));
        }
        Ok(())
    }
}
