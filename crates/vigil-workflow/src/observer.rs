//! Supervision of the jobs of one workflow type.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_scheduler::Registry;

use crate::{
    Alerter, JobAlert, JobChannels, JobError, JobExecutor, JobId, JobRecord, JobRepository,
    JobSnapshot, JobState, JobStatus, JobUpdate, WorkflowError, WorkflowType,
};

/// Capacity of the domain event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Domain events published while jobs run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: JobId,
        workflow_type: WorkflowType,
    },
    Progress {
        job_id: JobId,
        update: JobUpdate,
    },
    ItemFailed {
        job_id: JobId,
        error: JobError,
    },
    Finished {
        job_id: JobId,
        status: JobStatus,
    },
}

/// In-memory context of an active job.
struct JobContext {
    record: Mutex<JobRecord>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl JobContext {
    fn new(record: JobRecord, cancel: CancellationToken) -> Self {
        Self {
            record: Mutex::new(record),
            cancel,
            supervisor: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(&*self.record.lock())
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor.lock().take()
    }
}

/// Observer of one workflow type: launches, supervises, persists, and
/// recovers its jobs.
pub struct WorkflowObserver {
    workflow_type: WorkflowType,
    executor: Arc<dyn JobExecutor>,
    repository: Arc<dyn JobRepository>,
    alerter: Arc<dyn Alerter>,
    active: Arc<Registry<JobId, Arc<JobContext>>>,
    events: broadcast::Sender<JobEvent>,
}

impl WorkflowObserver {
    pub fn new(
        workflow_type: WorkflowType,
        executor: Arc<dyn JobExecutor>,
        repository: Arc<dyn JobRepository>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            workflow_type,
            executor,
            repository,
            alerter,
            active: Arc::new(Registry::new()),
            events,
        }
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.workflow_type
    }

    /// Subscribe to the events of this observer's jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Number of jobs with a live context.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start a new job from the beginning of the collection.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow_type))]
    pub async fn submit(&self) -> Result<JobId, WorkflowError> {
        let record = JobRecord::running(JobId::new(), self.workflow_type);
        self.repository.start_job(&record).await?;

        let job_id = self.launch(record).await?;
        info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    /// Relaunch every job still persisted as running from its checkpoint.
    /// Returns how many were relaunched.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow_type))]
    pub async fn recover(&self) -> Result<usize, WorkflowError> {
        let records = self.repository.list_active_jobs(self.workflow_type).await?;

        let mut recovered = 0;
        for record in records {
            let job_id = record.job_id;
            if self.active.contains(&job_id) {
                debug!(job_id = %job_id, "job already active, skipping");
                continue;
            }

            match self.launch(record).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to recover job"),
            }
        }

        info!(recovered, "recovered interrupted jobs");
        Ok(recovered)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus, WorkflowError> {
        Ok(self.get(job_id).await?.status)
    }

    pub async fn state(&self, job_id: JobId) -> Result<JobState, WorkflowError> {
        if let Some(ctx) = self.active.load(&job_id) {
            return Ok(ctx.record.lock().state());
        }
        Ok(self.stored(job_id).await?.state())
    }

    pub async fn get(&self, job_id: JobId) -> Result<JobSnapshot, WorkflowError> {
        if let Some(ctx) = self.active.load(&job_id) {
            return Ok(ctx.snapshot());
        }
        Ok(JobSnapshot::from(&self.stored(job_id).await?))
    }

    /// Cancel an active job and wait until its aborted state is persisted.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow_type))]
    pub async fn cancel(&self, job_id: JobId) -> Result<(), WorkflowError> {
        let ctx = self
            .active
            .delete(&job_id)
            .ok_or(WorkflowError::JobNotFound(job_id))?;
        ctx.cancel.cancel();

        if let Some(handle) = ctx.take_supervisor() {
            handle
                .await
                .map_err(|e| WorkflowError::Supervisor(e.to_string()))?;
        }

        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    /// Active jobs with the given status.
    pub fn list(&self, status: JobStatus) -> Vec<JobSnapshot> {
        let mut jobs = Vec::new();
        self.active.range(|_, ctx| {
            let snapshot = ctx.snapshot();
            if snapshot.status == status {
                jobs.push(snapshot);
            }
            true
        });
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Persisted jobs of this workflow type, newest first.
    pub async fn history(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, WorkflowError> {
        self.repository
            .list_records(Some(self.workflow_type), limit, offset)
            .await
    }

    /// Abort every active job, wait for their supervisors, then terminate the
    /// executor. Best effort; the first error is returned.
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow_type))]
    pub async fn shutdown(&self) -> Result<(), WorkflowError> {
        let contexts = self.active.values();
        for ctx in &contexts {
            ctx.cancel.cancel();
        }

        let mut first_error = None;
        for ctx in &contexts {
            let Some(handle) = ctx.take_supervisor() else {
                continue;
            };
            if let Err(e) = handle.await {
                error!(error = %e, "job supervisor failed during shutdown");
                first_error.get_or_insert(WorkflowError::Supervisor(e.to_string()));
            }
        }

        if let Err(e) = self.executor.terminate().await {
            first_error.get_or_insert(e);
        }

        info!(aborted = contexts.len(), "observer shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stored(&self, job_id: JobId) -> Result<JobRecord, WorkflowError> {
        self.repository
            .get_record(job_id)
            .await?
            .filter(|record| record.workflow_type == self.workflow_type)
            .ok_or(WorkflowError::JobNotFound(job_id))
    }

    /// Create the context of a job and start its execution and supervision.
    async fn launch(&self, record: JobRecord) -> Result<JobId, WorkflowError> {
        let job_id = record.job_id;
        let state = record.state();
        let cancel = CancellationToken::new();
        let ctx = Arc::new(JobContext::new(record, cancel.clone()));

        if !self.active.store_if_absent(job_id, Arc::clone(&ctx)) {
            return Err(WorkflowError::JobExists(job_id));
        }
        self.alert(JobAlert::Started, ctx.snapshot());
        let _ = self.events.send(JobEvent::Started {
            job_id,
            workflow_type: self.workflow_type,
        });

        let channels = match self.executor.execute(cancel, state) {
            Ok(channels) => channels,
            Err(e) => {
                self.fail(&ctx, &e).await;
                return Err(e);
            }
        };

        let supervisor = Supervisor {
            ctx: Arc::clone(&ctx),
            repository: Arc::clone(&self.repository),
            alerter: Arc::clone(&self.alerter),
            active: Arc::clone(&self.active),
            events: self.events.clone(),
        };
        let handle = tokio::spawn(supervisor.run(channels));
        *ctx.supervisor.lock() = Some(handle);

        Ok(job_id)
    }

    /// Record an executor refusal as a failed job.
    async fn fail(&self, ctx: &JobContext, e: &WorkflowError) {
        let message = e.to_string();
        let (job_id, snapshot) = {
            let mut record = ctx.record.lock();
            record.status = JobStatus::Failed;
            record.error = Some(message.clone());
            record.finished_at = Some(Utc::now());
            (record.job_id, JobSnapshot::from(&*record))
        };
        self.active.delete(&job_id);
        error!(job_id = %job_id, error = %message, "executor refused job");

        if let Err(persist) = self.repository.fail_job(job_id, &message).await {
            error!(job_id = %job_id, error = %persist, "failed to persist job failure");
        }
        self.alert(JobAlert::Failed { error: message }, snapshot);
        let _ = self.events.send(JobEvent::Finished {
            job_id,
            status: JobStatus::Failed,
        });
    }

    fn alert(&self, alert: JobAlert, job: JobSnapshot) {
        spawn_alert(Arc::clone(&self.alerter), alert, job);
    }
}

/// Deliver an alert without waiting for it.
fn spawn_alert(alerter: Arc<dyn Alerter>, alert: JobAlert, job: JobSnapshot) {
    tokio::spawn(async move {
        if let Err(e) = alerter.notify(&alert, &job).await {
            warn!(job_id = %job.job_id, alert = ?alert, error = %e, "alert delivery failed");
        }
    });
}

/// The task that consumes one job's executor channels.
struct Supervisor {
    ctx: Arc<JobContext>,
    repository: Arc<dyn JobRepository>,
    alerter: Arc<dyn Alerter>,
    active: Arc<Registry<JobId, Arc<JobContext>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Supervisor {
    async fn run(self, mut channels: JobChannels) {
        let (mut updates_open, mut errors_open) = (true, true);
        let mut cancelled = false;

        while updates_open || errors_open {
            tokio::select! {
                biased;

                _ = self.ctx.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }

                update = channels.updates.recv(), if updates_open => match update {
                    Some(update) => self.apply_update(update).await,
                    None => updates_open = false,
                },

                error = channels.errors.recv(), if errors_open => match error {
                    Some(error) => self.record_error(error),
                    None => errors_open = false,
                },
            }
        }

        let status = if cancelled {
            JobStatus::Aborted
        } else {
            JobStatus::Completed
        };
        self.finish(status).await;
    }

    async fn apply_update(&self, update: JobUpdate) {
        let (job_id, state, counters) = {
            let mut record = self.ctx.record.lock();
            record.checkpoint = update.new_checkpoint.clone();
            record.counters.completed += update.completed as u64;
            record.counters.skipped += update.failed as u64;
            (record.job_id, record.state(), record.counters)
        };

        // Progress continues in memory if persistence fails; the job replays
        // from the last stored checkpoint after a restart.
        if let Err(e) = self.repository.set_state(job_id, &state, &counters).await {
            error!(job_id = %job_id, error = %e, "failed to persist checkpoint");
        }

        debug!(
            job_id = %job_id,
            checkpoint = ?state.checkpoint.batch_id,
            completed = counters.completed,
            "checkpoint advanced"
        );
        let _ = self.events.send(JobEvent::Progress { job_id, update });
    }

    fn record_error(&self, error: JobError) {
        let job_id = {
            let mut record = self.ctx.record.lock();
            record.counters.failed += 1;
            record.job_id
        };

        warn!(job_id = %job_id, item = ?error.item, error = %error.error, "job item failed");
        let _ = self.events.send(JobEvent::ItemFailed { job_id, error });
    }

    async fn finish(&self, status: JobStatus) {
        let (job_id, state, counters, snapshot) = {
            let mut record = self.ctx.record.lock();
            record.status = status;
            record.finished_at = Some(Utc::now());
            (
                record.job_id,
                record.state(),
                record.counters,
                JobSnapshot::from(&*record),
            )
        };

        let persisted = match status {
            JobStatus::Aborted => self.repository.cancel_job(job_id, &state, &counters).await,
            _ => self.repository.complete_job(job_id, &state, &counters).await,
        };
        if let Err(e) = persisted {
            error!(job_id = %job_id, status = %status, error = %e, "failed to persist job outcome");
        }

        self.active.delete(&job_id);

        let alert = match status {
            JobStatus::Aborted => JobAlert::Cancelled,
            _ => JobAlert::Completed,
        };
        spawn_alert(Arc::clone(&self.alerter), alert, snapshot);

        info!(
            job_id = %job_id,
            status = %status,
            completed = counters.completed,
            failed = counters.failed,
            skipped = counters.skipped,
            "job finished"
        );
        let _ = self.events.send(JobEvent::Finished { job_id, status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryJobRepository, RecordingAlerter, VecBatchSource};
    use crate::{
        BatchJobExecutor, ItemFailure, ItemId, ItemProcessor, JobCheckpoint, JobExecutorConfig,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Harness {
        observer: WorkflowObserver,
        repository: Arc<InMemoryJobRepository>,
        alerter: Arc<RecordingAlerter>,
        source: Arc<VecBatchSource>,
    }

    fn harness_with(
        items: &[&str],
        config: JobExecutorConfig,
        processor: Arc<dyn ItemProcessor>,
    ) -> Harness {
        let source = Arc::new(VecBatchSource::new(
            items.iter().map(|id| ItemId::new(*id)).collect(),
        ));
        let repository = Arc::new(InMemoryJobRepository::new());
        let alerter = Arc::new(RecordingAlerter::new());
        let executor = Arc::new(BatchJobExecutor::new(
            "page_refresh",
            config,
            source.clone(),
            processor,
        ));
        let observer = WorkflowObserver::new(
            WorkflowType::PageRefresh,
            executor,
            repository.clone(),
            alerter.clone(),
        );
        Harness {
            observer,
            repository,
            alerter,
            source,
        }
    }

    fn harness(items: &[&str], processor: Arc<dyn ItemProcessor>) -> Harness {
        harness_with(
            items,
            JobExecutorConfig::new(2, Duration::ZERO, Duration::from_secs(5)),
            processor,
        )
    }

    fn quick() -> Arc<dyn ItemProcessor> {
        Arc::new(|_item: ItemId| async {
            sleep(Duration::from_millis(10)).await;
            Ok::<(), ItemFailure>(())
        })
    }

    fn slow() -> Arc<dyn ItemProcessor> {
        Arc::new(|_item: ItemId| async {
            sleep(Duration::from_secs(3)).await;
            Ok::<(), ItemFailure>(())
        })
    }

    async fn wait_finished(events: &mut broadcast::Receiver<JobEvent>, job_id: JobId) -> JobStatus {
        loop {
            if let JobEvent::Finished { job_id: id, status } = events.recv().await.unwrap()
                && id == job_id
            {
                return status;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_to_completion() {
        let h = harness(&["a", "b", "c"], quick());
        let mut events = h.observer.subscribe();

        let job_id = h.observer.submit().await.unwrap();
        assert_eq!(wait_finished(&mut events, job_id).await, JobStatus::Completed);

        assert_eq!(h.observer.active_count(), 0);
        let record = h.repository.record(job_id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.checkpoint, JobCheckpoint::at(ItemId::new("c")));
        assert_eq!(record.counters.completed, 3);
        assert_eq!(record.counters.failed, 0);

        // Finished jobs are served from the repository.
        assert_eq!(h.observer.status(job_id).await.unwrap(), JobStatus::Completed);
        assert_eq!(h.observer.history(10, 0).await.unwrap().len(), 1);

        sleep(Duration::from_millis(10)).await;
        let alerts = h.alerter.alerts_for(job_id);
        assert!(alerts.contains(&JobAlert::Started));
        assert!(alerts.contains(&JobAlert::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_errors_are_counted_not_fatal() {
        let processor: Arc<dyn ItemProcessor> = Arc::new(|item: ItemId| async move {
            if item.as_str() == "b" {
                Err(ItemFailure::from("page unreachable"))
            } else {
                Ok(())
            }
        });
        let h = harness(&["a", "b", "c", "d"], processor);
        let mut events = h.observer.subscribe();

        let job_id = h.observer.submit().await.unwrap();
        let mut item_failures = 0;
        loop {
            match events.recv().await.unwrap() {
                JobEvent::ItemFailed { error, .. } => {
                    assert_eq!(error.item, Some(ItemId::new("b")));
                    item_failures += 1;
                }
                JobEvent::Finished { status, .. } => {
                    assert_eq!(status, JobStatus::Completed);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(item_failures, 1);
        let record = h.repository.record(job_id).unwrap();
        assert_eq!(record.counters.failed, 1);
        assert_eq!(record.checkpoint, JobCheckpoint::at(ItemId::new("d")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_and_removes() {
        let h = harness(&["a", "b", "c", "d"], slow());
        let job_id = h.observer.submit().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.observer.list(JobStatus::Running).len(), 1);
        h.observer.cancel(job_id).await.unwrap();

        assert_eq!(h.observer.active_count(), 0);
        assert_eq!(h.repository.record(job_id).unwrap().status, JobStatus::Aborted);
        assert_eq!(h.observer.status(job_id).await.unwrap(), JobStatus::Aborted);
        assert!(matches!(
            h.observer.cancel(job_id).await,
            Err(WorkflowError::JobNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_refusal_fails_job() {
        let h = harness_with(
            &["a"],
            JobExecutorConfig::new(2, Duration::ZERO, Duration::ZERO),
            quick(),
        );

        let result = h.observer.submit().await;
        assert!(matches!(result, Err(WorkflowError::InvalidConfig(_))));
        assert_eq!(h.observer.active_count(), 0);

        let history = h.observer.history(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("upper bound"));

        sleep(Duration::from_millis(10)).await;
        assert!(
            h.alerter
                .alerts_for(history[0].job_id)
                .iter()
                .any(|alert| matches!(alert, JobAlert::Failed { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_resumes_from_checkpoint() {
        let h = harness(&["a", "b", "c", "d"], quick());
        let mut record = JobRecord::running(JobId::new(), WorkflowType::PageRefresh);
        record.checkpoint = JobCheckpoint::at(ItemId::new("b"));
        record.counters.completed = 2;
        h.repository.insert(record.clone());
        h.repository
            .insert(JobRecord::running(JobId::new(), WorkflowType::ReportDispatch));
        let mut events = h.observer.subscribe();

        assert_eq!(h.observer.recover().await.unwrap(), 1);
        assert_eq!(h.observer.recover().await.unwrap(), 0);

        assert_eq!(
            wait_finished(&mut events, record.job_id).await,
            JobStatus::Completed
        );
        assert_eq!(h.source.requested_cursors(), vec![Some(ItemId::new("b"))]);

        let stored = h.repository.record(record.job_id).unwrap();
        assert_eq!(stored.counters.completed, 4);
        assert_eq!(stored.checkpoint, JobCheckpoint::at(ItemId::new("d")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_does_not_stop_progress() {
        let h = harness(&["a", "b", "c", "d"], quick());
        let mut events = h.observer.subscribe();

        let job_id = h.observer.submit().await.unwrap();
        h.repository.set_fail_writes(true);

        assert_eq!(wait_finished(&mut events, job_id).await, JobStatus::Completed);
        let stored = h.repository.record(job_id).unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.checkpoint, JobCheckpoint::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_failures_are_ignored() {
        let h = harness(&["a"], quick());
        h.alerter.set_fail(true);
        let mut events = h.observer.subscribe();

        let job_id = h.observer.submit().await.unwrap();
        assert_eq!(wait_finished(&mut events, job_id).await, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_active_jobs() {
        let h = harness(&["a", "b", "c", "d"], slow());
        let first = h.observer.submit().await.unwrap();
        let second = h.observer.submit().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        h.observer.shutdown().await.unwrap();

        assert_eq!(h.observer.active_count(), 0);
        for job_id in [first, second] {
            assert_eq!(h.repository.record(job_id).unwrap().status, JobStatus::Aborted);
        }

        // The executor is terminated; new work is refused and recorded.
        assert!(matches!(
            h.observer.submit().await,
            Err(WorkflowError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let h = harness(&["a"], quick());
        let job_id = JobId::new();

        assert!(matches!(
            h.observer.status(job_id).await,
            Err(WorkflowError::JobNotFound(id)) if id == job_id
        ));
        assert!(h.observer.state(job_id).await.is_err());
    }
}
