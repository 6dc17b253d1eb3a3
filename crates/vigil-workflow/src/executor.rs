//! Generic batch job executor.
//!
//! Every workflow type runs the same algorithm: stream batches from a
//! [`BatchSource`], process the items of a batch concurrently under one
//! deadline, then emit a single [`JobUpdate`] whose checkpoint is the
//! highest-positioned item that completed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_scheduler::Registry;

use crate::{
    BatchSource, ItemId, ItemProcessor, JobCheckpoint, JobError, JobExecutorConfig, JobState,
    JobUpdate, WorkflowError,
};

/// Capacity of the update channel handed to the observer.
const UPDATE_CHANNEL_SIZE: usize = 16;

/// Channels of a running execution. Both close when the execution ends.
#[derive(Debug)]
pub struct JobChannels {
    pub updates: mpsc::Receiver<JobUpdate>,
    pub errors: mpsc::Receiver<JobError>,
}

/// The pluggable unit an observer drives.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Start executing from `state`'s checkpoint. Work stops when `cancel`
    /// fires.
    fn execute(
        &self,
        cancel: CancellationToken,
        state: JobState,
    ) -> Result<JobChannels, WorkflowError>;

    /// Cancel every in-flight execution and refuse new ones.
    async fn terminate(&self) -> Result<(), WorkflowError>;
}

/// Build the update for a processed batch from the highest completed
/// position.
///
/// Positions below the maximum count as completed even if their items
/// failed or were abandoned, so the checkpoint can pass over them. With no
/// completion the checkpoint stays where it was.
pub fn summarize_batch(
    batch: &[ItemId],
    max_position: Option<usize>,
    previous: &JobCheckpoint,
) -> JobUpdate {
    let reached = max_position.and_then(|position| batch.get(position).map(|item| (position, item)));

    match reached {
        Some((position, item)) => JobUpdate {
            time: Utc::now(),
            completed: position + 1,
            failed: batch.len() - (position + 1),
            new_checkpoint: JobCheckpoint::at(item.clone()),
        },
        None => JobUpdate {
            time: Utc::now(),
            completed: 0,
            failed: batch.len(),
            new_checkpoint: previous.clone(),
        },
    }
}

/// Batch executor parameterized by an enumeration source and an item action.
pub struct BatchJobExecutor {
    name: String,
    config: JobExecutorConfig,
    source: Arc<dyn BatchSource>,
    processor: Arc<dyn ItemProcessor>,
    inflight: Arc<Registry<u64, CancellationToken>>,
    next_execution: AtomicU64,
    terminated: AtomicBool,
}

impl BatchJobExecutor {
    pub fn new(
        name: impl Into<String>,
        config: JobExecutorConfig,
        source: Arc<dyn BatchSource>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            source,
            processor,
            inflight: Arc::new(Registry::new()),
            next_execution: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Number of executions still running.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }
}

#[async_trait]
impl JobExecutor for BatchJobExecutor {
    fn execute(
        &self,
        cancel: CancellationToken,
        state: JobState,
    ) -> Result<JobChannels, WorkflowError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(WorkflowError::Terminated);
        }
        self.config.validate()?;

        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let (error_tx, error_rx) = mpsc::channel(self.config.parallelism);

        let execution = self.next_execution.fetch_add(1, Ordering::SeqCst);
        self.inflight.store(execution, cancel.clone());

        let run = BatchRun {
            name: self.name.clone(),
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            processor: Arc::clone(&self.processor),
            cancel,
            update_tx,
            error_tx,
        };
        let inflight = Arc::clone(&self.inflight);

        tokio::spawn(async move {
            run.drive(state.checkpoint).await;
            inflight.delete(&execution);
        });

        Ok(JobChannels {
            updates: update_rx,
            errors: error_rx,
        })
    }

    async fn terminate(&self) -> Result<(), WorkflowError> {
        self.terminated.store(true, Ordering::SeqCst);

        let executions = self.inflight.keys();
        for execution in &executions {
            if let Some(cancel) = self.inflight.delete(execution) {
                cancel.cancel();
            }
        }

        info!(executor = %self.name, cancelled = executions.len(), "executor terminated");
        Ok(())
    }
}

/// One execution of the batch algorithm.
struct BatchRun {
    name: String,
    config: JobExecutorConfig,
    source: Arc<dyn BatchSource>,
    processor: Arc<dyn ItemProcessor>,
    cancel: CancellationToken,
    update_tx: mpsc::Sender<JobUpdate>,
    error_tx: mpsc::Sender<JobError>,
}

impl BatchRun {
    async fn drive(self, mut checkpoint: JobCheckpoint) {
        debug!(executor = %self.name, cursor = ?checkpoint.batch_id, "execution started");

        let mut stream = self.source.list_batches(
            self.cancel.clone(),
            self.config.parallelism,
            checkpoint.batch_id.clone(),
        );
        let mut errors_open = true;
        let mut batches_open = true;
        let mut last_start: Option<Instant> = None;

        while batches_open || errors_open {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(executor = %self.name, "execution cancelled");
                    return;
                }

                error = stream.errors.recv(), if errors_open => match error {
                    Some(e) => {
                        if !self.enumeration_error(e).await {
                            return;
                        }
                    }
                    None => errors_open = false,
                },

                batch = stream.batches.recv(), if batches_open => match batch {
                    Some(batch) => {
                        if let Some(previous) = last_start
                            && !self.pace(previous).await
                        {
                            return;
                        }
                        last_start = Some(Instant::now());

                        let Some(update) = self.process_batch(&batch, &checkpoint).await else {
                            return;
                        };

                        debug!(
                            executor = %self.name,
                            size = batch.len(),
                            completed = update.completed,
                            failed = update.failed,
                            "batch processed"
                        );
                        checkpoint = update.new_checkpoint.clone();
                        if !self.send_update(update).await {
                            return;
                        }
                    }
                    None => batches_open = false,
                },
            }
        }

        debug!(executor = %self.name, cursor = ?checkpoint.batch_id, "execution finished");
    }

    async fn enumeration_error(&self, e: WorkflowError) -> bool {
        warn!(executor = %self.name, error = %e, "enumeration error");
        self.send_error(JobError::new(None, e.to_string())).await
    }

    /// Process one batch. Returns `None` if the job was cancelled meanwhile.
    async fn process_batch(&self, batch: &[ItemId], previous: &JobCheckpoint) -> Option<JobUpdate> {
        let deadline = Instant::now() + self.config.upper_bound;
        let (done_tx, mut done_rx) = mpsc::channel(batch.len().max(1));

        for (position, item) in batch.iter().cloned().enumerate() {
            let processor = Arc::clone(&self.processor);
            let cancel = self.cancel.clone();
            let done_tx = done_tx.clone();
            let error_tx = self.error_tx.clone();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    outcome = timeout_at(deadline, processor.process(item.clone())) => outcome,
                };

                match outcome {
                    Ok(Ok(())) => {
                        let _ = done_tx.send(position).await;
                    }
                    Ok(Err(failure)) => {
                        let error = JobError::new(Some(item), failure.to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = error_tx.send(error) => {}
                        }
                    }
                    Err(_) => {
                        debug!(item = %item, "item abandoned at batch deadline");
                    }
                }
            });
        }
        drop(done_tx);

        // Completion order is arbitrary; only the highest position matters.
        let mut max_position = None;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                position = done_rx.recv() => match position {
                    Some(position) => max_position = max_position.max(Some(position)),
                    None => break,
                },
            }
        }

        Some(summarize_batch(batch, max_position, previous))
    }

    async fn send_update(&self, update: JobUpdate) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.update_tx.send(update) => sent.is_ok(),
        }
    }

    async fn send_error(&self, error: JobError) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.error_tx.send(error) => sent.is_ok(),
        }
    }

    /// Hold a batch back until `lower_bound` has passed since the previous
    /// one started.
    async fn pace(&self, started: Instant) -> bool {
        let elapsed = started.elapsed();
        if elapsed >= self.config.lower_bound {
            return true;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.lower_bound - elapsed) => true,
        }
    }
}
