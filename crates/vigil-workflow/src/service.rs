//! Façade over the observers of every workflow type.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use vigil_scheduler::Registry;

use crate::{
    JobId, JobRecord, JobSnapshot, JobState, JobStatus, WorkflowError, WorkflowObserver,
    WorkflowType,
};

/// Routes job operations to the observer of their workflow type.
///
/// Calls fail with [`WorkflowError::ServiceNotLive`] until [`initialize`]
/// has recovered every observer, and again after [`shutdown`].
///
/// [`initialize`]: WorkflowService::initialize
/// [`shutdown`]: WorkflowService::shutdown
#[derive(Default)]
pub struct WorkflowService {
    observers: Registry<WorkflowType, Arc<WorkflowObserver>>,
    live: AtomicBool,
}

impl WorkflowService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the observer of a workflow type, replacing any previous one.
    pub fn register(&self, observer: Arc<WorkflowObserver>) {
        let workflow_type = observer.workflow_type();
        if self.observers.store(workflow_type, observer).is_some() {
            info!(workflow = %workflow_type, "replaced workflow observer");
        }
    }

    /// Recover the interrupted jobs of every observer, then go live.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), WorkflowError> {
        for observer in self.observers.values() {
            let recovered = observer.recover().await.inspect_err(|e| {
                error!(workflow = %observer.workflow_type(), error = %e, "recovery failed");
            })?;
            info!(workflow = %observer.workflow_type(), recovered, "observer recovered");
        }

        self.live.store(true, Ordering::SeqCst);
        info!(observers = self.observers.len(), "workflow service live");
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn submit(&self, workflow_type: WorkflowType) -> Result<JobId, WorkflowError> {
        self.observer(workflow_type)?.submit().await
    }

    pub async fn stop(&self, workflow_type: WorkflowType, job_id: JobId) -> Result<(), WorkflowError> {
        self.observer(workflow_type)?.cancel(job_id).await
    }

    pub async fn status(
        &self,
        workflow_type: WorkflowType,
        job_id: JobId,
    ) -> Result<JobStatus, WorkflowError> {
        self.observer(workflow_type)?.status(job_id).await
    }

    pub async fn state(
        &self,
        workflow_type: WorkflowType,
        job_id: JobId,
    ) -> Result<JobState, WorkflowError> {
        self.observer(workflow_type)?.state(job_id).await
    }

    pub async fn get(
        &self,
        workflow_type: WorkflowType,
        job_id: JobId,
    ) -> Result<JobSnapshot, WorkflowError> {
        self.observer(workflow_type)?.get(job_id).await
    }

    pub fn list(
        &self,
        workflow_type: WorkflowType,
        status: JobStatus,
    ) -> Result<Vec<JobSnapshot>, WorkflowError> {
        Ok(self.observer(workflow_type)?.list(status))
    }

    pub async fn history(
        &self,
        workflow_type: WorkflowType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, WorkflowError> {
        self.observer(workflow_type)?.history(limit, offset).await
    }

    /// Go down, then shut down every observer. Every observer is attempted;
    /// the first error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkflowError> {
        self.live.store(false, Ordering::SeqCst);

        let mut first_error = None;
        for observer in self.observers.values() {
            if let Err(e) = observer.shutdown().await {
                error!(workflow = %observer.workflow_type(), error = %e, "observer shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        info!("workflow service shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn observer(&self, workflow_type: WorkflowType) -> Result<Arc<WorkflowObserver>, WorkflowError> {
        if !self.is_live() {
            return Err(WorkflowError::ServiceNotLive);
        }
        self.observers
            .load(&workflow_type)
            .ok_or(WorkflowError::ExecutorNotFound(workflow_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryJobRepository, LogAlerter, VecBatchSource};
    use crate::{
        BatchJobExecutor, ItemFailure, ItemId, ItemProcessor, JobCounters, JobExecutorConfig,
        JobRepository,
    };
    use std::time::Duration;

    fn page_refresh_observer(repository: Arc<InMemoryJobRepository>) -> Arc<WorkflowObserver> {
        let source = Arc::new(VecBatchSource::new(vec![ItemId::new("a"), ItemId::new("b")]));
        let processor: Arc<dyn ItemProcessor> =
            Arc::new(|_item: ItemId| async { Ok::<(), ItemFailure>(()) });
        let executor = Arc::new(BatchJobExecutor::new(
            "page_refresh",
            JobExecutorConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
            source,
            processor,
        ));
        Arc::new(WorkflowObserver::new(
            WorkflowType::PageRefresh,
            executor,
            repository,
            Arc::new(LogAlerter),
        ))
    }

    #[tokio::test]
    async fn test_not_live_before_initialize() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let service = WorkflowService::new();
        service.register(page_refresh_observer(repository.clone()));

        assert!(!service.is_live());
        assert!(matches!(
            service.submit(WorkflowType::PageRefresh).await,
            Err(WorkflowError::ServiceNotLive)
        ));
        assert!(repository.list_records(None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_type_is_rejected() {
        let service = WorkflowService::new();
        service.register(page_refresh_observer(Arc::new(InMemoryJobRepository::new())));
        service.initialize().await.unwrap();

        assert!(matches!(
            service.submit(WorkflowType::ReportDispatch).await,
            Err(WorkflowError::ExecutorNotFound(WorkflowType::ReportDispatch))
        ));
    }

    #[tokio::test]
    async fn test_not_live_after_shutdown() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let service = WorkflowService::new();
        service.register(page_refresh_observer(repository.clone()));
        service.initialize().await.unwrap();
        assert!(service.is_live());

        service.shutdown().await.unwrap();

        assert!(!service.is_live());
        assert!(matches!(
            service.submit(WorkflowType::PageRefresh).await,
            Err(WorkflowError::ServiceNotLive)
        ));
        assert!(matches!(
            service.list(WorkflowType::PageRefresh, JobStatus::Running),
            Err(WorkflowError::ServiceNotLive)
        ));
        assert!(repository.list_records(None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_error_keeps_service_down() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let service = WorkflowService::new();
        service.register(page_refresh_observer(repository.clone()));

        struct BrokenRepository;

        #[async_trait::async_trait]
        impl JobRepository for BrokenRepository {
            async fn start_job(&self, _: &JobRecord) -> Result<(), WorkflowError> {
                Ok(())
            }
            async fn set_state(
                &self,
                _: JobId,
                _: &JobState,
                _: &JobCounters,
            ) -> Result<(), WorkflowError> {
                Ok(())
            }
            async fn complete_job(
                &self,
                _: JobId,
                _: &JobState,
                _: &JobCounters,
            ) -> Result<(), WorkflowError> {
                Ok(())
            }
            async fn cancel_job(
                &self,
                _: JobId,
                _: &JobState,
                _: &JobCounters,
            ) -> Result<(), WorkflowError> {
                Ok(())
            }
            async fn fail_job(&self, _: JobId, _: &str) -> Result<(), WorkflowError> {
                Ok(())
            }
            async fn get_record(&self, _: JobId) -> Result<Option<JobRecord>, WorkflowError> {
                Ok(None)
            }
            async fn list_active_jobs(
                &self,
                _: WorkflowType,
            ) -> Result<Vec<JobRecord>, WorkflowError> {
                Err(WorkflowError::Repository("connection refused".to_string()))
            }
            async fn list_records(
                &self,
                _: Option<WorkflowType>,
                _: usize,
                _: usize,
            ) -> Result<Vec<JobRecord>, WorkflowError> {
                Ok(Vec::new())
            }
        }

        let broken = Arc::new(WorkflowObserver::new(
            WorkflowType::ReportGeneration,
            Arc::new(BatchJobExecutor::new(
                "report_generation",
                JobExecutorConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
                Arc::new(VecBatchSource::default()),
                Arc::new(|_item: ItemId| async { Ok::<(), ItemFailure>(()) }),
            )),
            Arc::new(BrokenRepository),
            Arc::new(LogAlerter),
        ));
        service.register(broken);

        assert!(matches!(
            service.initialize().await,
            Err(WorkflowError::Repository(_))
        ));
        assert!(!service.is_live());
    }
}
