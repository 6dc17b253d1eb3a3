//! Definitions of the concrete workflow types.
//!
//! Each workflow is the generic [`BatchJobExecutor`] paired with the source
//! that enumerates its collection and the action applied to each item.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    Alerter, BatchJobExecutor, BatchSource, ItemProcessor, JobExecutorConfig, JobRepository,
    WorkflowObserver, WorkflowType,
};

/// A workflow type with its tuning and default trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub workflow_type: WorkflowType,
    pub config: JobExecutorConfig,
    /// Six-field cron expression the workflow is triggered on by default.
    pub cron_spec: String,
}

impl WorkflowDefinition {
    /// Default tuning of a workflow type.
    pub fn new(workflow_type: WorkflowType) -> Self {
        let (config, cron_spec) = match workflow_type {
            // Screenshot capture is slow and hits third-party sites.
            WorkflowType::PageRefresh => (
                JobExecutorConfig::new(8, Duration::from_secs(1), Duration::from_secs(120)),
                "0 0 */6 * * *",
            ),
            WorkflowType::ReportGeneration => (
                JobExecutorConfig::new(4, Duration::from_secs(2), Duration::from_secs(300)),
                "0 0 5 * * Mon",
            ),
            WorkflowType::ReportDispatch => (
                JobExecutorConfig::new(16, Duration::from_millis(500), Duration::from_secs(60)),
                "0 0 8 * * Mon",
            ),
        };

        Self {
            workflow_type,
            config,
            cron_spec: cron_spec.to_string(),
        }
    }

    pub fn with_config(mut self, config: JobExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cron(mut self, cron_spec: impl Into<String>) -> Self {
        self.cron_spec = cron_spec.into();
        self
    }

    /// Build the executor of this workflow.
    pub fn executor(
        &self,
        source: Arc<dyn BatchSource>,
        processor: Arc<dyn ItemProcessor>,
    ) -> BatchJobExecutor {
        BatchJobExecutor::new(
            self.workflow_type.as_str(),
            self.config.clone(),
            source,
            processor,
        )
    }

    /// Build the observer of this workflow around its executor.
    pub fn observer(
        &self,
        source: Arc<dyn BatchSource>,
        processor: Arc<dyn ItemProcessor>,
        repository: Arc<dyn JobRepository>,
        alerter: Arc<dyn Alerter>,
    ) -> WorkflowObserver {
        WorkflowObserver::new(
            self.workflow_type,
            Arc::new(self.executor(source, processor)),
            repository,
            alerter,
        )
    }
}

/// Refresh the screenshot of every active page.
pub fn page_refresh(
    config: JobExecutorConfig,
    pages: Arc<dyn BatchSource>,
    refresh: Arc<dyn ItemProcessor>,
) -> BatchJobExecutor {
    WorkflowDefinition::new(WorkflowType::PageRefresh)
        .with_config(config)
        .executor(pages, refresh)
}

/// Generate a report for every active workspace.
pub fn report_generation(
    config: JobExecutorConfig,
    workspaces: Arc<dyn BatchSource>,
    generate: Arc<dyn ItemProcessor>,
) -> BatchJobExecutor {
    WorkflowDefinition::new(WorkflowType::ReportGeneration)
        .with_config(config)
        .executor(workspaces, generate)
}

/// Send the latest report of every active workspace to its subscribers.
pub fn report_dispatch(
    config: JobExecutorConfig,
    workspaces: Arc<dyn BatchSource>,
    dispatch: Arc<dyn ItemProcessor>,
) -> BatchJobExecutor {
    WorkflowDefinition::new(WorkflowType::ReportDispatch)
        .with_config(config)
        .executor(workspaces, dispatch)
}
