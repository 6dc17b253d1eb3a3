//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;
use vigil_scheduler::{SchedulerError, parse_cron};
use vigil_workflow::{WorkflowDefinition, WorkflowError, WorkflowType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cron expression for {workflow}: {source}")]
    Cron {
        workflow: WorkflowType,
        source: SchedulerError,
    },

    #[error("invalid executor settings for {workflow}: {source}")]
    Executor {
        workflow: WorkflowType,
        source: WorkflowError,
    },
}

/// Flags of `vigil run`. Unset values fall back to each workflow's defaults.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Cron expression (six fields, seconds first) triggering page refresh
    #[arg(long, env = "VIGIL_PAGE_REFRESH_CRON")]
    pub page_refresh_cron: Option<String>,

    /// Cron expression triggering report generation
    #[arg(long, env = "VIGIL_REPORT_GENERATION_CRON")]
    pub report_generation_cron: Option<String>,

    /// Cron expression triggering report dispatch
    #[arg(long, env = "VIGIL_REPORT_DISPATCH_CRON")]
    pub report_dispatch_cron: Option<String>,

    /// Items per batch, for every workflow
    #[arg(long, env = "VIGIL_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Minimum spacing between batch starts, in milliseconds
    #[arg(long, env = "VIGIL_LOWER_BOUND_MS")]
    pub lower_bound_ms: Option<u64>,

    /// Deadline of each batch, in milliseconds
    #[arg(long, env = "VIGIL_UPPER_BOUND_MS")]
    pub upper_bound_ms: Option<u64>,

    /// JSON file recording trigger times across restarts
    #[arg(long, env = "VIGIL_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Number of synthetic items each dry-run workflow walks
    #[arg(long, env = "VIGIL_DEMO_ITEMS", default_value = "100")]
    pub demo_items: usize,
}

/// Validated configuration of a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub definitions: Vec<WorkflowDefinition>,
    pub state_file: Option<PathBuf>,
    pub demo_items: usize,
}

impl RunArgs {
    fn cron_override(&self, workflow_type: WorkflowType) -> Option<&String> {
        match workflow_type {
            WorkflowType::PageRefresh => self.page_refresh_cron.as_ref(),
            WorkflowType::ReportGeneration => self.report_generation_cron.as_ref(),
            WorkflowType::ReportDispatch => self.report_dispatch_cron.as_ref(),
        }
    }

    /// Apply overrides to the default definitions and validate the result.
    pub fn into_config(self) -> Result<RunConfig, ConfigError> {
        let mut definitions = Vec::with_capacity(WorkflowType::ALL.len());

        for workflow in WorkflowType::ALL {
            let mut definition = WorkflowDefinition::new(workflow);
            if let Some(spec) = self.cron_override(workflow) {
                definition = definition.with_cron(spec.clone());
            }
            if let Some(parallelism) = self.parallelism {
                definition.config.parallelism = parallelism;
            }
            if let Some(ms) = self.lower_bound_ms {
                definition.config.lower_bound = Duration::from_millis(ms);
            }
            if let Some(ms) = self.upper_bound_ms {
                definition.config.upper_bound = Duration::from_millis(ms);
            }

            parse_cron(&definition.cron_spec)
                .map_err(|source| ConfigError::Cron { workflow, source })?;
            definition
                .config
                .validate()
                .map_err(|source| ConfigError::Executor { workflow, source })?;

            definitions.push(definition);
        }

        Ok(RunConfig {
            definitions,
            state_file: self.state_file,
            demo_items: self.demo_items,
        })
    }
}
