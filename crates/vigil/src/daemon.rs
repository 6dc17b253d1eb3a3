//! The `run` subcommand: triggers wired to the workflow service.

use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_scheduler::{Command, PostRunHook, ScheduleOptions, Scheduler, command, hook};
use vigil_workflow::memory::{InMemoryJobRepository, LogAlerter, VecBatchSource};
use vigil_workflow::{
    Alerter, ItemFailure, ItemId, ItemProcessor, JobRepository, JobStatus, WorkflowService,
    WorkflowType,
};

use crate::config::RunConfig;
use crate::trigger_store::TriggerStore;

/// Run until Ctrl-C.
pub async fn run(config: RunConfig) -> Result<()> {
    let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    let alerter: Arc<dyn Alerter> = Arc::new(LogAlerter);

    let service = Arc::new(WorkflowService::new());
    for definition in &config.definitions {
        let items = VecBatchSource::new(demo_items(config.demo_items));
        let observer = definition.observer(
            Arc::new(items),
            dry_run_processor(definition.workflow_type),
            Arc::clone(&repository),
            Arc::clone(&alerter),
        );
        service.register(Arc::new(observer));
    }
    service.initialize().await.into_diagnostic()?;

    let store = match &config.state_file {
        Some(path) => Some(Arc::new(TriggerStore::open(path).await.into_diagnostic()?)),
        None => None,
    };

    let scheduler = Scheduler::new();
    for definition in &config.definitions {
        let workflow_type = definition.workflow_type;

        let mut opts = ScheduleOptions::default();
        let mut persisted = None;
        if let Some(store) = &store {
            opts = opts.with_hook(persist_hook(Arc::clone(store), workflow_type));
            // Times recorded under a different expression no longer apply.
            persisted = store
                .get(workflow_type)
                .await
                .filter(|state| state.cron_spec == definition.cron_spec);
        }
        let (last_run, next_run) = persisted
            .map(|state| (state.last_run, state.next_run))
            .unwrap_or_default();

        let func = scheduler
            .recover(
                &definition.cron_spec,
                submit_command(Arc::clone(&service), workflow_type),
                last_run,
                next_run,
                opts,
            )
            .await
            .into_diagnostic()?;

        if let Some(store) = &store
            && let Err(e) = store.record(workflow_type, &func).await
        {
            warn!(workflow = %workflow_type, error = %e, "failed to record trigger state");
        }
        info!(
            workflow = %workflow_type,
            cron = %definition.cron_spec,
            next_run = ?func.next_run,
            "trigger registered"
        );
    }

    scheduler.start().await;
    info!("vigil running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("received shutdown signal");

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "workflow service shut down with errors");
    }
    scheduler.stop().await;

    info!("vigil shut down gracefully");
    Ok(())
}

/// Trigger command submitting a job of `workflow_type`. A trigger that
/// fires while the previous job is still running is skipped.
pub fn submit_command(service: Arc<WorkflowService>, workflow_type: WorkflowType) -> Command {
    command(move || {
        let service = Arc::clone(&service);
        async move {
            match service.list(workflow_type, JobStatus::Running) {
                Ok(running) if !running.is_empty() => {
                    info!(
                        workflow = %workflow_type,
                        job_id = %running[0].job_id,
                        "previous job still running, skipping trigger"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(workflow = %workflow_type, error = %e, "trigger fired while service unavailable");
                    return;
                }
            }

            match service.submit(workflow_type).await {
                Ok(job_id) => info!(workflow = %workflow_type, job_id = %job_id, "trigger submitted job"),
                Err(e) => warn!(workflow = %workflow_type, error = %e, "trigger failed to submit job"),
            }
        }
    })
}

/// Post-run hook recording the trigger's refreshed times.
fn persist_hook(store: Arc<TriggerStore>, workflow_type: WorkflowType) -> PostRunHook {
    hook(move |func| {
        let store = Arc::clone(&store);
        async move {
            if let Err(e) = store.record(workflow_type, &func).await {
                warn!(workflow = %workflow_type, error = %e, "failed to record trigger state");
            }
        }
    })
}

fn demo_items(count: usize) -> Vec<ItemId> {
    (0..count).map(|_| ItemId::from(Uuid::new_v4())).collect()
}

/// Stand-in for the real per-item actions: simulated latency, no side effects.
fn dry_run_processor(workflow_type: WorkflowType) -> Arc<dyn ItemProcessor> {
    let latency = match workflow_type {
        WorkflowType::PageRefresh => Duration::from_millis(250),
        WorkflowType::ReportGeneration => Duration::from_millis(100),
        WorkflowType::ReportDispatch => Duration::from_millis(20),
    };

    Arc::new(move |item: ItemId| async move {
        sleep(latency).await;
        debug!(workflow = %workflow_type, item = %item, "dry run processed item");
        Ok::<(), ItemFailure>(())
    })
}
