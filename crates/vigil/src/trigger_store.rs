//! Trigger times persisted across restarts.
//!
//! The scheduler itself keeps nothing durable. After every fire a post-run
//! hook records the trigger's times here, and at startup they are handed to
//! `Scheduler::recover` so a fire missed while the process was down runs once.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use vigil_scheduler::ScheduledFunc;
use vigil_workflow::WorkflowType;

#[derive(Debug, Error)]
pub enum TriggerStoreError {
    #[error("failed to read trigger state {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write trigger state {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("malformed trigger state {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode trigger state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persisted times of one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    pub cron_spec: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl From<&ScheduledFunc> for TriggerState {
    fn from(func: &ScheduledFunc) -> Self {
        Self {
            cron_spec: func.cron_spec.clone(),
            last_run: func.last_run,
            next_run: func.next_run,
        }
    }
}

/// JSON file of trigger states keyed by workflow type.
#[derive(Debug)]
pub struct TriggerStore {
    path: PathBuf,
    triggers: Mutex<BTreeMap<String, TriggerState>>,
}

impl TriggerStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TriggerStoreError> {
        let path = path.as_ref().to_path_buf();

        let triggers = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                TriggerStoreError::Parse {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(TriggerStoreError::Read { path, source }),
        };

        debug!(path = %path.display(), triggers = triggers.len(), "opened trigger store");
        Ok(Self {
            path,
            triggers: Mutex::new(triggers),
        })
    }

    pub async fn get(&self, workflow_type: WorkflowType) -> Option<TriggerState> {
        self.triggers.lock().await.get(workflow_type.as_str()).cloned()
    }

    /// Record a trigger's times and flush the file.
    pub async fn record(
        &self,
        workflow_type: WorkflowType,
        func: &ScheduledFunc,
    ) -> Result<(), TriggerStoreError> {
        let mut triggers = self.triggers.lock().await;
        triggers.insert(workflow_type.as_str().to_string(), TriggerState::from(func));

        // Write-then-rename so a crash never leaves a truncated file.
        let contents = serde_json::to_string_pretty(&*triggers)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, contents)
            .await
            .map_err(|source| TriggerStoreError::Write {
                path: staging.clone(),
                source,
            })?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|source| TriggerStoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(workflow = %workflow_type, next_run = ?func.next_run, "recorded trigger state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vigil_scheduler::{Scheduler, ScheduleOptions, command};

    async fn scheduled(spec: &str) -> ScheduledFunc {
        let scheduler = Scheduler::new();
        scheduler
            .schedule(spec, command(|| async {}), ScheduleOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TriggerStore::open(dir.path().join("triggers.json"))
            .await
            .unwrap();

        assert_eq!(store.get(WorkflowType::PageRefresh).await, None);
    }

    #[tokio::test]
    async fn test_recorded_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        let func = scheduled("0 0 */6 * * *").await;

        let store = TriggerStore::open(&path).await.unwrap();
        store.record(WorkflowType::PageRefresh, &func).await.unwrap();
        drop(store);

        let reopened = TriggerStore::open(&path).await.unwrap();
        let state = reopened.get(WorkflowType::PageRefresh).await.unwrap();
        assert_eq!(state, TriggerState::from(&func));
        assert_eq!(reopened.get(WorkflowType::ReportDispatch).await, None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_keys_by_workflow_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        let store = TriggerStore::open(&path).await.unwrap();
        store
            .record(WorkflowType::ReportGeneration, &scheduled("@daily").await)
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["report_generation"]["cron_spec"], "@daily");
    }

    #[tokio::test]
    async fn test_malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = TriggerStore::open(&path).await;
        assert!(matches!(result, Err(TriggerStoreError::Parse { .. })));
    }
}
