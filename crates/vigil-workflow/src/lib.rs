//! Checkpointed batch workflow engine for Vigil.
//!
//! A workflow type (page refresh, report generation, report dispatch) walks a
//! large collection in fixed-size batches. Each run is a *job*:
//!
//! - [`BatchJobExecutor`] streams batches from a [`BatchSource`], fans items
//!   out to an [`ItemProcessor`] under a per-batch deadline, and reports one
//!   [`JobUpdate`] per batch.
//! - [`WorkflowObserver`] supervises the jobs of one workflow type: it
//!   persists checkpoints, recovers interrupted jobs at startup, and answers
//!   status queries.
//! - [`WorkflowService`] routes calls to the observer of each workflow type
//!   and gates them on a liveness flag.

mod collaborators;
mod error;
mod executor;
pub mod memory;
mod observer;
mod service;
mod types;
pub mod workflows;

pub use collaborators::{Alerter, BatchSource, BatchStream, ItemProcessor, JobAlert, JobRepository};
pub use error::{ItemFailure, WorkflowError};
pub use executor::{BatchJobExecutor, JobChannels, JobExecutor, summarize_batch};
pub use observer::{JobEvent, WorkflowObserver};
pub use service::WorkflowService;
pub use types::{
    ItemId, JobCheckpoint, JobCounters, JobError, JobExecutorConfig, JobId, JobRecord,
    JobSnapshot, JobState, JobStatus, JobUpdate, WorkflowType,
};
pub use workflows::WorkflowDefinition;
