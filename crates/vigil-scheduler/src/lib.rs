//! Recurring trigger scheduler for Vigil.
//!
//! This crate provides a cron-driven scheduler that:
//! - Parses six-field (seconds-enabled) cron expressions and `@` descriptors
//! - Supports deferred activation of triggers
//! - Catches up a missed fire exactly once when recovering persisted triggers
//! - Runs every command in its own task, isolating panics from the scheduler
//!
//! It also exports the small concurrency primitives the workflow engine
//! builds on: a typed concurrent [`Registry`] and the [`run_isolated`]
//! boundary.

mod engine;
mod error;
mod isolate;
mod registry;
mod scheduler;
mod types;

pub use engine::{EntryTimes, parse_cron};
pub use error::SchedulerError;
pub use isolate::run_isolated;
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use types::{
    Command, EntryId, PostRunHook, ScheduleId, ScheduleOptions, ScheduleState, ScheduledFunc,
    command, hook,
};
