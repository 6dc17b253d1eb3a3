//! Scheduler types.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A command fired by a trigger.
pub type Command = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A hook run after each fire, given the refreshed trigger.
pub type PostRunHook =
    Arc<dyn Fn(ScheduledFunc) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Build a [`Command`] from an async closure.
pub fn command<F, Fut>(f: F) -> Command
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Build a [`PostRunHook`] from an async closure.
pub fn hook<F, Fut>(f: F) -> PostRunHook
where
    F: Fn(ScheduledFunc) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |func| Box::pin(f(func)))
}

/// Identifier of a scheduled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle into the cron engine. Never owns the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Lifecycle state of a scheduled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting for its activation delay; not yet in the cron engine.
    Delayed,
    /// Registered and firing.
    Active,
    /// Replaced or deleted.
    Stale,
}

/// A recurring trigger as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledFunc {
    pub id: ScheduleId,
    /// Cron expression the trigger was created from.
    pub cron_spec: String,
    /// When the trigger last fired.
    pub last_run: Option<DateTime<Utc>>,
    /// When the trigger fires next. `None` while delayed.
    pub next_run: Option<DateTime<Utc>>,
    /// When a delayed trigger becomes active.
    pub delay_until: Option<DateTime<Utc>>,
    /// Cron engine entry, present once active.
    pub entry_id: Option<EntryId>,
    pub state: ScheduleState,
}

impl ScheduledFunc {
    pub(crate) fn new(id: ScheduleId, cron_spec: &str) -> Self {
        Self {
            id,
            cron_spec: cron_spec.to_string(),
            last_run: None,
            next_run: None,
            delay_until: None,
            entry_id: None,
            state: ScheduleState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ScheduleState::Active
    }
}

/// Options for [`Scheduler::schedule`](crate::Scheduler::schedule).
#[derive(Clone, Default)]
pub struct ScheduleOptions {
    /// Defer registration by this long. Zero registers immediately.
    pub delay: Duration,
    /// Hooks run after every fire.
    pub hooks: Vec<PostRunHook>,
}

impl ScheduleOptions {
    /// Options that defer activation by `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            hooks: Vec::new(),
        }
    }

    /// Add a post-run hook.
    pub fn with_hook(mut self, hook: PostRunHook) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl fmt::Debug for ScheduleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleOptions")
            .field("delay", &self.delay)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
