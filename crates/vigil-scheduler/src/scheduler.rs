//! Trigger scheduler implementation.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::{CronEngine, EngineJob, parse_cron};
use crate::{
    Command, PostRunHook, Registry, ScheduleId, ScheduleOptions, ScheduleState, ScheduledFunc,
    SchedulerError, run_isolated,
};

/// Cron-driven scheduler of recurring commands.
///
/// Cheap to clone; clones share the same registry and engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    engine: CronEngine,
    funcs: Registry<ScheduleId, ScheduledFunc>,
    delay_timers: Registry<ScheduleId, JoinHandle<()>>,
    lifecycle: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                engine: CronEngine::new(),
                funcs: Registry::new(),
                delay_timers: Registry::new(),
                lifecycle: Mutex::new(()),
                shutdown_tx,
            }),
        }
    }

    /// Schedule `cmd` on the cron expression `spec`.
    ///
    /// With a zero delay the command is registered immediately and the
    /// returned function is `Active`. Otherwise it is `Delayed` until a
    /// background timer registers it.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime when a timer task has to be spawned,
    /// i.e. for a delayed trigger or while the scheduler is running.
    #[tracing::instrument(skip(self, cmd, opts), fields(delay = ?opts.delay))]
    pub fn schedule(
        &self,
        spec: &str,
        cmd: Command,
        opts: ScheduleOptions,
    ) -> Result<ScheduledFunc, SchedulerError> {
        let schedule = parse_cron(spec)?;
        let func = self
            .inner
            .install(ScheduleId::new(), spec, schedule, cmd, opts, None);
        info!(id = %func.id, state = ?func.state, next_run = ?func.next_run, "scheduled function");
        Ok(func)
    }

    /// Re-register a persisted trigger at startup.
    ///
    /// If the trigger's next fire time has already passed, `cmd` runs once
    /// before this returns, so a fire missed during downtime is caught up
    /// exactly once. Absent times are treated as a cold start.
    #[tracing::instrument(skip(self, cmd, opts))]
    pub async fn recover(
        &self,
        spec: &str,
        cmd: Command,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        opts: ScheduleOptions,
    ) -> Result<ScheduledFunc, SchedulerError> {
        let schedule = parse_cron(spec)?;
        let now = Utc::now();
        let mut last_run = last_run.unwrap_or(now);
        let next_run = next_run.or_else(|| schedule.after(&last_run).next());

        if let Some(missed) = next_run.filter(|next| *next < now) {
            info!(missed = %missed, "running missed trigger");
            if let Err(e) = run_isolated("recovered command", cmd()).await {
                warn!(error = %e, "recovered command failed");
            }
            last_run = Utc::now();
        }

        let func = self
            .inner
            .install(ScheduleId::new(), spec, schedule, cmd, opts, Some(last_run));
        info!(id = %func.id, next_run = ?func.next_run, "recovered function");
        Ok(func)
    }

    /// Replace the command and options of an existing trigger.
    ///
    /// The engine entry is swapped under the same id; a run already in
    /// flight finishes undisturbed and still runs the hooks it was
    /// scheduled with.
    ///
    /// # Panics
    ///
    /// Same as [`Scheduler::schedule`].
    #[tracing::instrument(skip(self, cmd, opts))]
    pub fn update(
        &self,
        id: ScheduleId,
        cmd: Command,
        opts: ScheduleOptions,
    ) -> Result<ScheduledFunc, SchedulerError> {
        let prior = self.inner.remove(id)?;
        let schedule = parse_cron(&prior.cron_spec)?;
        debug!(id = %id, prior_state = ?prior.state, "prior function marked stale");

        let func = self
            .inner
            .install(id, &prior.cron_spec, schedule, cmd, opts, prior.last_run);
        info!(id = %id, state = ?func.state, "updated function");
        Ok(func)
    }

    /// Remove a trigger. Returns it marked `Stale`.
    pub fn delete(&self, id: ScheduleId) -> Result<ScheduledFunc, SchedulerError> {
        let func = self.inner.remove(id)?;
        info!(id = %id, "deleted function");
        Ok(func)
    }

    /// Get a trigger with times refreshed from the engine.
    pub fn get(&self, id: ScheduleId) -> Option<ScheduledFunc> {
        self.inner.refresh(id)
    }

    /// List all triggers with times refreshed from the engine.
    pub fn list(&self) -> Vec<ScheduledFunc> {
        let mut funcs: Vec<_> = self
            .inner
            .funcs
            .keys()
            .into_iter()
            .filter_map(|id| self.inner.refresh(id))
            .collect();
        funcs.sort_by(|a, b| a.next_run.cmp(&b.next_run));
        funcs
    }

    /// Start firing triggers.
    pub async fn start(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.shutdown_tx.send_replace(false);
        self.inner.engine.start();
        info!(triggers = self.inner.funcs.len(), "scheduler started");
    }

    /// Delete every trigger, delayed ones included, then halt the engine.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.shutdown_tx.send_replace(true);

        let ids = self.inner.funcs.keys();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.inner.remove(id) {
                debug!(id = %id, error = %e, "function vanished during stop");
            }
        }

        self.inner.engine.stop();
        info!(deleted = count, "scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.engine.is_running()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn install(
        self: &Arc<Self>,
        id: ScheduleId,
        spec: &str,
        schedule: Schedule,
        cmd: Command,
        opts: ScheduleOptions,
        last_run: Option<DateTime<Utc>>,
    ) -> ScheduledFunc {
        let mut func = ScheduledFunc::new(id, spec);
        func.last_run = last_run;

        if opts.delay.is_zero() {
            let job = self.wrap(id, cmd, opts.hooks);
            let (entry_id, times) = self.engine.add(schedule, job);
            func.entry_id = Some(entry_id);
            func.next_run = times.next;
            self.funcs.store(id, func.clone());
            return func;
        }

        func.state = ScheduleState::Delayed;
        func.delay_until = chrono::Duration::from_std(opts.delay)
            .ok()
            .map(|delay| Utc::now() + delay);
        self.funcs.store(id, func.clone());

        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let delay = opts.delay;
        let hooks = opts.hooks;
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            }
            inner.delay_timers.delete(&id);
            if *shutdown_rx.borrow() {
                return;
            }
            inner.activate(id, schedule, cmd, hooks);
        });
        if let Some(previous) = self.delay_timers.store(id, timer) {
            previous.abort();
        }

        func
    }

    /// Register a delayed function once its timer fires.
    fn activate(
        self: &Arc<Self>,
        id: ScheduleId,
        schedule: Schedule,
        cmd: Command,
        hooks: Vec<PostRunHook>,
    ) {
        let still_delayed = self
            .funcs
            .load(&id)
            .is_some_and(|f| f.state == ScheduleState::Delayed);
        if !still_delayed {
            return;
        }

        let job = self.wrap(id, cmd, hooks);
        let (entry_id, times) = self.engine.add(schedule, job);
        let activated = self.funcs.update(&id, |f| {
            f.entry_id = Some(entry_id);
            f.next_run = times.next;
            f.state = ScheduleState::Active;
        });

        if activated.is_none() {
            // Deleted while the entry was being added.
            self.engine.remove(entry_id);
            return;
        }
        info!(id = %id, next_run = ?times.next, "delayed function activated");
    }

    fn remove(&self, id: ScheduleId) -> Result<ScheduledFunc, SchedulerError> {
        let mut func = self
            .funcs
            .delete(&id)
            .ok_or(SchedulerError::NotFound(id))?;

        if let Some(timer) = self.delay_timers.delete(&id) {
            timer.abort();
        }
        if func.state != ScheduleState::Delayed
            && let Some(entry_id) = func.entry_id
        {
            self.engine.remove(entry_id);
        }

        func.state = ScheduleState::Stale;
        Ok(func)
    }

    fn refresh(&self, id: ScheduleId) -> Option<ScheduledFunc> {
        self.funcs.update(&id, |func| {
            if func.state == ScheduleState::Active
                && let Some(times) = func.entry_id.and_then(|entry| self.engine.times(entry))
            {
                if times.prev.is_some() {
                    func.last_run = times.prev;
                }
                func.next_run = times.next;
            }
            func.clone()
        })
    }

    /// Wrap a command so each fire runs isolated on its own task, refreshes
    /// the stored times, then runs the post-run hooks.
    fn wrap(
        self: &Arc<Self>,
        id: ScheduleId,
        cmd: Command,
        hooks: Vec<PostRunHook>,
    ) -> EngineJob {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let hooks = Arc::new(hooks);

        Arc::new(move || {
            let inner = inner.clone();
            let cmd = Arc::clone(&cmd);
            let hooks = Arc::clone(&hooks);

            tokio::spawn(async move {
                if let Err(e) = run_isolated("scheduled command", cmd()).await {
                    warn!(id = %id, error = %e, "scheduled command failed");
                }

                let Some(func) = inner.upgrade().and_then(|inner| inner.refresh(id)) else {
                    return;
                };
                for hook in hooks.iter() {
                    if let Err(e) = run_isolated("post-run hook", hook(func.clone())).await {
                        warn!(id = %id, error = %e, "post-run hook failed");
                    }
                }
            });
        })
    }
}
