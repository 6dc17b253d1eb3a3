//! Cron engine: parsed schedules armed as timer tasks.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::{EntryId, Registry, SchedulerError};

/// Number of fields in a seconds-enabled cron expression.
const CRON_FIELDS: usize = 6;

/// Job invoked by the engine on every fire. Must not block.
pub(crate) type EngineJob = Arc<dyn Fn() + Send + Sync>;

/// Parse a six-field cron expression or an `@` descriptor.
pub fn parse_cron(spec: &str) -> Result<Schedule, SchedulerError> {
    let spec = spec.trim();
    let parse_error = |reason: String| SchedulerError::Parse {
        spec: spec.to_string(),
        reason,
    };

    if !spec.starts_with('@') {
        let fields = spec.split_whitespace().count();
        if fields != CRON_FIELDS {
            return Err(parse_error(format!(
                "expected {CRON_FIELDS} fields (sec min hour dom mon dow), got {fields}"
            )));
        }
    }

    Schedule::from_str(spec).map_err(|e| parse_error(e.to_string()))
}

/// Previous and next fire times of an engine entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTimes {
    pub prev: Option<DateTime<Utc>>,
    pub next: Option<DateTime<Utc>>,
}

struct Entry {
    schedule: Schedule,
    job: EngineJob,
    times: Mutex<EntryTimes>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Entry {
    fn next(&self) -> Option<DateTime<Utc>> {
        self.times.lock().next
    }

    fn disarm(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

/// Registry of cron entries. Entries only fire while the engine runs.
pub(crate) struct CronEngine {
    entries: Registry<EntryId, Arc<Entry>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl CronEngine {
    pub(crate) fn new() -> Self {
        Self {
            entries: Registry::new(),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Add an entry. It is armed right away if the engine is running, which
    /// spawns its timer task and so needs a Tokio runtime.
    pub(crate) fn add(&self, schedule: Schedule, job: EngineJob) -> (EntryId, EntryTimes) {
        let id = EntryId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let times = EntryTimes {
            prev: None,
            next: schedule.after(&Utc::now()).next(),
        };
        let entry = Arc::new(Entry {
            schedule,
            job,
            times: Mutex::new(times),
            timer: Mutex::new(None),
        });

        self.entries.store(id, Arc::clone(&entry));
        if self.running.load(Ordering::SeqCst) {
            arm(id, &entry);
        }

        debug!(entry = %id, next = ?times.next, "added cron entry");
        (id, times)
    }

    /// Remove an entry, cancelling its timer. A fire already handed to the
    /// job keeps running.
    pub(crate) fn remove(&self, id: EntryId) -> bool {
        match self.entries.delete(&id) {
            Some(entry) => {
                entry.disarm();
                debug!(entry = %id, "removed cron entry");
                true
            }
            None => false,
        }
    }

    pub(crate) fn times(&self, id: EntryId) -> Option<EntryTimes> {
        self.entries.load(&id).map(|entry| *entry.times.lock())
    }

    /// Arm every entry. Next fire times are recomputed from now.
    pub(crate) fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let now = Utc::now();
        for id in self.entries.keys() {
            if let Some(entry) = self.entries.load(&id) {
                entry.times.lock().next = entry.schedule.after(&now).next();
                arm(id, &entry);
            }
        }
    }

    /// Disarm every entry.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.entries.range(|_, entry| {
            entry.disarm();
            true
        });
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn arm(id: EntryId, entry: &Arc<Entry>) {
    let task_entry = Arc::clone(entry);
    let handle = tokio::spawn(async move {
        let entry = task_entry;
        while let Some(next) = entry.next() {
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            sleep(wait).await;

            // Timers may wake a hair early; never compute the next fire
            // from a point before the one just reached.
            let now = Utc::now().max(next);
            {
                let mut times = entry.times.lock();
                times.prev = Some(next);
                times.next = entry.schedule.after(&now).next();
            }

            trace!(entry = %id, fired_at = %next, "cron entry fired");
            (entry.job)();
        }
    });

    if let Some(previous) = entry.timer.lock().replace(handle) {
        previous.abort();
    }
}
