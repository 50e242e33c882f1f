//! JobEventBus - the single path from "something happened" to persistence
//! and live fan-out
//!
//! ```text
//! JobManager ─┐                         ┌─► JobStore (append)
//!             ├─► append(job, kind) ────┤
//! AgentLoop ──┘      (one lock)         └─► subscribers (broadcast)
//! ```
//!
//! Appending and broadcasting happen in the same critical section, so the
//! stored log and what subscribers saw can never diverge. After `done` the
//! log is closed: further appends are dropped and subscriber channels end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::model::{Event, EventKind};
use super::store::JobStore;

#[derive(Default)]
struct JobLog {
    events: Vec<Event>,
    last_ts: Option<DateTime<Utc>>,
    closed: bool,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

/// Replay-then-live view of one job's events.
pub struct Subscription {
    /// Everything appended before the subscription was taken
    pub history: Vec<Event>,
    /// Live events; `None` when the log was already closed
    pub live: Option<mpsc::UnboundedReceiver<Event>>,
}

/// Shared append/broadcast hub for all jobs.
#[derive(Clone)]
pub struct JobEventBus {
    logs: Arc<Mutex<HashMap<Uuid, JobLog>>>,
    store: Arc<dyn JobStore>,
}

impl JobEventBus {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            logs: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    /// Create an empty log for a new job.
    pub fn open(&self, job_id: Uuid) {
        self.lock_logs().entry(job_id).or_default();
    }

    /// Re-create a log from persisted events. A log ending in `done` stays closed.
    pub fn restore(&self, job_id: Uuid, events: Vec<Event>) {
        let closed = events.last().map(|e| e.kind == EventKind::Done).unwrap_or(false);
        let last_ts = events.last().map(|e| e.ts);
        self.lock_logs().insert(
            job_id,
            JobLog {
                events,
                last_ts,
                closed,
                subscribers: Vec::new(),
            },
        );
    }

    /// Append an event and fan it out.
    ///
    /// Returns `None` when the job is unknown or its log is closed. Appending
    /// [`EventKind::Done`] closes the log.
    pub fn append(&self, job_id: Uuid, kind: EventKind, data: Option<Value>) -> Option<Event> {
        let mut logs = self.lock_logs();
        let log = logs.get_mut(&job_id)?;
        if log.closed {
            tracing::debug!(job_id = %job_id, kind = %kind, "dropping event after done");
            return None;
        }

        let mut ts = Utc::now();
        if let Some(last) = log.last_ts {
            if ts <= last {
                ts = last + Duration::microseconds(1);
            }
        }
        let event = Event {
            id: log.events.len() as u64 + 1,
            job_id,
            kind,
            ts,
            data,
        };

        if let Err(e) = self.store.append_event(&event) {
            tracing::warn!(job_id = %job_id, kind = %kind, error = %e, "failed to persist event");
        }
        log.events.push(event.clone());
        log.last_ts = Some(ts);

        // A send error means the receiver is gone; drop that subscriber
        log.subscribers.retain(|tx| tx.send(event.clone()).is_ok());

        if kind == EventKind::Done {
            log.closed = true;
            log.subscribers.clear();
        }
        Some(event)
    }

    /// Replay the full history and register for live events.
    pub fn subscribe(&self, job_id: Uuid) -> Option<Subscription> {
        let mut logs = self.lock_logs();
        let log = logs.get_mut(&job_id)?;
        let history = log.events.clone();
        if log.closed {
            return Some(Subscription {
                history,
                live: None,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        log.subscribers.push(tx);
        Some(Subscription {
            history,
            live: Some(rx),
        })
    }

    /// Snapshot of a job's log.
    pub fn events(&self, job_id: Uuid) -> Vec<Event> {
        self.lock_logs()
            .get(&job_id)
            .map(|l| l.events.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, job_id: Uuid) -> bool {
        self.lock_logs().get(&job_id).map(|l| l.closed).unwrap_or(true)
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.lock_logs()
            .get(&job_id)
            .map(|l| l.subscribers.len())
            .unwrap_or(0)
    }

    /// Forget a job's log (administrative purge).
    pub fn purge(&self, job_id: Uuid) {
        self.lock_logs().remove(&job_id);
    }

    fn lock_logs(&self) -> MutexGuard<'_, HashMap<Uuid, JobLog>> {
        // Every append completes before the guard drops, so a poisoned map is still whole
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scoped emitter for one job.
    pub fn emitter(&self, job_id: Uuid) -> JobEvents {
        JobEvents {
            job_id,
            bus: self.clone(),
        }
    }
}

/// Emits events for a single job; handed to the Agent Loop and tools.
#[derive(Clone)]
pub struct JobEvents {
    job_id: Uuid,
    bus: JobEventBus,
}

impl JobEvents {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn emit(&self, kind: EventKind, data: Value) -> Option<Event> {
        self.bus.append(self.job_id, kind, Some(data))
    }
}
