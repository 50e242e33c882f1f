//! Job Manager - owns job state machines and drives their work
//!
//! ```text
//! create ──► pending ──start──► running ──┬── work settles ──► done | error
//!               │                         ├── cancel ────────► cancelled
//!               └──── cancel ─────────────┴── safety timer ──► timeout
//! ```
//!
//! Every transition is a check-and-set inside one `std::sync::Mutex`
//! critical section with no `.await`, so completion, cancellation and the
//! safety timer cannot both win. All terminal transitions share one cleanup
//! path: clear the timer, cancel the work, kill tracked processes, deny
//! pending approvals, append `done` (which closes subscriber streams).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::bus::{JobEventBus, JobEvents, Subscription};
use super::model::{Event, EventKind, Job, JobStatus};
use super::store::JobStore;
use crate::approval::ApprovalService;
use crate::error::{AgentError, JobError};
use crate::metrics::{JOBS_CREATED, JOBS_FINISHED, JOBS_RUNNING};
use crate::process::ProcessRegistry;

/// Everything a job's unit of work gets to see.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub input: Value,
    pub session_id: Option<String>,
    pub events: JobEvents,
    pub cancel: CancellationToken,
    pub processes: ProcessRegistry,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The unit of work a running job executes (the Agent Loop in production).
#[async_trait]
pub trait JobWork: Send + Sync {
    /// Reject malformed input before a job is created.
    fn validate(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Run to completion; the returned value becomes the `done` event's `result`.
    async fn run(&self, ctx: JobContext) -> Result<Value, AgentError>;
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
    task: Option<JoinHandle<()>>,
    /// Set once the work future has produced its result
    work_settled: Arc<AtomicBool>,
}

struct Inner {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    bus: JobEventBus,
    store: Arc<dyn JobStore>,
    processes: ProcessRegistry,
    approvals: ApprovalService,
    work: Arc<dyn JobWork>,
}

/// Owner of all jobs; cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        processes: ProcessRegistry,
        approvals: ApprovalService,
        work: Arc<dyn JobWork>,
    ) -> Self {
        let bus = JobEventBus::new(Arc::clone(&store));
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                bus,
                store,
                processes,
                approvals,
                work,
            }),
        }
    }

    /// Reload persisted jobs. Jobs a previous process left running can never
    /// resume and are closed out as errors; pending jobs stay startable.
    pub fn restore(&self) -> Result<usize, JobError> {
        let jobs = self.inner.store.load_jobs()?;
        let mut table = self.lock_jobs();
        let mut restored = 0;

        for mut job in jobs {
            let events = self.inner.store.load_events(job.id)?;
            self.inner.bus.restore(job.id, events);

            if job.status == JobStatus::Running {
                warn!(job_id = %job.id, status = %job.status, "closing job interrupted by restart");
                job.status = JobStatus::Error;
                job.finished_at = Some(Utc::now());
                self.persist(&job);
                self.inner.bus.append(
                    job.id,
                    EventKind::Error,
                    Some(json!({"kind": "internal", "message": "interrupted by restart"})),
                );
                self.inner.bus.append(
                    job.id,
                    EventKind::Done,
                    Some(json!({"status": JobStatus::Error})),
                );
            }

            table.insert(
                job.id,
                JobEntry {
                    job,
                    cancel: CancellationToken::new(),
                    timer: None,
                    task: None,
                    work_settled: Arc::new(AtomicBool::new(false)),
                },
            );
            restored += 1;
        }
        Ok(restored)
    }

    pub fn bus(&self) -> &JobEventBus {
        &self.inner.bus
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.inner.approvals
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.inner.processes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Allocate a pending job.
    pub fn create(&self, input: Value, timeout_ms: Option<u64>) -> Result<Job, JobError> {
        self.inner.work.validate(&input).map_err(JobError::Validation)?;
        if timeout_ms == Some(0) {
            return Err(JobError::Validation("timeout_ms must be positive".to_string()));
        }

        let session_id = input
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let job = Job::new(input, timeout_ms, session_id);

        self.inner.store.save_job(&job)?;
        self.inner.bus.open(job.id);
        self.lock_jobs().insert(
            job.id,
            JobEntry {
                job: job.clone(),
                cancel: CancellationToken::new(),
                timer: None,
                task: None,
                work_settled: Arc::new(AtomicBool::new(false)),
            },
        );

        JOBS_CREATED
            .with_label_values(&[if job.session_id.is_some() { "yes" } else { "no" }])
            .inc();
        info!(job_id = %job.id, timeout_ms = ?timeout_ms, "job created");
        Ok(job)
    }

    /// Move a pending job to running and launch its work.
    pub fn start(&self, id: Uuid) -> Result<Job, JobError> {
        let mut jobs = self.lock_jobs();
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if entry.job.status != JobStatus::Pending {
            return Err(JobError::InvalidState {
                id,
                status: entry.job.status,
                expected: "pending",
            });
        }

        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        self.persist(&entry.job);
        self.inner.bus.append(
            id,
            EventKind::JobStarted,
            Some(json!({"timeout_ms": entry.job.timeout_ms})),
        );
        JOBS_RUNNING.inc();

        if let Some(ms) = entry.job.timeout_ms {
            let manager = self.clone();
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                // Work woken by the same timer tick runs before the check
                tokio::task::yield_now().await;
                manager.on_timeout(id);
            }));
        }

        let ctx = JobContext {
            job_id: id,
            input: entry.job.input.clone(),
            session_id: entry.job.session_id.clone(),
            events: self.inner.bus.emitter(id),
            cancel: entry.cancel.clone(),
            processes: self.inner.processes.clone(),
        };
        let work = Arc::clone(&self.inner.work);
        let settled = Arc::clone(&entry.work_settled);
        let manager = self.clone();
        let span = info_span!("agent_job", job_id = %id);
        entry.task = Some(tokio::spawn(
            async move {
                let result = AssertUnwindSafe(work.run(ctx)).catch_unwind().await;
                settled.store(true, Ordering::SeqCst);
                let outcome = result.unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "job work panicked".to_string());
                    Err(AgentError::Internal(message))
                });
                manager.on_settled(id, outcome);
            }
            .instrument(span),
        ));

        info!(job_id = %id, "job started");
        Ok(entry.job.clone())
    }

    /// Cancel a pending or running job.
    pub fn cancel(&self, id: Uuid) -> Result<Job, JobError> {
        let mut jobs = self.lock_jobs();
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if entry.job.status.is_terminal() {
            return Err(JobError::InvalidState {
                id,
                status: entry.job.status,
                expected: "pending or running",
            });
        }

        self.finish(entry, JobStatus::Cancelled, Some(EventKind::JobCancelled), Value::Null);
        info!(job_id = %id, "job cancelled");
        Ok(entry.job.clone())
    }

    /// Current snapshot of a job.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock_jobs().get(&id).map(|e| e.job.clone())
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock_jobs().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Replay-then-live subscription to a job's events.
    pub fn subscribe(&self, id: Uuid) -> Option<Subscription> {
        self.inner.bus.subscribe(id)
    }

    pub fn events(&self, id: Uuid) -> Vec<Event> {
        self.inner.bus.events(id)
    }

    /// Resolve a pending approval belonging to job `id`.
    pub fn respond_approval(&self, id: Uuid, token_id: &str, approved: bool) -> Result<bool, JobError> {
        if !self.lock_jobs().contains_key(&id) {
            return Err(JobError::NotFound(id));
        }
        Ok(self.inner.approvals.handle_response_for_job(id, token_id, approved))
    }

    /// Administrative removal of a terminal job and its log.
    pub fn purge(&self, id: Uuid) -> Result<(), JobError> {
        let mut jobs = self.lock_jobs();
        let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        if !entry.job.status.is_terminal() {
            return Err(JobError::InvalidState {
                id,
                status: entry.job.status,
                expected: "a terminal status",
            });
        }
        jobs.remove(&id);
        self.inner.bus.purge(id);
        self.inner.store.purge(id)?;
        info!(job_id = %id, "job purged");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Completion callback from the job's task.
    fn on_settled(&self, id: Uuid, outcome: Result<Value, AgentError>) {
        let mut jobs = self.lock_jobs();
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };
        if entry.job.status != JobStatus::Running {
            // Cancelled or timed out first
            return;
        }
        // The task is finishing on its own
        entry.task = None;

        match outcome {
            Ok(result) => {
                self.finish(entry, JobStatus::Done, None, json!({"result": result}));
                info!(job_id = %id, "job done");
            }
            Err(AgentError::Cancelled) => {
                self.finish(entry, JobStatus::Cancelled, Some(EventKind::JobCancelled), Value::Null);
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "job failed");
                self.inner.bus.append(
                    id,
                    EventKind::Error,
                    Some(json!({"kind": e.kind(), "message": e.to_string()})),
                );
                self.finish(entry, JobStatus::Error, None, json!({"error": e.to_string()}));
            }
        }
    }

    /// Safety timer callback.
    ///
    /// Runs one scheduler turn after the deadline. If the work has produced
    /// its result by then, completion wins even though its callback has not
    /// taken the lock yet.
    fn on_timeout(&self, id: Uuid) {
        let mut jobs = self.lock_jobs();
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };
        if entry.job.status != JobStatus::Running {
            return;
        }
        if entry.work_settled.load(Ordering::SeqCst) {
            tracing::debug!(job_id = %id, "timer fired after work settled, completion wins");
            return;
        }
        // Timer task is the caller; nothing to abort
        entry.timer = None;
        self.finish(entry, JobStatus::Timeout, Some(EventKind::JobTimeout), Value::Null);
        warn!(job_id = %id, timeout_ms = ?entry.job.timeout_ms, "job timed out");
    }

    /// Shared terminal path. Caller holds the jobs lock and has checked the
    /// current status.
    fn finish(&self, entry: &mut JobEntry, status: JobStatus, marker: Option<EventKind>, extra: Value) {
        let id = entry.job.id;
        let was_running = entry.job.status == JobStatus::Running;

        entry.job.status = status;
        entry.job.finished_at = Some(Utc::now());
        self.persist(&entry.job);

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.cancel.cancel();
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        self.inner.processes.kill_job_processes(id);
        self.inner.approvals.deny_all_for_job(id);

        if let Some(kind) = marker {
            self.inner.bus.append(id, kind, Some(json!({})));
        }
        let mut done = json!({"status": status});
        if let (Value::Object(done_map), Value::Object(extra_map)) = (&mut done, extra) {
            done_map.extend(extra_map);
        }
        self.inner.bus.append(id, EventKind::Done, Some(done));

        if was_running {
            JOBS_RUNNING.dec();
        }
        JOBS_FINISHED.with_label_values(&[status.as_str()]).inc();
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = self.inner.store.save_job(job) {
            warn!(job_id = %job.id, error = %e, "failed to persist job");
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        // A panic while holding the lock leaves the map itself consistent
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
