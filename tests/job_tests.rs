//! Integration tests for the Job Manager
//!
//! These drive jobs through every terminal transition with scripted units of
//! work and check the event-log invariants: one `done`, always last.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use agentjobs::approval::ApprovalService;
use agentjobs::error::{AgentError, JobError};
use agentjobs::jobs::{
    Event, EventKind, FileJobStore, JobContext, JobManager, JobStatus, JobStore, JobWork,
    MemoryJobStore,
};
use agentjobs::process::ProcessRegistry;

/// What a scripted job does once started.
#[derive(Clone)]
enum Script {
    /// Sleep, then succeed
    Sleep(Duration),
    /// Spawn `sleep 30` under the job and wait to be cancelled
    SpawnAndHang,
    /// Return an error
    Fail,
    /// Panic inside the work future
    Panic,
    /// Emit a few events, then succeed
    Chatty,
}

struct Scripted(Script);

#[async_trait]
impl JobWork for Scripted {
    fn validate(&self, input: &Value) -> Result<(), String> {
        match input.get("message").and_then(|m| m.as_str()) {
            Some(m) if !m.is_empty() => Ok(()),
            _ => Err("'message' must be a non-empty string".to_string()),
        }
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, AgentError> {
        match &self.0 {
            Script::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(json!("finished"))
            }
            Script::SpawnAndHang => {
                let child = Command::new("sleep")
                    .arg("30")
                    .process_group(0)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| AgentError::Internal(e.to_string()))?;
                let tracked = ctx.processes.register_job_process(ctx.job_id, child);
                let _ = tracked.wait().await;
                Ok(json!("process exited"))
            }
            Script::Fail => Err(AgentError::Internal("boom".to_string())),
            Script::Panic => panic!("work exploded"),
            Script::Chatty => {
                ctx.events.emit(EventKind::Plan, json!({"step": 1}));
                ctx.events.emit(EventKind::ToolOutput, json!("hi"));
                ctx.events.emit(EventKind::PlanUpdate, json!({"step": 1}));
                Ok(json!("said hi"))
            }
        }
    }
}

fn manager(script: Script) -> JobManager {
    manager_with_store(script, Arc::new(MemoryJobStore::new()))
}

fn manager_with_store(script: Script, store: Arc<dyn JobStore>) -> JobManager {
    JobManager::new(
        store,
        ProcessRegistry::new(),
        ApprovalService::new(),
        Arc::new(Scripted(script)),
    )
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Exactly one `done`, and it is the last event.
fn assert_single_done(events: &[Event]) {
    let done = events.iter().filter(|e| e.kind == EventKind::Done).count();
    assert_eq!(done, 1, "events: {:?}", kinds(events));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Done));
    assert!(events.windows(2).all(|w| w[0].ts < w[1].ts && w[0].id < w[1].id));
}

async fn wait_terminal(jobs: &JobManager, id: uuid::Uuid) -> JobStatus {
    for _ in 0..200 {
        if let Some(job) = jobs.get(id) {
            if job.status.is_terminal() {
                return job.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached a terminal status", id);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_scenario() {
    let jobs = manager(Script::Sleep(Duration::from_millis(2000)));
    let job = jobs.create(json!({"message": "hi"}), Some(500)).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    jobs.start(job.id).unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let snapshot = jobs.get(job.id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Timeout);
    assert!(snapshot.finished_at.is_some());

    let events = jobs.events(job.id);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Done);
    assert_eq!(last.data.as_ref().unwrap()["status"], "timeout");

    // The slow work would have finished by now; it must not flip the status
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Timeout);
    let events = jobs.events(job.id);
    assert_eq!(
        kinds(&events),
        vec![EventKind::JobStarted, EventKind::JobTimeout, EventKind::Done]
    );
    assert_single_done(&events);
}

#[tokio::test(start_paused = true)]
async fn test_completion_reports_result() {
    let jobs = manager(Script::Chatty);
    let job = jobs.create(json!({"message": "hi"}), Some(10_000)).unwrap();
    jobs.start(job.id).unwrap();
    assert_eq!(wait_terminal(&jobs, job.id).await, JobStatus::Done);

    let events = jobs.events(job.id);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::JobStarted,
            EventKind::Plan,
            EventKind::ToolOutput,
            EventKind::PlanUpdate,
            EventKind::Done
        ]
    );
    assert_eq!(events[2].data, Some(json!("hi")));
    let done = events.last().unwrap().data.clone().unwrap();
    assert_eq!(done["status"], "done");
    assert_eq!(done["result"], "said hi");

    // The timer was cleared with the transition
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Done);
    assert_single_done(&jobs.events(job.id));
}

#[tokio::test]
async fn test_cancel_running_job_kills_processes() {
    let jobs = manager(Script::SpawnAndHang);
    let job = jobs.create(json!({"message": "hi"}), None).unwrap();
    jobs.start(job.id).unwrap();

    for _ in 0..200 {
        if jobs.processes().count(job.id) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(jobs.processes().count(job.id), 1);

    let cancelled = jobs.cancel(job.id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(jobs.processes().count(job.id), 0);

    let events = jobs.events(job.id);
    assert_eq!(
        kinds(&events),
        vec![EventKind::JobStarted, EventKind::JobCancelled, EventKind::Done]
    );
    assert_eq!(events.last().unwrap().data.as_ref().unwrap()["status"], "cancelled");

    // Terminal states are final
    assert!(matches!(
        jobs.cancel(job.id),
        Err(JobError::InvalidState { status: JobStatus::Cancelled, .. })
    ));
    assert!(matches!(jobs.start(job.id), Err(JobError::InvalidState { .. })));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Cancelled);
    assert_single_done(&jobs.events(job.id));
}

#[tokio::test(start_paused = true)]
async fn test_failure_becomes_error_event() {
    let jobs = manager(Script::Fail);
    let job = jobs.create(json!({"message": "hi"}), None).unwrap();
    jobs.start(job.id).unwrap();
    assert_eq!(wait_terminal(&jobs, job.id).await, JobStatus::Error);

    let events = jobs.events(job.id);
    let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
    assert_eq!(error.data.as_ref().unwrap()["kind"], "internal");
    assert!(error.data.as_ref().unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("boom"));
    assert_single_done(&events);
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_contained() {
    let jobs = manager(Script::Panic);
    let job = jobs.create(json!({"message": "hi"}), None).unwrap();
    jobs.start(job.id).unwrap();
    assert_eq!(wait_terminal(&jobs, job.id).await, JobStatus::Error);

    let events = jobs.events(job.id);
    let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
    assert!(error.data.as_ref().unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("work exploded"));
    assert_single_done(&events);

    // The manager keeps working after a job panicked
    let next = jobs.create(json!({"message": "again"}), None).unwrap();
    assert_eq!(next.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_invalid_input_creates_nothing() {
    let jobs = manager(Script::Sleep(Duration::ZERO));
    assert!(matches!(
        jobs.create(json!({"message": ""}), None),
        Err(JobError::Validation(_))
    ));
    assert!(matches!(
        jobs.create(json!({"message": "hi"}), Some(0)),
        Err(JobError::Validation(_))
    ));
    assert!(jobs.list().is_empty());
    assert!(matches!(
        jobs.start(uuid::Uuid::now_v7()),
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_sees_history_then_live() {
    let jobs = manager(Script::Sleep(Duration::from_millis(100)));
    let job = jobs.create(json!({"message": "hi"}), None).unwrap();
    jobs.start(job.id).unwrap();

    let sub = jobs.subscribe(job.id).unwrap();
    assert_eq!(kinds(&sub.history), vec![EventKind::JobStarted]);
    let mut live = sub.live.unwrap();
    let next = live.recv().await.unwrap();
    assert_eq!(next.kind, EventKind::Done);
    // Channel closes after done
    assert!(live.recv().await.is_none());

    // A late subscriber gets the full log and no live channel
    let late = jobs.subscribe(job.id).unwrap();
    assert_eq!(
        kinds(&late.history),
        vec![EventKind::JobStarted, EventKind::Done]
    );
    assert!(late.live.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_start_and_cancel_race() {
    for _ in 0..20 {
        let jobs = manager(Script::Sleep(Duration::from_millis(5)));
        let job = jobs.create(json!({"message": "hi"}), Some(5)).unwrap();

        let (a, b) = (jobs.clone(), jobs.clone());
        let id = job.id;
        let start = tokio::spawn(async move { a.start(id).is_ok() });
        let cancel = tokio::spawn(async move { b.cancel(id).is_ok() });
        let (_started, cancelled) = (start.await.unwrap(), cancel.await.unwrap());
        assert!(cancelled, "pending and running jobs can always be cancelled");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(jobs.get(id).unwrap().status, JobStatus::Cancelled);
        assert_single_done(&jobs.events(id));
    }
}

#[tokio::test]
async fn test_file_store_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(dir.path()).unwrap());
        let jobs = manager_with_store(Script::Sleep(Duration::from_secs(60)), store);
        let job = jobs.create(json!({"message": "hi"}), None).unwrap();
        jobs.start(job.id).unwrap();
        job.id
        // Dropped while running, as if the process died
    };

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(dir.path()).unwrap());
    let jobs = manager_with_store(Script::Sleep(Duration::ZERO), store);
    assert_eq!(jobs.restore().unwrap(), 1);

    let job = jobs.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    let events = jobs.events(id);
    assert_eq!(
        kinds(&events),
        vec![EventKind::JobStarted, EventKind::Error, EventKind::Done]
    );
    assert_single_done(&events);

    jobs.purge(id).unwrap();
    assert!(jobs.get(id).is_none());
    assert!(matches!(jobs.purge(id), Err(JobError::NotFound(_))));
}
