//! HTTP job-control API
//!
//! ```text
//! POST   /jobs                  create (pending)
//! GET    /jobs                  list, newest first
//! GET    /jobs/:id              snapshot
//! DELETE /jobs/:id              purge a terminal job
//! POST   /jobs/:id/start        pending → running
//! POST   /jobs/:id/cancel       pending|running → cancelled
//! GET    /jobs/:id/events       SSE: history replay, then live, ends after `done`
//! GET    /jobs/:id/approvals    pending approval tokens
//! POST   /jobs/:id/approval     resolve a token {tokenId, approved}
//! GET    /healthz, /metrics
//! ```

use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::approval::ApprovalRequest;
use crate::error::JobError;
use crate::jobs::{Event, EventKind, Job, JobManager, JobStatus, Subscription};
use crate::metrics::{self, SUBSCRIBERS_ACTIVE};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobManager,
    /// Applied to submissions without `timeout_ms`
    pub default_timeout_ms: Option<u64>,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(purge_job))
        .route("/jobs/:id/start", post(start_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/events", get(job_events))
        .route("/jobs/:id/approvals", get(pending_approvals))
        .route("/jobs/:id/approval", post(respond_approval))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound(_) => ApiError::NotFound(e.to_string()),
            JobError::InvalidState { .. } | JobError::Validation(_) => {
                ApiError::BadRequest(e.to_string())
            }
            JobError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => {
                warn!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Unparseable ids can never name a job, so they are reported as unknown.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("Job {} not found", raw)))
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub input: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalResponseRequest {
    #[serde(alias = "token_id", rename = "tokenId")]
    pub token_id: String,
    pub approved: bool,
}

/// Job snapshot without its input.
#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl From<Job> for JobSnapshot {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            timeout_ms: job.timeout_ms,
            session_id: job.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn create_job(
    State(state): State<ApiState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobSnapshot>), ApiError> {
    let Json(req) = body?;
    let timeout_ms = req.timeout_ms.or(state.default_timeout_ms);
    let job = state.jobs.create(req.input, timeout_ms)?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<JobSnapshot>> {
    Json(state.jobs.list().into_iter().map(JobSnapshot::from).collect())
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let id = parse_id(&id)?;
    let job = state.jobs.get(id).ok_or(JobError::NotFound(id))?;
    Ok(Json(job.into()))
}

async fn purge_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.jobs.purge(parse_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state.jobs.start(parse_id(&id)?)?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state.jobs.cancel(parse_id(&id)?)?;
    Ok(Json(job.into()))
}

async fn pending_approvals(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    let id = parse_id(&id)?;
    if state.jobs.get(id).is_none() {
        return Err(JobError::NotFound(id).into());
    }
    Ok(Json(state.jobs.approvals().pending_for_job(id)))
}

async fn respond_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<ApprovalResponseRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let Json(req) = body?;
    let resolved = state.jobs.respond_approval(id, &req.token_id, req.approved)?;
    debug!(job_id = %id, token_id = %req.token_id, approved = req.approved, resolved, "approval response");
    Ok(Json(json!({ "resolved": resolved })))
}

/// Keeps the live-subscriber gauge in step with open streams.
struct SubscriberGuard;

impl SubscriberGuard {
    fn new() -> Self {
        SUBSCRIBERS_ACTIVE.inc();
        SubscriberGuard
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        SUBSCRIBERS_ACTIVE.dec();
    }
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.kind.as_str())
        .id(event.id.to_string())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

async fn job_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let Subscription { history, live } =
        state.jobs.subscribe(id).ok_or(JobError::NotFound(id))?;

    let stream = async_stream::stream! {
        let _guard = SubscriberGuard::new();
        for event in history {
            let done = event.kind == EventKind::Done;
            yield Ok(to_sse(&event));
            if done {
                return;
            }
        }
        if let Some(mut live) = live {
            while let Some(event) = live.recv().await {
                let done = event.kind == EventKind::Done;
                yield Ok(to_sse(&event));
                if done {
                    return;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
