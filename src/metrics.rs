//! Prometheus metrics for job execution
//!
//! All metrics live in the default registry and are exposed as text on
//! `GET /metrics` (see [`render`]).

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Job Lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Jobs accepted by `POST /jobs`.
    pub static ref JOBS_CREATED: CounterVec = register_counter_vec!(
        "agentjobs_jobs_created_total",
        "Jobs created",
        &["session"]
    ).expect("failed to register JOBS_CREATED metric");

    /// Terminal outcomes, one increment per job.
    ///
    /// Labels:
    /// - status: done | cancelled | timeout | error
    pub static ref JOBS_FINISHED: CounterVec = register_counter_vec!(
        "agentjobs_jobs_finished_total",
        "Jobs that reached a terminal status",
        &["status"]
    ).expect("failed to register JOBS_FINISHED metric");

    /// Jobs currently in the running state.
    pub static ref JOBS_RUNNING: Gauge = register_gauge!(
        "agentjobs_jobs_running",
        "Jobs currently running"
    ).expect("failed to register JOBS_RUNNING metric");

    /// Live SSE subscribers across all jobs.
    pub static ref SUBSCRIBERS_ACTIVE: Gauge = register_gauge!(
        "agentjobs_subscribers_active",
        "Live event stream subscribers"
    ).expect("failed to register SUBSCRIBERS_ACTIVE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // LLM Calls
    // ─────────────────────────────────────────────────────────────────────────────

    /// Wall time of a single provider attempt, successful or not.
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "agentjobs_llm_call_duration_seconds",
        "LLM provider call duration",
        &["provider"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Provider attempts that failed and triggered fallback.
    pub static ref LLM_PROVIDER_FAILURES: CounterVec = register_counter_vec!(
        "agentjobs_llm_provider_failures_total",
        "LLM provider attempts that failed",
        &["provider"]
    ).expect("failed to register LLM_PROVIDER_FAILURES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tools, Guardrails, Approvals, MCP
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool invocations.
    ///
    /// Labels:
    /// - tool: tool name as exposed to the model
    /// - outcome: ok | error | refused | denied
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "agentjobs_tool_calls_total",
        "Tool invocations by outcome",
        &["tool", "outcome"]
    ).expect("failed to register TOOL_CALLS metric");

    /// Guardrail rejections by check (input | output | tool_call).
    pub static ref GUARDRAIL_VIOLATIONS: CounterVec = register_counter_vec!(
        "agentjobs_guardrail_violations_total",
        "Guardrail rejections",
        &["check"]
    ).expect("failed to register GUARDRAIL_VIOLATIONS metric");

    /// Approval waits by outcome (approved | denied | timeout).
    pub static ref APPROVALS: CounterVec = register_counter_vec!(
        "agentjobs_approvals_total",
        "Approval requests by outcome",
        &["outcome"]
    ).expect("failed to register APPROVALS metric");

    /// JSON-RPC requests sent to MCP servers.
    pub static ref MCP_REQUESTS: CounterVec = register_counter_vec!(
        "agentjobs_mcp_requests_total",
        "MCP requests by server and outcome",
        &["server", "outcome"]
    ).expect("failed to register MCP_REQUESTS metric");
}

/// Encode the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
