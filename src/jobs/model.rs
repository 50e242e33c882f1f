//! Job and event records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// ```text
/// pending ──start──► running ──┬─ complete ─► done
///    │                         ├─ cancel ───► cancelled
///    └───── cancel ──► cancelled├─ timer ────► timeout
///                              └─ failure ──► error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Cancelled,
    Timeout,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Cancelled | JobStatus::Timeout | JobStatus::Error
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of agent work submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Job {
    pub fn new(input: Value, timeout_ms: Option<u64>, session_id: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            timeout_ms,
            input,
            session_id,
        }
    }
}

/// Kind of a job event, serialized as its wire name (`tool.start`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.timeout")]
    JobTimeout,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "plan.update")]
    PlanUpdate,
    #[serde(rename = "tool.start")]
    ToolStart,
    #[serde(rename = "tool.output")]
    ToolOutput,
    #[serde(rename = "tool.end")]
    ToolEnd,
    #[serde(rename = "tool.refused")]
    ToolRefused,
    #[serde(rename = "approval.request")]
    ApprovalRequest,
    #[serde(rename = "approval.response")]
    ApprovalResponse,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "guardrail")]
    Guardrail,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "done")]
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobStarted => "job.started",
            EventKind::JobCancelled => "job.cancelled",
            EventKind::JobTimeout => "job.timeout",
            EventKind::Plan => "plan",
            EventKind::PlanUpdate => "plan.update",
            EventKind::ToolStart => "tool.start",
            EventKind::ToolOutput => "tool.output",
            EventKind::ToolEnd => "tool.end",
            EventKind::ToolRefused => "tool.refused",
            EventKind::ApprovalRequest => "approval.request",
            EventKind::ApprovalResponse => "approval.response",
            EventKind::Memory => "memory",
            EventKind::Guardrail => "guardrail",
            EventKind::Error => "error",
            EventKind::Done => "done",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the job's log, starting at 1
    pub id: u64,
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Strictly increasing within a job
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        for s in [
            JobStatus::Done,
            JobStatus::Cancelled,
            JobStatus::Timeout,
            JobStatus::Error,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event {
            id: 3,
            job_id: Uuid::now_v7(),
            kind: EventKind::ToolOutput,
            ts: Utc::now(),
            data: Some(serde_json::json!("hi")),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool.output");
        assert_eq!(json["data"], "hi");
        assert_eq!(
            serde_json::to_value(EventKind::ApprovalRequest).unwrap(),
            EventKind::ApprovalRequest.as_str()
        );
    }

    #[test]
    fn test_job_serialization_skips_unset() {
        let job = Job::new(serde_json::json!({"message": "hi"}), None, None);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(!json.contains("started_at"));
        assert!(!json.contains("session_id"));
    }
}
