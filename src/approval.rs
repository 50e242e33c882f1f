//! Approval Service - token-based human-in-the-loop gate
//!
//! ```text
//! AgentLoop ──create_request(job)──► token ──► approval.request event
//!     │                                              │
//!     └── wait(timeout) ◄── handle_response(token) ◄─┘  POST /jobs/:id/approval
//!              │
//!              └── timeout ──► false (deny)
//! ```
//!
//! Each token resolves exactly once. Resolution, whichever side wins, removes
//! the token from the pending table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::metrics::APPROVALS;

/// Public view of a pending approval.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub token_id: String,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
}

struct Pending {
    request: ApprovalRequest,
    responder: oneshot::Sender<bool>,
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

/// Owner of all in-flight approval tokens.
#[derive(Clone, Default)]
pub struct ApprovalService {
    pending: PendingTable,
}

/// Handle returned to the requester; the token can be published before waiting.
pub struct ApprovalHandle {
    token_id: String,
    receiver: oneshot::Receiver<bool>,
    pending: PendingTable,
}

impl ApprovalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new approval token for `job_id`.
    pub fn create_request(&self, job_id: Uuid) -> ApprovalHandle {
        let token_id = Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();
        let request = ApprovalRequest {
            token_id: token_id.clone(),
            job_id,
            created_at: Utc::now(),
            timeout_ms: None,
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(token_id.clone(), Pending { request, responder });
        }
        tracing::debug!(job_id = %job_id, token_id = %token_id, "approval requested");

        ApprovalHandle {
            token_id,
            receiver,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Resolve a pending token. Unknown or already-resolved tokens return false.
    pub fn handle_response(&self, token_id: &str, approved: bool) -> bool {
        let entry = match self.pending.lock() {
            Ok(mut pending) => pending.remove(token_id),
            Err(_) => None,
        };
        match entry {
            Some(entry) => {
                tracing::info!(
                    job_id = %entry.request.job_id,
                    token_id = %token_id,
                    approved,
                    "approval resolved"
                );
                entry.responder.send(approved).is_ok()
            }
            None => false,
        }
    }

    /// Like [`handle_response`](Self::handle_response) but only for tokens of `job_id`.
    pub fn handle_response_for_job(&self, job_id: Uuid, token_id: &str, approved: bool) -> bool {
        let belongs = self
            .pending
            .lock()
            .map(|p| p.get(token_id).is_some_and(|e| e.request.job_id == job_id))
            .unwrap_or(false);
        belongs && self.handle_response(token_id, approved)
    }

    /// Deny every pending token of a job (used on cancellation).
    pub fn deny_all_for_job(&self, job_id: Uuid) -> usize {
        let drained: Vec<Pending> = match self.pending.lock() {
            Ok(mut pending) => {
                let tokens: Vec<String> = pending
                    .iter()
                    .filter(|(_, e)| e.request.job_id == job_id)
                    .map(|(t, _)| t.clone())
                    .collect();
                tokens.iter().filter_map(|t| pending.remove(t)).collect()
            }
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(false);
        }
        count
    }

    /// Pending approvals for a job, oldest first.
    pub fn pending_for_job(&self, job_id: Uuid) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .map(|p| {
                p.values()
                    .filter(|e| e.request.job_id == job_id)
                    .map(|e| e.request.clone())
                    .collect()
            })
            .unwrap_or_default();
        requests.sort_by_key(|r| r.created_at);
        requests
    }
}

impl ApprovalHandle {
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Wait for a response; elapsed timeout counts as a denial.
    pub async fn wait(self, timeout: Duration) -> bool {
        let ApprovalHandle {
            token_id,
            receiver,
            pending,
        } = self;

        if let Ok(mut table) = pending.lock() {
            if let Some(entry) = table.get_mut(&token_id) {
                entry.request.timeout_ms = Some(timeout.as_millis() as u64);
            }
        }

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(approved)) => {
                APPROVALS
                    .with_label_values(&[if approved { "approved" } else { "denied" }])
                    .inc();
                approved
            }
            // Sender dropped without answering
            Ok(Err(_)) => {
                APPROVALS.with_label_values(&["denied"]).inc();
                false
            }
            Err(_) => {
                APPROVALS.with_label_values(&["timeout"]).inc();
                tracing::info!(token_id = %token_id, ?timeout, "approval timed out, denying");
                false
            }
        };

        // A timed-out token must not be resolvable afterwards
        if let Ok(mut table) = pending.lock() {
            table.remove(&token_id);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_to_false() {
        let service = ApprovalService::new();
        let handle = service.create_request(Uuid::now_v7());
        let token = handle.token_id().to_string();

        assert!(!handle.wait(Duration::from_millis(500)).await);
        // Late response is a no-op
        assert!(!service.handle_response(&token, true));
    }

    #[tokio::test]
    async fn test_response_before_timeout() {
        let service = ApprovalService::new();
        let job = Uuid::now_v7();
        let handle = service.create_request(job);
        let token = handle.token_id().to_string();

        let responder = service.clone();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(responder.handle_response(&t, true));
        });

        assert!(handle.wait(Duration::from_secs(5)).await);
        assert!(!service.handle_response(&token, false), "resolves once");
    }

    #[tokio::test]
    async fn test_response_with_false() {
        let service = ApprovalService::new();
        let handle = service.create_request(Uuid::now_v7());
        assert!(service.handle_response(handle.token_id(), false));
        assert!(!handle.wait(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_unknown_token_is_noop() {
        let service = ApprovalService::new();
        assert!(!service.handle_response("nope", true));
    }

    #[tokio::test]
    async fn test_job_scoping_and_deny_all() {
        let service = ApprovalService::new();
        let job_a = Uuid::now_v7();
        let job_b = Uuid::now_v7();
        let a = service.create_request(job_a);
        let b = service.create_request(job_b);

        assert!(!service.handle_response_for_job(job_b, a.token_id(), true));
        assert_eq!(service.pending_for_job(job_a).len(), 1);

        assert_eq!(service.deny_all_for_job(job_a), 1);
        assert!(!a.wait(Duration::from_secs(5)).await);
        assert!(service.handle_response_for_job(job_b, b.token_id(), true));
        assert!(b.wait(Duration::from_secs(5)).await);
    }
}
