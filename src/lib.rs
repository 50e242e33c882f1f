//! agentjobs - autonomous agent jobs behind an HTTP API
//!
//! A client submits a natural-language instruction as a job. The job drives
//! an LLM through a call/act/observe loop, executing tools (local functions,
//! sandboxed shell commands, or external MCP servers) under guardrails and
//! optional human approval, while streaming progress as Server-Sent Events.
//!
//! # Modules
//!
//! - `jobs` - job state machines, event log, live fan-out
//! - `agent` - the Agent Loop and conversation sessions
//! - `llm` - chat providers with ordered fallback
//! - `tools` - tool trait, schema descriptor, registry, built-ins
//! - `mcp` - stdio JSON-RPC client for external tool servers
//! - `guardrail` - deterministic policy checks
//! - `approval` - token-based human-in-the-loop gate
//! - `process` - child processes tracked per job
//! - `api` - axum job-control API
//! - `config`, `tracing`, `metrics` - ambient service plumbing
//!
//! # Quick Start
//!
//! ```ignore
//! use agentjobs::{AppContext, ServiceConfig};
//!
//! let app = AppContext::build(ServiceConfig::load()?)?;
//! let job = app.jobs.create(serde_json::json!({"message": "What time is it?"}), Some(30_000))?;
//! app.jobs.start(job.id)?;
//! ```

pub mod agent;
pub mod api;
pub mod app;
pub mod approval;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod jobs;
pub mod llm;
pub mod mcp;
pub mod metrics;
pub mod process;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentLoop};
pub use app::AppContext;
pub use config::ServiceConfig;
pub use jobs::{Job, JobManager, JobStatus};
