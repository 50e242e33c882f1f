//! Error types for agentjobs.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::JobStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the Job Manager to API callers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: JobStatus,
        expected: &'static str,
    },

    #[error("Invalid job input: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Which guardrail check rejected the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailCheck {
    Input,
    Output,
    ToolCall,
}

impl GuardrailCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailCheck::Input => "input",
            GuardrailCheck::Output => "output",
            GuardrailCheck::ToolCall => "tool_call",
        }
    }
}

impl std::fmt::Display for GuardrailCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deterministic policy check rejected model input, output or a tool call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{check} guardrail: {reason}")]
pub struct GuardrailViolation {
    pub check: GuardrailCheck,
    pub reason: String,
}

impl GuardrailViolation {
    pub fn new(check: GuardrailCheck, reason: impl Into<String>) -> Self {
        Self {
            check,
            reason: reason.into(),
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} request failed: {reason}")]
    Request { provider: String, reason: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} response could not be parsed: {reason}")]
    Parse { provider: String, reason: String },

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("No API key configured for {0}")]
    MissingApiKey(String),

    #[error("All {attempts} LLM providers failed; last error: {last}")]
    AllProvidersFailed { attempts: usize, last: String },
}

/// Tool lookup, validation and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

/// Stdio JSON-RPC transport errors for external tool servers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("Unknown MCP server: {0}")]
    UnknownServer(String),

    #[error("Failed to spawn MCP server {server}: {reason}")]
    Spawn { server: String, reason: String },

    #[error("Refusing to send {method}: serialized request contains a newline")]
    Framing { method: String },

    #[error("MCP server {0} exited")]
    ServerExited(String),

    #[error("MCP IO error: {0}")]
    Io(String),

    #[error("MCP server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Malformed MCP result: {0}")]
    Parse(String),

    #[error("MCP tool reported an error: {0}")]
    ToolFailed(String),
}

/// Reasons the Agent Loop stops without a successful result.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Guardrail violation: {0}")]
    Guardrail(#[from] GuardrailViolation),

    #[error("LLM error: {0}")]
    Provider(#[from] LlmError),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid job input: {0}")]
    Input(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short machine-readable kind used in `error` event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Guardrail(_) => "guardrail",
            AgentError::Provider(_) => "provider",
            AgentError::Cancelled => "cancelled",
            AgentError::Input(_) => "validation",
            AgentError::Internal(_) => "internal",
        }
    }
}

/// Failures while assembling the service at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job restore failed: {0}")]
    Jobs(#[from] JobError),

    #[error("Tool registration failed: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
