//! Tool trait and types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::schema::ParamSchema;
use crate::error::ToolError;
use crate::jobs::{EventKind, JobEvents};
use crate::llm::ToolDefinition;
use crate::process::ProcessRegistry;

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: Value::String(text.into()),
            duration,
        }
    }

    /// The result as the content of a tool message.
    pub fn as_message_content(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// What a tool invocation can see of the job it runs for.
#[derive(Clone)]
pub struct ToolContext {
    pub job_id: Uuid,
    pub call_id: String,
    pub cancel: CancellationToken,
    pub processes: ProcessRegistry,
    events: Option<JobEvents>,
    streamed: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(
        job_id: Uuid,
        call_id: impl Into<String>,
        cancel: CancellationToken,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            job_id,
            call_id: call_id.into(),
            cancel,
            processes,
            events: None,
            streamed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stream `tool.output` events to the job's log.
    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// A context not attached to any job (tests, ad-hoc calls).
    pub fn detached() -> Self {
        Self::new(Uuid::nil(), "call_detached", CancellationToken::new(), ProcessRegistry::new())
    }

    /// Emit one chunk of incremental output as a `tool.output` event.
    pub fn stream_output(&self, chunk: impl Into<String>) {
        self.streamed.store(true, Ordering::Relaxed);
        if let Some(events) = &self.events {
            events.emit(EventKind::ToolOutput, Value::String(chunk.into()));
        }
    }

    /// Whether the tool produced its own `tool.output` events.
    pub fn has_streamed(&self) -> bool {
        self.streamed.load(Ordering::Relaxed)
    }
}

/// Trait for tools that the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Parameter descriptor; validates arguments and exports the JSON Schema.
    fn parameters(&self) -> ParamSchema;

    /// Execute with arguments already validated against [`Tool::parameters`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    /// Whether a human must approve each invocation.
    fn requires_approval(&self) -> bool {
        false
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().to_json_schema(),
        }
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

/// Extract an optional string parameter.
pub fn optional_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(|v| v.as_str())
}
