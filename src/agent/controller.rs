//! Agent Loop - the call/act/observe cycle a running job executes
//!
//! The loop drives the LLM Service with the conversation and the tool
//! catalogue, checks every step with the Guardrail Service, gates tools on
//! the Approval Service, and runs them through the Tool Registry (local) or
//! the MCP Registry (delegated). Everything it does is reported as job events.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::input::AgentInput;
use super::sessions::SessionStore;
use crate::approval::ApprovalService;
use crate::error::{AgentError, GuardrailViolation, ToolError};
use crate::guardrail::GuardrailService;
use crate::jobs::{EventKind, JobContext, JobEvents, JobWork};
use crate::llm::{ChatMessage, LlmRoute, LlmService, Role, ToolCall, ToolDefinition};
use crate::mcp::McpRegistry;
use crate::metrics::{GUARDRAIL_VIOLATIONS, TOOL_CALLS};
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};

/// System prompt used when neither the job nor the config supplies one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that completes tasks by \
calling the tools you are given. Call a tool whenever it helps; when the task is complete, \
reply with the final answer and no tool calls.";

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of steps (LLM calls) before a forced stop
    pub max_steps: usize,
    /// How long an approval-gated tool call waits before counting as denied
    pub approval_timeout_ms: u64,
    /// Tool names gated on approval in addition to tools that ask for it
    pub approval_tools: Vec<String>,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            approval_timeout_ms: 300_000,
            approval_tools: Vec::new(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

/// Where an accepted tool call is executed.
enum ToolTarget {
    Local,
    Mcp { server: String, tool: String },
}

/// Tools one job may call.
struct ToolScope {
    local: Option<Vec<String>>,
    servers: Vec<String>,
}

impl ToolScope {
    fn allows_local(&self, name: &str) -> bool {
        self.local
            .as_ref()
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(true)
    }
}

/// The Agent Loop; the unit of work every job runs.
pub struct AgentLoop {
    llm: Arc<LlmService>,
    tools: Arc<ToolRegistry>,
    mcp: Arc<McpRegistry>,
    guardrails: Arc<GuardrailService>,
    approvals: ApprovalService,
    sessions: Arc<SessionStore>,
    config: AgentConfig,
}

impl AgentLoop {
    /// Create a new agent loop
    ///
    /// # Arguments
    /// * `llm` - provider fallback service for chat turns
    /// * `tools` - local tools
    /// * `mcp` - external tool servers
    /// * `guardrails` - input/output/tool-call policy checks
    /// * `approvals` - the same service the Job Manager resolves tokens on
    /// * `sessions` - conversation history for jobs with a `session_id`
    /// * `config` - step budget, approval policy, system prompt
    pub fn new(
        llm: Arc<LlmService>,
        tools: Arc<ToolRegistry>,
        mcp: Arc<McpRegistry>,
        guardrails: Arc<GuardrailService>,
        approvals: ApprovalService,
        sessions: Arc<SessionStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            mcp,
            guardrails,
            approvals,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn route(&self, input: &AgentInput) -> LlmRoute {
        let defaults = self.llm.config();
        LlmRoute {
            provider: input.provider.unwrap_or(defaults.provider),
            fallback_order: input
                .fallback_order
                .clone()
                .unwrap_or_else(|| defaults.fallback_order.clone()),
            model: input.model.clone().or_else(|| defaults.model.clone()),
        }
    }

    fn scope(&self, input: &AgentInput) -> ToolScope {
        ToolScope {
            local: input.tools.clone(),
            servers: input
                .mcp_servers
                .clone()
                .unwrap_or_else(|| self.mcp.server_ids()),
        }
    }

    async fn catalogue(&self, scope: &ToolScope) -> Vec<ToolDefinition> {
        let mut defs = self.tools.tool_definitions(scope.local.as_deref());
        defs.extend(self.mcp.tool_definitions(&scope.servers).await);
        defs
    }

    fn requires_approval(&self, name: &str, target: &ToolTarget) -> bool {
        let local = matches!(target, ToolTarget::Local) && self.tools.requires_approval(name);
        local || self.config.approval_tools.iter().any(|t| t == name)
    }

    fn resolve(&self, name: &str, scope: &ToolScope) -> Option<ToolTarget> {
        if self.tools.has(name) && scope.allows_local(name) {
            return Some(ToolTarget::Local);
        }
        let (server, tool) = self.mcp.resolve(name)?;
        scope
            .servers
            .contains(&server)
            .then_some(ToolTarget::Mcp { server, tool })
    }

    /// Run the loop for one job.
    async fn drive(&self, ctx: &JobContext, input: AgentInput) -> Result<Value, AgentError> {
        let route = self.route(&input);
        let scope = self.scope(&input);
        let max_steps = input.max_steps.unwrap_or(self.config.max_steps);

        let system_prompt = input
            .system
            .clone()
            .or_else(|| self.config.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let mut messages = vec![ChatMessage::system(system_prompt)];

        if let Some(session_id) = &ctx.session_id {
            let history = self
                .sessions
                .history(session_id)
                .map_err(|e| AgentError::Internal(format!("failed to load session: {}", e)))?;
            debug!(job_id = %ctx.job_id, session_id = %session_id, messages = history.len(), "resuming session");
            messages.extend(history);
        }
        let first_new = messages.len();
        push_message(&mut messages, &ctx.events, ChatMessage::user(input.message.clone()));

        let tools = until_cancelled(&ctx.cancel, self.catalogue(&scope)).await?;
        info!(
            job_id = %ctx.job_id,
            provider = %route.provider,
            tools = tools.len(),
            max_steps,
            "agent loop started"
        );

        for step in 1..=max_steps {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let prompt = latest_user_content(&messages);
            if let Err(violation) = self.guardrails.check_input(prompt) {
                return Err(report_violation(&ctx.events, violation));
            }

            let response = until_cancelled(&ctx.cancel, self.llm.chat(&route, &messages, &tools))
                .await??;
            debug!(
                job_id = %ctx.job_id,
                step,
                provider = %response.provider,
                tool_calls = response.tool_calls.len(),
                "LLM responded"
            );

            let tool_calls = response.tool_calls.clone();
            push_message(
                &mut messages,
                &ctx.events,
                ChatMessage::assistant_with_tools(response.content.clone(), tool_calls.clone()),
            );

            if tool_calls.is_empty() {
                if let Err(violation) = self.guardrails.check_output(&response.content) {
                    return Err(report_violation(&ctx.events, violation));
                }
                info!(job_id = %ctx.job_id, steps = step, "agent task completed");
                self.save_session(ctx, &messages[first_new..]);
                return Ok(Value::String(response.content));
            }

            ctx.events.emit(
                EventKind::Plan,
                json!({
                    "step": step,
                    "tool_calls": tool_calls
                        .iter()
                        .map(|c| json!({"call_id": c.id, "tool": c.name, "args": c.arguments}))
                        .collect::<Vec<_>>(),
                }),
            );

            for call in &tool_calls {
                let content = self.handle_tool_call(ctx, &scope, call).await?;
                push_message(
                    &mut messages,
                    &ctx.events,
                    ChatMessage::tool(call.id.clone(), call.name.clone(), content),
                );
            }

            ctx.events.emit(
                EventKind::PlanUpdate,
                json!({"step": step, "completed": tool_calls.len()}),
            );
        }

        warn!(job_id = %ctx.job_id, max_steps, "step budget exhausted, forcing stop");
        ctx.events.emit(
            EventKind::PlanUpdate,
            json!({"step": max_steps, "forced_stop": true}),
        );
        self.save_session(ctx, &messages[first_new..]);
        Ok(Value::String(format!(
            "Stopped after {} steps without a final answer",
            max_steps
        )))
    }

    /// Check, gate and run one tool call; returns the tool message content.
    ///
    /// Only cancellation is an error here. Refusals, denials and handler
    /// failures become error text the model sees on its next step.
    async fn handle_tool_call(
        &self,
        ctx: &JobContext,
        scope: &ToolScope,
        call: &ToolCall,
    ) -> Result<String, AgentError> {
        let events = &ctx.events;

        if let Err(violation) = self.guardrails.check_tool_call(&call.name, &call.arguments) {
            GUARDRAIL_VIOLATIONS
                .with_label_values(&[violation.check.as_str()])
                .inc();
            return Ok(refuse(events, call, &violation.reason));
        }

        let Some(target) = self.resolve(&call.name, scope) else {
            return Ok(refuse(events, call, &format!("unknown tool '{}'", call.name)));
        };

        if self.requires_approval(&call.name, &target) {
            let handle = self.approvals.create_request(ctx.job_id);
            let token_id = handle.token_id().to_string();
            events.emit(
                EventKind::ApprovalRequest,
                json!({
                    "token_id": token_id,
                    "call_id": call.id,
                    "tool": call.name,
                    "args": call.arguments,
                    "timeout_ms": self.config.approval_timeout_ms,
                }),
            );
            info!(job_id = %ctx.job_id, tool = %call.name, token_id = %token_id, "waiting for approval");

            let approved =
                until_cancelled(&ctx.cancel, handle.wait(self.config.approval_timeout())).await?;
            events.emit(
                EventKind::ApprovalResponse,
                json!({"token_id": token_id, "approved": approved}),
            );
            if !approved {
                TOOL_CALLS.with_label_values(&[&call.name, "denied"]).inc();
                return Ok(format!("Error: tool call '{}' was not approved", call.name));
            }
        }

        events.emit(
            EventKind::ToolStart,
            json!({"call_id": call.id, "tool": call.name, "args": call.arguments}),
        );
        let tool_ctx = ToolContext::new(
            ctx.job_id,
            call.id.clone(),
            ctx.cancel.child_token(),
            ctx.processes.clone(),
        )
        .with_events(events.clone());

        let span = info_span!("tool_call", job_id = %ctx.job_id, tool = %call.name, call_id = %call.id);
        let started = Instant::now();
        let result = until_cancelled(
            &ctx.cancel,
            self.execute(&target, call, &tool_ctx).instrument(span),
        )
        .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                if !tool_ctx.has_streamed() {
                    events.emit(EventKind::ToolOutput, output.result.clone());
                }
                events.emit(
                    EventKind::ToolEnd,
                    json!({"call_id": call.id, "tool": call.name, "ok": true, "duration_ms": duration_ms}),
                );
                TOOL_CALLS.with_label_values(&[&call.name, "ok"]).inc();
                Ok(output.as_message_content())
            }
            Err(e) => {
                warn!(job_id = %ctx.job_id, tool = %call.name, error = %e, "tool call failed");
                events.emit(
                    EventKind::ToolEnd,
                    json!({
                        "call_id": call.id,
                        "tool": call.name,
                        "ok": false,
                        "error": e.to_string(),
                        "duration_ms": duration_ms,
                    }),
                );
                TOOL_CALLS.with_label_values(&[&call.name, "error"]).inc();
                Ok(format!("Error: {}", e))
            }
        }
    }

    async fn execute(
        &self,
        target: &ToolTarget,
        call: &ToolCall,
        tool_ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        match target {
            ToolTarget::Local => {
                self.tools
                    .execute(&call.name, call.arguments.clone(), tool_ctx)
                    .await
            }
            ToolTarget::Mcp { server, tool } => {
                let started = Instant::now();
                let text = self
                    .mcp
                    .call_tool(server, tool, call.arguments.clone())
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok(ToolOutput::text(text, started.elapsed()))
            }
        }
    }

    fn save_session(&self, ctx: &JobContext, new_messages: &[ChatMessage]) {
        let Some(session_id) = &ctx.session_id else {
            return;
        };
        if let Err(e) = self.sessions.append(session_id, new_messages) {
            warn!(job_id = %ctx.job_id, session_id = %session_id, error = %e, "failed to save session");
        }
    }
}

#[async_trait]
impl JobWork for AgentLoop {
    fn validate(&self, input: &Value) -> Result<(), String> {
        let input = AgentInput::parse(input)?;
        if let Some(names) = &input.tools {
            if let Some(unknown) = names.iter().find(|n| !self.tools.has(n)) {
                return Err(format!("unknown tool '{}'", unknown));
            }
        }
        if let Some(servers) = &input.mcp_servers {
            let known = self.mcp.server_ids();
            if let Some(unknown) = servers.iter().find(|s| !known.contains(s)) {
                return Err(format!("unknown MCP server '{}'", unknown));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: JobContext) -> Result<Value, AgentError> {
        let input = AgentInput::parse(&ctx.input).map_err(AgentError::Input)?;
        self.drive(&ctx, input).await
    }
}

/// Await `fut` unless the job is cancelled first.
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

fn push_message(messages: &mut Vec<ChatMessage>, events: &JobEvents, message: ChatMessage) {
    events.emit(
        EventKind::Memory,
        serde_json::to_value(&message).unwrap_or(Value::Null),
    );
    messages.push(message);
}

fn latest_user_content(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn report_violation(events: &JobEvents, violation: GuardrailViolation) -> AgentError {
    GUARDRAIL_VIOLATIONS
        .with_label_values(&[violation.check.as_str()])
        .inc();
    warn!(job_id = %events.job_id(), check = %violation.check, reason = %violation.reason, "guardrail violation");
    events.emit(
        EventKind::Guardrail,
        json!({"check": violation.check.as_str(), "reason": violation.reason}),
    );
    AgentError::Guardrail(violation)
}

fn refuse(events: &JobEvents, call: &ToolCall, reason: &str) -> String {
    warn!(job_id = %events.job_id(), tool = %call.name, reason = %reason, "tool call refused");
    TOOL_CALLS.with_label_values(&[&call.name, "refused"]).inc();
    events.emit(
        EventKind::ToolRefused,
        json!({"call_id": call.id, "tool": call.name, "reason": reason}),
    );
    format!("Error: tool call refused: {}", reason)
}
