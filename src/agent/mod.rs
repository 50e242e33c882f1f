//! Agent module - the reasoning/acting cycle a job runs
//!
//! # Architecture
//!
//! ```text
//! JobManager.start → AgentLoop.run(JobContext)
//!                  ↓
//!           GuardrailService.check_input(newest user message)
//!                  ↓
//!           LlmService.chat (provider → fallbacks) with tool catalogue
//!                  ↓
//!           no tool calls → check_output → Ok(content)
//!                  ↓
//!           per tool call: check_tool_call → approval? → ToolRegistry | McpRegistry
//!                  ↓
//!           tool.start → tool.output* → tool.end, result fed back → next step
//!                  ↓
//!           step budget exhausted → forced stop
//! ```

pub mod controller;
pub mod input;
pub mod sessions;

pub use controller::{AgentConfig, AgentLoop, DEFAULT_SYSTEM_PROMPT};
pub use input::AgentInput;
pub use sessions::{is_valid_session_id, Session, SessionStore};
