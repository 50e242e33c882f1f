//! LLM providers and the fallback service
//!
//! - [`types`]: provider-neutral messages, tool calls and definitions
//! - [`provider`]: `LlmProvider` trait, `ProviderKind`, client factory
//! - [`ollama`], [`openai`], [`anthropic`]: wire-format clients
//! - [`service`]: `LlmService` with ordered fallback and a client cache

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod service;
pub mod types;

pub use provider::{
    DefaultProviderFactory, LlmProvider, ProviderFactory, ProviderKind, ProviderSettings,
    DEFAULT_LOCAL_MODEL,
};
pub use service::{LlmConfig, LlmRoute, LlmService};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall, ToolDefinition};
