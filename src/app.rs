//! Process-lifetime service context
//!
//! Every shared service (job table, provider cache, MCP client pool, ...) is
//! constructed here once and handed to its consumers explicitly.
//!
//! ```text
//! ServiceConfig ─► AppContext
//!                   ├─ GuardrailService
//!                   ├─ ToolRegistry (echo, current_time, shell)
//!                   ├─ LlmService ─► ProviderFactory
//!                   ├─ McpRegistry ─► McpClient per server
//!                   ├─ ApprovalService ─┐
//!                   ├─ ProcessRegistry ─┼─► AgentLoop ─► JobManager ─► JobEventBus ─► JobStore
//!                   └─ SessionStore ────┘
//! ```

use std::sync::Arc;

use tracing::info;

use crate::agent::{AgentLoop, SessionStore};
use crate::api::ApiState;
use crate::approval::ApprovalService;
use crate::config::ServiceConfig;
use crate::error::StartupError;
use crate::guardrail::GuardrailService;
use crate::jobs::{FileJobStore, JobManager, JobStore, MemoryJobStore};
use crate::llm::{DefaultProviderFactory, LlmService, ProviderFactory};
use crate::mcp::McpRegistry;
use crate::process::ProcessRegistry;
use crate::tools::ToolRegistry;

pub struct AppContext {
    pub config: ServiceConfig,
    pub jobs: JobManager,
    pub llm: Arc<LlmService>,
    pub tools: Arc<ToolRegistry>,
    pub mcp: Arc<McpRegistry>,
    pub sessions: Arc<SessionStore>,
}

impl AppContext {
    /// Wire the service with real HTTP provider clients.
    pub fn build(config: ServiceConfig) -> Result<Self, StartupError> {
        let factory = Arc::new(DefaultProviderFactory::new(config.llm.request_timeout()));
        Self::with_factory(config, factory)
    }

    /// Wire the service with a custom provider factory.
    pub fn with_factory(
        config: ServiceConfig,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self, StartupError> {
        let (store, sessions): (Arc<dyn JobStore>, SessionStore) = match &config.store.data_dir {
            Some(dir) => (
                Arc::new(FileJobStore::open(dir)?),
                SessionStore::open(dir.join("sessions"))?,
            ),
            None => (Arc::new(MemoryJobStore::new()), SessionStore::in_memory()),
        };
        let sessions = Arc::new(sessions);

        let mut tools = ToolRegistry::new();
        tools.register_builtin_tools(&config.shell)?;
        let tools = Arc::new(tools);

        let llm = Arc::new(LlmService::new(config.llm.clone(), factory));
        let mcp = Arc::new(McpRegistry::new(
            &config.mcp_servers,
            config.mcp.request_timeout(),
        ));
        let guardrails = Arc::new(GuardrailService::new(config.guardrails.clone()));
        let approvals = ApprovalService::new();
        let processes = ProcessRegistry::new();

        let agent = AgentLoop::new(
            Arc::clone(&llm),
            Arc::clone(&tools),
            Arc::clone(&mcp),
            guardrails,
            approvals.clone(),
            Arc::clone(&sessions),
            config.jobs.agent.clone(),
        );
        let jobs = JobManager::new(store, processes, approvals, Arc::new(agent));
        let restored = jobs.restore()?;

        info!(
            provider = %config.llm.provider,
            tools = ?tools.names(),
            mcp_servers = ?mcp.server_ids(),
            persistent = config.store.data_dir.is_some(),
            restored,
            "service context ready"
        );

        Ok(Self {
            config,
            jobs,
            llm,
            tools,
            mcp,
            sessions,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            jobs: self.jobs.clone(),
            default_timeout_ms: self.config.jobs.default_timeout_ms,
        }
    }

    /// Cancel unfinished jobs and stop every MCP server.
    pub async fn shutdown(&self) {
        let mut cancelled = 0;
        for job in self.jobs.list() {
            if !job.status.is_terminal() && self.jobs.cancel(job.id).is_ok() {
                cancelled += 1;
            }
        }
        self.mcp.close_all().await;
        info!(cancelled, "service context shut down");
    }
}
