//! Integration tests for the agent loop
//!
//! A scripted LLM provider stands in for the model, so every test drives the
//! real JobManager → AgentLoop → tools/guardrails/approvals path end to end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use agentjobs::agent::{AgentConfig, AgentLoop, SessionStore};
use agentjobs::approval::ApprovalService;
use agentjobs::error::{JobError, LlmError};
use agentjobs::guardrail::{GuardrailConfig, GuardrailService};
use agentjobs::jobs::{Event, EventKind, JobManager, JobStatus, MemoryJobStore};
use agentjobs::llm::{
    ChatRequest, ChatResponse, LlmConfig, LlmProvider, LlmService, ProviderFactory, ProviderKind,
    ProviderSettings, Role, ToolCall,
};
use agentjobs::mcp::{McpClient, McpRegistry};
use agentjobs::process::ProcessRegistry;
use agentjobs::tools::{ShellConfig, ToolRegistry};

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Replays queued responses, then `fallback` forever.
struct ScriptedLlm {
    replies: Mutex<VecDeque<ChatResponse>>,
    fallback: ChatResponse,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

struct ScriptedFactory {
    llm: Arc<ScriptedLlm>,
    failing: Vec<ProviderKind>,
}

impl ProviderFactory for ScriptedFactory {
    fn create(
        &self,
        kind: ProviderKind,
        _settings: &ProviderSettings,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        if self.failing.contains(&kind) {
            return Err(LlmError::MissingApiKey(kind.to_string()));
        }
        Ok(self.llm.clone())
    }
}

struct Setup {
    replies: Vec<ChatResponse>,
    fallback: ChatResponse,
    failing: Vec<ProviderKind>,
    guardrails: GuardrailConfig,
    agent: AgentConfig,
    mcp: McpRegistry,
    sessions: Arc<SessionStore>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            fallback: ChatResponse::text("done"),
            failing: Vec::new(),
            guardrails: GuardrailConfig::default(),
            agent: AgentConfig::default(),
            mcp: McpRegistry::empty(),
            sessions: Arc::new(SessionStore::in_memory()),
        }
    }
}

struct Harness {
    jobs: JobManager,
    llm: Arc<ScriptedLlm>,
}

impl Harness {
    fn new(setup: Setup) -> Self {
        let llm = Arc::new(ScriptedLlm {
            replies: Mutex::new(setup.replies.into()),
            fallback: setup.fallback,
            requests: Mutex::new(Vec::new()),
        });
        let factory = Arc::new(ScriptedFactory {
            llm: Arc::clone(&llm),
            failing: setup.failing,
        });
        let service = Arc::new(LlmService::new(LlmConfig::default(), factory));

        let mut tools = ToolRegistry::new();
        tools.register_builtin_tools(&ShellConfig::default()).unwrap();

        let approvals = ApprovalService::new();
        let agent = AgentLoop::new(
            service,
            Arc::new(tools),
            Arc::new(setup.mcp),
            Arc::new(GuardrailService::new(setup.guardrails)),
            approvals.clone(),
            setup.sessions,
            setup.agent,
        );
        let jobs = JobManager::new(
            Arc::new(MemoryJobStore::new()),
            ProcessRegistry::new(),
            approvals,
            Arc::new(agent),
        );
        Self { jobs, llm }
    }

    fn submit(&self, input: Value) -> Uuid {
        let job = self.jobs.create(input, Some(30_000)).unwrap();
        self.jobs.start(job.id).unwrap();
        job.id
    }

    async fn run(&self, input: Value) -> (JobStatus, Vec<Event>) {
        let id = self.submit(input);
        let status = self.wait_terminal(id).await;
        (status, self.jobs.events(id))
    }

    async fn wait_terminal(&self, id: Uuid) -> JobStatus {
        for _ in 0..500 {
            if let Some(job) = self.jobs.get(id) {
                if job.status.is_terminal() {
                    return job.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    async fn wait_for(&self, id: Uuid, kind: EventKind) -> Event {
        for _ in 0..500 {
            if let Some(event) = self.jobs.events(id).into_iter().find(|e| e.kind == kind) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never emitted {}", id, kind);
    }
}

fn call(name: &str, args: Value) -> ChatResponse {
    ChatResponse::text("").with_tool_calls(vec![ToolCall::new(name, args)])
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn find(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|e| e.kind == kind).collect()
}

fn data(event: &Event) -> &Value {
    event.data.as_ref().unwrap()
}

fn done_data(events: &[Event]) -> &Value {
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Done);
    data(last)
}

/// Content of the newest tool message the model was sent.
fn last_tool_message(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.content.clone())
        .unwrap()
}

/// An in-process MCP server with one `read` tool, over a duplex pipe.
fn fake_mcp_server(server_id: &str) -> McpClient {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (server_read, mut server_write) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let result = match msg["method"].as_str() {
                Some("tools/list") => json!({"tools": [{
                    "name": "read",
                    "description": "Read a file",
                    "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
                }]}),
                Some("tools/call") => json!({"content": [{
                    "type": "text",
                    "text": format!("contents of {}", msg["params"]["arguments"]["path"].as_str().unwrap_or("?"))
                }]}),
                _ => json!({}),
            };
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
            if server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    McpClient::with_transport(server_id, client_read, client_write, Duration::from_secs(5))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

/// The model calls echo({text:"hi"}); the tool output event carries exactly
/// "hi" and the loop ends on the next reply without tool calls.
#[tokio::test]
async fn test_echo_tool_round_trip() {
    let h = Harness::new(Setup {
        replies: vec![
            call("echo", json!({"text": "hi"})),
            ChatResponse::text("The tool said hi"),
        ],
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "Say hi with the echo tool"})).await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::JobStarted,
            EventKind::Memory,
            EventKind::Memory,
            EventKind::Plan,
            EventKind::ToolStart,
            EventKind::ToolOutput,
            EventKind::ToolEnd,
            EventKind::Memory,
            EventKind::PlanUpdate,
            EventKind::Memory,
            EventKind::Done,
        ]
    );

    let outputs = find(&events, EventKind::ToolOutput);
    assert_eq!(outputs.len(), 1);
    assert_eq!(data(outputs[0]), &json!("hi"));
    assert_eq!(data(find(&events, EventKind::ToolEnd)[0])["ok"], true);
    assert_eq!(done_data(&events)["status"], "done");
    assert_eq!(done_data(&events)["result"], "The tool said hi");

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 2);
    let tool_names: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert!(tool_names.contains(&"echo"));
    assert_eq!(last_tool_message(&requests[1]), "hi");
    let tool_msg = requests[1].messages.last().unwrap();
    assert_eq!(tool_msg.name.as_deref(), Some("echo"));
    assert!(tool_msg.tool_call_id.as_deref().unwrap().starts_with("call_"));
}

#[tokio::test]
async fn test_input_guardrail_blocks_before_llm() {
    let h = Harness::new(Setup {
        guardrails: GuardrailConfig {
            forbidden_terms: vec!["secret".to_string()],
            ..GuardrailConfig::default()
        },
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "Tell me the SeCrEt plan"})).await;
    assert_eq!(status, JobStatus::Error);
    let guardrail = find(&events, EventKind::Guardrail);
    assert_eq!(guardrail.len(), 1);
    assert_eq!(data(guardrail[0])["check"], "input");
    assert_eq!(data(find(&events, EventKind::Error)[0])["kind"], "guardrail");
    assert_eq!(done_data(&events)["status"], "error");
    assert!(h.llm.requests().is_empty());
}

#[tokio::test]
async fn test_output_guardrail_rejects_final_answer() {
    let h = Harness::new(Setup {
        replies: vec![ChatResponse::text("password = hunter2hunter2")],
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "What is the admin password?"})).await;
    assert_eq!(status, JobStatus::Error);
    assert_eq!(data(find(&events, EventKind::Guardrail)[0])["check"], "output");
}

#[tokio::test]
async fn test_dangerous_tool_call_is_refused() {
    let h = Harness::new(Setup {
        replies: vec![
            call("shell", json!({"command": "rm -rf /tmp/data"})),
            ChatResponse::text("I will not do that"),
        ],
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "clean up"})).await;
    assert_eq!(status, JobStatus::Done);
    let refused = find(&events, EventKind::ToolRefused);
    assert_eq!(refused.len(), 1);
    assert_eq!(data(refused[0])["tool"], "shell");
    assert!(find(&events, EventKind::ToolStart).is_empty());
    assert!(find(&events, EventKind::ApprovalRequest).is_empty());

    let requests = h.llm.requests();
    assert!(last_tool_message(&requests[1]).starts_with("Error: tool call refused"));
}

#[tokio::test]
async fn test_unknown_and_disallowed_tools_are_refused() {
    let h = Harness::new(Setup {
        replies: vec![
            ChatResponse::text("").with_tool_calls(vec![
                ToolCall::new("launch_rockets", json!({})),
                ToolCall::new("current_time", json!({})),
            ]),
            ChatResponse::text("ok"),
        ],
        ..Setup::default()
    });

    let (status, events) = h
        .run(json!({"message": "go", "tools": ["echo"]}))
        .await;
    assert_eq!(status, JobStatus::Done);
    let refused = find(&events, EventKind::ToolRefused);
    assert_eq!(refused.len(), 2);
    assert!(data(refused[0])["reason"]
        .as_str()
        .unwrap()
        .contains("unknown tool 'launch_rockets'"));
    assert_eq!(data(refused[1])["tool"], "current_time");

    // Only the allow-listed tool was offered
    let offered: Vec<String> = h.llm.requests()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(offered, vec!["echo"]);
}

#[tokio::test]
async fn test_tool_error_is_fed_back() {
    let h = Harness::new(Setup {
        replies: vec![call("echo", json!({})), ChatResponse::text("sorry")],
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "echo nothing"})).await;
    assert_eq!(status, JobStatus::Done);
    let end = find(&events, EventKind::ToolEnd);
    assert_eq!(data(end[0])["ok"], false);
    assert!(find(&events, EventKind::ToolOutput).is_empty());

    let message = last_tool_message(&h.llm.requests()[1]);
    assert!(message.starts_with("Error:"), "{}", message);
    assert!(message.contains("text"), "{}", message);
}

#[tokio::test]
async fn test_approved_shell_call_streams_output() {
    let h = Harness::new(Setup {
        replies: vec![
            call("shell", json!({"command": "echo approved-run"})),
            ChatResponse::text("ran it"),
        ],
        ..Setup::default()
    });

    let id = h.submit(json!({"message": "run the command"}));
    let request = h.wait_for(id, EventKind::ApprovalRequest).await;
    assert_eq!(data(&request)["tool"], "shell");
    let token = data(&request)["token_id"].as_str().unwrap().to_string();

    let pending = h.jobs.approvals().pending_for_job(id);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].token_id, token);

    // A token is only honoured for the job that issued it
    assert!(!h.jobs.respond_approval(Uuid::now_v7(), &token, true).unwrap_or(false));
    assert!(h.jobs.respond_approval(id, &token, true).unwrap());

    assert_eq!(h.wait_terminal(id).await, JobStatus::Done);
    let events = h.jobs.events(id);
    assert_eq!(data(find(&events, EventKind::ApprovalResponse)[0])["approved"], true);
    let outputs = find(&events, EventKind::ToolOutput);
    assert_eq!(outputs.len(), 1);
    assert_eq!(data(outputs[0]), &json!("approved-run"));
    assert_eq!(done_data(&events)["result"], "ran it");
    assert!(last_tool_message(&h.llm.requests()[1]).contains("approved-run"));
    assert_eq!(h.jobs.processes().count(id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_approval_timeout_denies() {
    let h = Harness::new(Setup {
        replies: vec![
            call("shell", json!({"command": "echo never"})),
            ChatResponse::text("gave up"),
        ],
        agent: AgentConfig {
            approval_timeout_ms: 100,
            ..AgentConfig::default()
        },
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "run it"})).await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(data(find(&events, EventKind::ApprovalResponse)[0])["approved"], false);
    assert!(find(&events, EventKind::ToolStart).is_empty());
    assert_eq!(
        last_tool_message(&h.llm.requests()[1]),
        "Error: tool call 'shell' was not approved"
    );
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let h = Harness::new(Setup {
        replies: vec![call("shell", json!({"command": "echo later"}))],
        ..Setup::default()
    });

    let id = h.submit(json!({"message": "run it"}));
    let request = h.wait_for(id, EventKind::ApprovalRequest).await;
    let token = data(&request)["token_id"].as_str().unwrap().to_string();

    let job = h.jobs.cancel(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(h.jobs.approvals().pending_for_job(id).is_empty());
    assert!(!h.jobs.respond_approval(id, &token, true).unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = h.jobs.events(id);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Done).count(), 1);
    assert_eq!(done_data(&events)["status"], "cancelled");
    assert!(find(&events, EventKind::ToolStart).is_empty());
}

#[tokio::test]
async fn test_step_budget_forces_stop() {
    let h = Harness::new(Setup {
        fallback: call("echo", json!({"text": "again"})),
        ..Setup::default()
    });

    let (status, events) = h
        .run(json!({"message": "loop forever", "max_steps": 2, "system": "be terse"}))
        .await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(
        done_data(&events)["result"],
        "Stopped after 2 steps without a final answer"
    );
    let updates = find(&events, EventKind::PlanUpdate);
    assert_eq!(data(updates.last().unwrap())["forced_stop"], true);

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].messages[0].role, Role::System);
    assert_eq!(requests[0].messages[0].content, "be terse");
}

#[tokio::test]
async fn test_provider_fallback_per_job() {
    let h = Harness::new(Setup {
        replies: vec![ChatResponse::text("from ollama")],
        failing: vec![ProviderKind::OpenAi],
        ..Setup::default()
    });

    let (status, events) = h
        .run(json!({"message": "hi", "provider": "openai", "fallback_order": ["ollama"]}))
        .await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(done_data(&events)["result"], "from ollama");

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "llama3.2:latest");
}

#[tokio::test]
async fn test_all_providers_failing_errors_job() {
    let h = Harness::new(Setup {
        failing: ProviderKind::ALL.to_vec(),
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "hi"})).await;
    assert_eq!(status, JobStatus::Error);
    let error = data(find(&events, EventKind::Error)[0]);
    assert_eq!(error["kind"], "provider");
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("All 1 LLM providers failed"));
}

#[tokio::test]
async fn test_session_history_carries_over() {
    let sessions = Arc::new(SessionStore::in_memory());
    let h = Harness::new(Setup {
        replies: vec![
            ChatResponse::text("Hello Ada"),
            ChatResponse::text("Your name is Ada"),
        ],
        sessions: Arc::clone(&sessions),
        ..Setup::default()
    });

    let (first, _) = h
        .run(json!({"message": "my name is Ada", "session_id": "s1"}))
        .await;
    assert_eq!(first, JobStatus::Done);
    let (second, _) = h
        .run(json!({"message": "what is my name?", "session_id": "s1"}))
        .await;
    assert_eq!(second, JobStatus::Done);

    let requests = h.llm.requests();
    let contents: Vec<&str> = requests[1]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        &contents[1..],
        &["my name is Ada", "Hello Ada", "what is my name?"]
    );

    let session = sessions.load("s1").unwrap().unwrap();
    assert_eq!(session.jobs, 2);
    assert_eq!(session.messages.len(), 4);
}

#[tokio::test]
async fn test_mcp_tool_is_routed_to_its_server() {
    let mut mcp = McpRegistry::empty();
    mcp.insert(fake_mcp_server("files"));
    let h = Harness::new(Setup {
        replies: vec![
            call("files__read", json!({"path": "notes.txt"})),
            ChatResponse::text("read it"),
        ],
        mcp,
        ..Setup::default()
    });

    let (status, events) = h.run(json!({"message": "read my notes"})).await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(
        data(find(&events, EventKind::ToolOutput)[0]),
        &json!("contents of notes.txt")
    );

    let requests = h.llm.requests();
    assert!(requests[0].tools.iter().any(|t| t.name == "files__read"));
    assert_eq!(last_tool_message(&requests[1]), "contents of notes.txt");
}

#[tokio::test]
async fn test_invalid_job_input_is_rejected() {
    let h = Harness::new(Setup::default());
    for input in [
        json!({}),
        json!({"message": ""}),
        json!({"message": "hi", "tools": ["nope"]}),
        json!({"message": "hi", "mcp_servers": ["nope"]}),
        json!({"message": "hi", "provider": 7}),
    ] {
        assert!(
            matches!(h.jobs.create(input.clone(), None), Err(JobError::Validation(_))),
            "accepted {}",
            input
        );
    }
    assert!(h.jobs.list().is_empty());
}
