//! MCP stdio client
//!
//! ```text
//!  request(method) ──► id = next_id++ ──► pending[id] = tx ──► stdin: one line
//!                                                                   │
//!  reader task ◄── stdout lines ◄───────────────────────────────────┘
//!     │  parse → pending.remove(id) → tx.send(result)
//!     │  unparseable / unknown id → dropped
//!     └─ EOF → alive = false, every pending tx gets ServerExited
//! ```
//!
//! The process is spawned lazily on first use and re-spawned by the next
//! request after it exits. Each connection is initialized
//! (`initialize` + `notifications/initialized`) before regular requests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, McpServerConfig, McpTool};
use crate::error::McpError;
use crate::metrics::MCP_REQUESTS;
use crate::process::safe_env;

/// Timeout for a single JSON-RPC round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type Responder = oneshot::Sender<Result<Value, McpError>>;

/// Correlation table plus the liveness flag, guarded together so a request
/// can never be registered after the reader has drained the table.
#[derive(Default)]
struct PendingTable {
    alive: bool,
    waiters: HashMap<u64, Responder>,
}

type Pending = Arc<Mutex<PendingTable>>;

struct Connection {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn new<R, W>(server_id: &str, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(PendingTable {
            alive: true,
            waiters: HashMap::new(),
        }));
        let reader = tokio::spawn(read_responses(
            server_id.to_string(),
            reader,
            Arc::clone(&pending),
        ));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            child: Mutex::new(child),
            reader,
        }
    }

    fn is_alive(&self) -> bool {
        self.pending.lock().map(|p| p.alive).unwrap_or(false)
    }

    /// Mark dead and reject everything still waiting.
    fn shut_down(&self, server_id: &str) {
        reject_all(&self.pending, server_id);
        self.reader.abort();
        if let Ok(mut child) = self.child.lock() {
            if let Some(mut child) = child.take() {
                if let Err(e) = child.start_kill() {
                    debug!(server = %server_id, error = %e, "kill MCP server failed");
                }
            }
        }
    }
}

/// Line reader: resolves pending requests by id until EOF.
async fn read_responses<R>(server_id: String, reader: R, pending: Pending)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some((id, outcome)) = protocol::parse_response(&line) else {
                    debug!(server = %server_id, "discarding non-response line");
                    continue;
                };
                let waiter = pending.lock().ok().and_then(|mut p| p.waiters.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(server = %server_id, id, "discarding response for unknown id"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server_id, error = %e, "MCP stdout read failed");
                break;
            }
        }
    }
    info!(server = %server_id, "MCP server exited");
    reject_all(&pending, &server_id);
}

fn reject_all(pending: &Pending, server_id: &str) {
    let waiters = match pending.lock() {
        Ok(mut p) => {
            p.alive = false;
            std::mem::take(&mut p.waiters)
        }
        Err(_) => return,
    };
    for (_, tx) in waiters {
        let _ = tx.send(Err(McpError::ServerExited(server_id.to_string())));
    }
}

/// JSON-RPC client for one external tool server.
pub struct McpClient {
    server_id: String,
    /// `None` for clients built over a fixed transport; those cannot respawn
    config: Option<McpServerConfig>,
    conn: tokio::sync::Mutex<Option<Arc<Connection>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    spawns: AtomicU64,
    closed: AtomicBool,
}

impl McpClient {
    /// A client that launches `config.command` on first use.
    pub fn new(config: McpServerConfig, request_timeout: Duration) -> Self {
        Self {
            server_id: config.id.clone(),
            config: Some(config),
            conn: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            request_timeout,
            spawns: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// A client over an existing byte stream pair (no process, no handshake).
    pub fn with_transport<R, W>(
        server_id: impl Into<String>,
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let server_id = server_id.into();
        let conn = Connection::new(&server_id, reader, writer, None);
        Self {
            server_id,
            config: None,
            conn: tokio::sync::Mutex::new(Some(Arc::new(conn))),
            next_id: AtomicU64::new(1),
            request_timeout,
            spawns: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// How many times the server process has been launched.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        match self.conn.lock().await.as_ref() {
            Some(conn) => conn.pending.lock().map(|p| p.waiters.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Live connection, spawning and initializing one if needed.
    async fn connection(&self) -> Result<Arc<Connection>, McpError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(Arc::clone(conn));
            }
        }
        let Some(config) = &self.config else {
            return Err(McpError::ServerExited(self.server_id.clone()));
        };

        let conn = Arc::new(self.spawn(config)?);
        *slot = Some(Arc::clone(&conn));

        let handshake = async {
            self.request_on(&conn, "initialize", protocol::initialize_params())
                .await?;
            self.notify_on(&conn, "notifications/initialized", json!({}))
                .await
        };
        if let Err(e) = handshake.await {
            warn!(server = %self.server_id, error = %e, "MCP initialize failed");
            conn.shut_down(&self.server_id);
            *slot = None;
            return Err(e);
        }
        Ok(conn)
    }

    fn spawn(&self, config: &McpServerConfig) -> Result<Connection, McpError> {
        let spawn_err = |reason: String| McpError::Spawn {
            server: self.server_id.clone(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env_clear()
            .envs(safe_env())
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".into()))?;

        // Surface server diagnostics in our log
        if let Some(stderr) = child.stderr.take() {
            let server = self.server_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        warn!(mcp_server = %server, "{}", trimmed);
                    }
                }
            });
        }

        self.spawns.fetch_add(1, Ordering::Relaxed);
        info!(server = %self.server_id, command = %config.command, pid = ?child.id(), "spawned MCP server");
        Ok(Connection::new(&self.server_id, stdout, stdin, Some(child)))
    }

    async fn write_line(&self, conn: &Connection, line: &[u8]) -> Result<(), McpError> {
        let mut writer = conn.writer.lock().await;
        writer
            .write_all(line)
            .await
            .map_err(|e| McpError::Io(e.to_string()))?;
        writer.flush().await.map_err(|e| McpError::Io(e.to_string()))
    }

    async fn notify_on(&self, conn: &Connection, method: &str, params: Value) -> Result<(), McpError> {
        let line = protocol::frame_line(method, protocol::notification(method, params).to_string())?;
        self.write_line(conn, &line).await
    }

    async fn request_on(&self, conn: &Connection, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = protocol::frame_line(method, protocol::request(id, method, params).to_string())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = conn
                .pending
                .lock()
                .map_err(|_| McpError::Io("pending table poisoned".into()))?;
            if !pending.alive {
                return Err(McpError::ServerExited(self.server_id.clone()));
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.write_line(conn, &line).await {
            if let Ok(mut pending) = conn.pending.lock() {
                pending.waiters.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ServerExited(self.server_id.clone())),
            Err(_) => {
                if let Ok(mut pending) = conn.pending.lock() {
                    pending.waiters.remove(&id);
                }
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    /// Generic JSON-RPC request.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ServerExited(self.server_id.clone()));
        }
        let conn = self.connection().await?;
        let result = self.request_on(&conn, method, params).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        MCP_REQUESTS
            .with_label_values(&[self.server_id.as_str(), outcome])
            .inc();
        result
    }

    /// Explicit handshake; spawned connections run this automatically.
    pub async fn initialize(&self) -> Result<Value, McpError> {
        let result = self.request("initialize", protocol::initialize_params()).await?;
        let conn = self.connection().await?;
        self.notify_on(&conn, "notifications/initialized", json!({}))
            .await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| McpError::Parse(e.to_string()))
    }

    /// Call a tool; text content blocks are joined with newlines.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        protocol::call_result_text(&result)
    }

    /// Stop the server and reject in-flight requests. Later requests fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(conn) = self.conn.lock().await.take() {
            conn.shut_down(&self.server_id);
            info!(server = %self.server_id, "closed MCP server");
        }
    }
}
