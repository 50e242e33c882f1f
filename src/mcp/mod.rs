//! External tool servers over stdio JSON-RPC (MCP)
//!
//! - [`protocol`]: message shapes, framing, `McpServerConfig`
//! - [`client`]: `McpClient`, one process with its pending-request table
//! - [`registry`]: `McpRegistry`, many named servers

pub mod client;
pub mod protocol;
pub mod registry;

pub use client::{McpClient, DEFAULT_REQUEST_TIMEOUT};
pub use protocol::{McpServerConfig, McpTool, PROTOCOL_VERSION};
pub use registry::McpRegistry;
