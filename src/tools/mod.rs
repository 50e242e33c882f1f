//! Tools the Agent Loop can call
//!
//! - [`schema`]: `ParamSchema`, the validating + exportable parameter descriptor
//! - [`tool`]: the `Tool` trait, `ToolContext`, `ToolOutput`
//! - [`registry`]: `ToolRegistry`
//! - [`builtin`]: echo, current_time, shell

pub mod builtin;
pub mod registry;
pub mod schema;
pub mod tool;

pub use builtin::{EchoTool, ShellConfig, ShellTool, TimeTool};
pub use registry::ToolRegistry;
pub use schema::ParamSchema;
pub use tool::{Tool, ToolContext, ToolOutput};
