//! Built-in tools.

mod echo;
mod shell;
mod time;

pub use echo::EchoTool;
pub use shell::{ShellConfig, ShellTool};
pub use time::TimeTool;
