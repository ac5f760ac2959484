//! Local MCP server processes and line-oriented stdio pumps

mod io;
mod manager;

pub(crate) use io::{read_lines, write_lines};
pub use manager::ProcessManager;
