//! # MCP session engine
//!
//! A Rust implementation of the Model Context Protocol (MCP) session layer:
//! JSON-RPC 2.0 framing, request/response correlation, the initialize
//! handshake with capability negotiation, and tool, resource and prompt
//! operations on top. The same engine plays either role.
//!
//! ## Features
//!
//! - Lifecycle state machine with handshake, shutdown and cancellation
//! - Concurrent requests with per-call timeouts
//! - Capability negotiation as the intersection of both sides
//! - Tool argument validation against the tool's JSON schema before sending
//! - Streaming tool calls with progress notifications
//! - Multiple transports (stdio, child process, SSE, WebSocket, in-memory)
//!
//! ## Example
//!
//! ```no_run
//! use mcp_engine::{
//!     client::Client,
//!     config::SessionConfig,
//!     registry::Capability,
//!     server::{Server, ToolContext},
//!     transport::MemoryTransport,
//!     types::{CallToolResult, ToolDescriptor},
//!     Error,
//! };
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client_end, server_end) = MemoryTransport::pair();
//!
//!     let server = Server::builder(SessionConfig::new("echo-server", "0.1.0"))
//!         .tool(
//!             ToolDescriptor::new("echo", json!({
//!                 "type": "object",
//!                 "properties": {"text": {"type": "string"}},
//!                 "required": ["text"]
//!             })),
//!             |_ctx: ToolContext, args: Value| async move {
//!                 Ok::<_, Error>(CallToolResult::text(args["text"].as_str().unwrap_or_default()))
//!             },
//!         )
//!         .build(server_end)
//!         .await?;
//!     tokio::spawn(async move { server.serve().await });
//!
//!     let config = SessionConfig::new("my-host", "0.1.0").with_capability(Capability::Tools);
//!     let client = Client::new(client_end, config);
//!     client.initialize().await?;
//!     client.list_tools().await?;
//!
//!     let result = client.call_tool("echo", json!({"text": "hello"})).await?;
//!     assert_eq!(result.joined_text(), "hello");
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// Client façade over a session
pub mod client;
/// JSON-RPC frame encoding and decoding
pub mod codec;
/// Session configuration
pub mod config;
/// Request correlation and inbound routing
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Tool, resource and prompt operations
pub mod invoker;
/// Child process management for the stdio transport
pub mod process;
/// Protocol-specific types and implementations
pub mod protocol;
/// Capability negotiation and tool registrations
pub mod registry;
/// JSON schema checks for tool arguments
pub mod schema;
/// Server façade over a session
pub mod server;
/// Session lifecycle
pub mod session;
/// Transport layer implementations
pub mod transport;
/// Common types used throughout the crate
pub mod types;

// Re-export commonly used types for convenience
pub use client::Client;
pub use config::SessionConfig;
pub use error::{CancelReason, Error, ErrorCode, ErrorInfo, ErrorKind};
pub use invoker::{Invoker, ToolCallStream, ToolEvent};
pub use protocol::{
    Message, Notification, Request, RequestId, Response, JSONRPC_VERSION,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use registry::{Capabilities, Capability};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionState};
pub use transport::Transport;
pub use types::*;
