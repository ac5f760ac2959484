//! MCP client
//!
//! [`Client`] is the typed entry point for the client role: it performs the
//! handshake, then exposes the server's tools, resources and prompts.
//!
//! ```rust,no_run
//! use mcp_engine::{client::Client, config::SessionConfig, registry::Capability};
//! use serde_json::json;
//! use tokio::process::Command;
//!
//! # async fn example() -> Result<(), mcp_engine::error::Error> {
//! let config = SessionConfig::new("my-host", "0.1.0").with_capability(Capability::Tools);
//! let client = Client::spawn(Command::new("my-mcp-server"), config).await?;
//! client.initialize().await?;
//!
//! let tools = client.list_tools().await?;
//! let result = client.call_tool(&tools[0].name, json!({})).await?;
//! println!("{}", result.joined_text());
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use tokio::process::Command;

use crate::{
    config::SessionConfig,
    dispatcher::{NotificationHandler, RequestHandler},
    error::Error,
    invoker::{Invoker, ToolCallStream},
    protocol::methods,
    registry::Capabilities,
    session::{Session, SessionState},
    transport::{StdioTransport, Transport},
    types::{
        CallToolResult, GetPromptResult, LoggingLevel, LoggingMessage, PeerInfo, Prompt,
        ReadResourceResult, Resource, ToolDescriptor,
    },
};

#[derive(Clone)]
pub struct Client {
    session: Session,
    invoker: Invoker,
}

impl Client {
    /// Create a new MCP client over `transport`
    pub fn new(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self::from_session(Session::new(transport, config))
    }

    pub fn from_session(session: Session) -> Self {
        Self {
            invoker: Invoker::new(session.clone()),
            session,
        }
    }

    /// Launch a local server process and talk to it over its stdio
    pub async fn spawn(command: Command, config: SessionConfig) -> Result<Self, Error> {
        let transport = StdioTransport::spawn(command).await?;
        Ok(Self::new(transport, config))
    }

    /// Initialize the client
    pub async fn initialize(&self) -> Result<PeerInfo, Error> {
        if self.session.state() == SessionState::Uninitialized {
            self.install_default_listeners().await;
        }
        let peer = self.session.connect().await?;
        if peer.protocol_version != self.session.config().protocol_version {
            log::warn!(
                "server settled on protocol version {} instead of {}",
                peer.protocol_version,
                self.session.config().protocol_version
            );
        }
        Ok(peer)
    }

    async fn install_default_listeners(&self) {
        self.session
            .on_notification(methods::LOGGING_MESSAGE, |params: Option<Value>| async move {
                if let Some(p) = params {
                    let message: LoggingMessage = serde_json::from_value(p)?;
                    let target = message.logger.as_deref().unwrap_or("mcp_server");
                    log::log!(target: target, message.level.into(), "{}", message.data);
                }
                Ok::<(), Error>(())
            })
            .await;

        self.session
            .on_notification(methods::RESOURCES_UPDATED, |params: Option<Value>| async move {
                if let Some(p) = params {
                    let update: HashMap<String, Value> = serde_json::from_value(p)?;
                    if let Some(uri) = update.get("uri").and_then(Value::as_str) {
                        log::debug!("resource updated: {uri}");
                    }
                }
                Ok::<(), Error>(())
            })
            .await;

        let session = self.session.clone();
        self.session
            .on_notification(methods::TOOLS_LIST_CHANGED, move |_params: Option<Value>| {
                let session = session.clone();
                async move {
                    log::debug!("server tool list changed, dropping cached catalog");
                    session.registry().write().await.clear_remote_tools();
                    Ok::<(), Error>(())
                }
            })
            .await;
    }

    /// Send a request to the server and wait for the response.
    ///
    /// If the server returns an error, it is propagated as [`Error::Rpc`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.session.call(method, params).await
    }

    /// Send a notification to the server
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.session.notify(method, params).await
    }

    /// Handle server-initiated requests, such as `sampling/createMessage`
    pub async fn on_request(
        &self,
        method: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), Error> {
        self.session.on_request(method, handler).await
    }

    pub async fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) {
        self.session.on_notification(method, handler).await
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        self.invoker.list_tools().await
    }

    /// Call a tool. The arguments are checked against its schema first, so the
    /// tool catalog must have been fetched with [`Client::list_tools`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        self.invoker.invoke_tool(name, arguments).await
    }

    pub async fn call_tool_streaming(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallStream, Error> {
        self.invoker.invoke_tool_streaming(name, arguments).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, Error> {
        self.invoker.list_resources().await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, Error> {
        self.invoker.read_resource(uri).await
    }

    pub async fn subscribe(&self, uri: &str) -> Result<(), Error> {
        self.invoker.subscribe_resource(uri).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, Error> {
        self.invoker.list_prompts().await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, Error> {
        self.invoker.get_prompt(name, arguments).await
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> Result<(), Error> {
        self.invoker.set_log_level(level).await
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.session.call(methods::PING, None).await?;
        Ok(())
    }

    /// The negotiated capabilities
    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.session.capabilities().await
    }

    pub async fn server_info(&self) -> Option<PeerInfo> {
        self.session.peer_info().await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Close the client connection
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.session.state() == SessionState::Ready {
            let timeout = self.session.config().close_timeout;
            if let Err(e) = self
                .session
                .call_with_timeout(methods::SHUTDOWN, None, timeout)
                .await
            {
                log::warn!("server did not acknowledge shutdown: {}", e);
            }
        }
        log::debug!("client shutting down");
        self.session.shutdown().await
    }
}
