//! MCP server
//!
//! A [`Server`] is assembled with a [`ServerBuilder`]: every tool, resource and
//! prompt is registered together with its handler, and the matching capability
//! is advertised automatically. [`Server::serve`] answers the handshake and
//! keeps serving until the session closes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::SessionConfig,
    dispatcher::{RequestContext, RequestHandler},
    error::{Error, ErrorCode},
    protocol::{methods, RequestId},
    registry::Capability,
    schema,
    session::Session,
    transport::Transport,
    types::{
        CallToolParams, CallToolResult, Cursor, GetPromptParams, GetPromptResult,
        ListPromptsResult, ListResourcesResult, ListToolsResult, LoggingLevel, LoggingMessage,
        PaginatedParams, Prompt, ProgressToken, ReadResourceParams, ReadResourceResult, Resource,
        ResourceContents, ToolDescriptor,
    },
};

/// Runs one tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: ToolContext, arguments: Value) -> Result<CallToolResult, Error>;
}

/// Produces the contents of one resource
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &str) -> Result<Vec<ResourceContents>, Error>;
}

/// Renders one prompt
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(&self, arguments: HashMap<String, String>) -> Result<GetPromptResult, Error>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult, Error>> + Send + 'static,
{
    async fn call(&self, ctx: ToolContext, arguments: Value) -> Result<CallToolResult, Error> {
        (self)(ctx, arguments).await
    }
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ResourceContents>, Error>> + Send + 'static,
{
    async fn read(&self, uri: &str) -> Result<Vec<ResourceContents>, Error> {
        (self)(uri.to_string()).await
    }
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult, Error>> + Send + 'static,
{
    async fn get(&self, arguments: HashMap<String, String>) -> Result<GetPromptResult, Error> {
        (self)(arguments).await
    }
}

/// Handed to a [`ToolHandler`] for the duration of one call
#[derive(Clone)]
pub struct ToolContext {
    request: RequestContext,
}

impl ToolContext {
    pub fn request_id(&self) -> &RequestId {
        &self.request.id
    }

    /// The token the caller attached, if it asked for progress
    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.request.progress_token.as_ref()
    }

    /// Reports progress to the caller; a no-op when it did not ask for any
    pub async fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), Error> {
        self.request.progress(progress, total, message).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.request.notify(method, params).await
    }
}

struct ToolEntry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

struct ResourceEntry {
    resource: Resource,
    handler: Arc<dyn ResourceHandler>,
}

struct PromptEntry {
    prompt: Prompt,
    handler: Arc<dyn PromptHandler>,
}

#[derive(Default)]
struct Catalog {
    tools: Vec<ToolEntry>,
    resources: Vec<ResourceEntry>,
    prompts: Vec<PromptEntry>,
    page_size: Option<usize>,
}

/// Collects handlers, then builds a [`Server`] around a transport
pub struct ServerBuilder {
    config: SessionConfig,
    catalog: Catalog,
    subscriptions: bool,
    logging: bool,
}

impl ServerBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            catalog: Catalog::default(),
            subscriptions: false,
            logging: false,
        }
    }

    /// Adds a tool. Registering an identical descriptor again keeps the first
    /// handler.
    pub fn tool(mut self, descriptor: ToolDescriptor, handler: impl ToolHandler + 'static) -> Self {
        if self.catalog.tools.iter().any(|t| t.descriptor == descriptor) {
            log::debug!("tool '{}' is already registered", descriptor.name);
            return self;
        }
        self.catalog.tools.push(ToolEntry {
            descriptor,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn resource(mut self, resource: Resource, handler: impl ResourceHandler + 'static) -> Self {
        self.catalog.resources.push(ResourceEntry {
            resource,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn prompt(mut self, prompt: Prompt, handler: impl PromptHandler + 'static) -> Self {
        self.catalog.prompts.push(PromptEntry {
            prompt,
            handler: Arc::new(handler),
        });
        self
    }

    /// Accept `resources/subscribe` and advertise the `subscribe` feature
    pub fn with_subscriptions(mut self) -> Self {
        self.subscriptions = true;
        self
    }

    /// Accept `logging/setLevel` and forward [`Server::log`] messages
    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    /// Split list responses into pages of at most `size` entries
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.catalog.page_size = Some(size.max(1));
        self
    }

    pub async fn build(self, transport: impl Transport + 'static) -> Result<Server, Error> {
        let ServerBuilder {
            mut config,
            catalog,
            subscriptions,
            logging,
        } = self;

        let mut capabilities = std::mem::take(&mut config.capabilities);
        if !catalog.tools.is_empty() {
            capabilities.insert(Capability::Tools);
        }
        if !catalog.resources.is_empty() || subscriptions {
            capabilities.insert(Capability::Resources);
        }
        if subscriptions {
            capabilities = capabilities.with_feature(Capability::Resources, "subscribe");
        }
        if !catalog.prompts.is_empty() {
            capabilities.insert(Capability::Prompts);
        }
        if logging {
            capabilities.insert(Capability::Logging);
        }
        config.capabilities = capabilities;

        let session = Session::new(transport, config);
        for entry in &catalog.tools {
            session.register_tool(entry.descriptor.clone()).await?;
        }

        let catalog = Arc::new(catalog);
        let server = Server {
            session,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            log_level: Arc::new(RwLock::new(None)),
            logging,
        };

        let session = &server.session;
        if !catalog.tools.is_empty() {
            session
                .on_request(methods::TOOLS_LIST, ListTools(catalog.clone()))
                .await?;
            session
                .on_request(methods::TOOLS_CALL, CallTool(catalog.clone()))
                .await?;
        }
        if !catalog.resources.is_empty() || subscriptions {
            session
                .on_request(methods::RESOURCES_LIST, ListResources(catalog.clone()))
                .await?;
            session
                .on_request(methods::RESOURCES_READ, ReadResource(catalog.clone()))
                .await?;
        }
        if subscriptions {
            session
                .on_request(
                    methods::RESOURCES_SUBSCRIBE,
                    Subscribe(server.subscribed.clone()),
                )
                .await?;
        }
        if !catalog.prompts.is_empty() {
            session
                .on_request(methods::PROMPTS_LIST, ListPrompts(catalog.clone()))
                .await?;
            session
                .on_request(methods::PROMPTS_GET, GetPrompt(catalog.clone()))
                .await?;
        }
        if logging {
            session
                .on_request(methods::LOGGING_SET_LEVEL, SetLevel(server.log_level.clone()))
                .await?;
        }

        Ok(server)
    }
}

/// Server state
#[derive(Clone)]
pub struct Server {
    session: Session,
    subscribed: Arc<Mutex<HashSet<String>>>,
    log_level: Arc<RwLock<Option<LoggingLevel>>>,
    logging: bool,
}

impl Server {
    pub fn builder(config: SessionConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Answers the handshake and serves requests until the session closes
    pub async fn serve(&self) -> Result<(), Error> {
        let peer = self.session.accept().await?;
        log::info!(
            "serving {} {} (protocol {})",
            peer.implementation.name,
            peer.implementation.version,
            peer.protocol_version
        );
        self.session.closed().await;
        log::debug!("session closed, server stopping");
        Ok(())
    }

    /// Tells the client a resource changed, if it subscribed to it.
    ///
    /// Returns whether a notification was sent.
    pub async fn notify_resource_updated(&self, uri: &str) -> Result<bool, Error> {
        if !self.subscribed.lock().await.contains(uri) {
            return Ok(false);
        }
        self.session
            .notify(methods::RESOURCES_UPDATED, Some(json!({ "uri": uri })))
            .await?;
        Ok(true)
    }

    /// Sends a `notifications/message` unless it falls below the client's level.
    ///
    /// Until the client picks a level, `info` and above are sent.
    pub async fn log(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> Result<(), Error> {
        if !self.logging {
            return Err(Error::NotNegotiated(Capability::Logging));
        }
        let threshold = self.log_level.read().await.unwrap_or(LoggingLevel::Info);
        if level < threshold {
            return Ok(());
        }
        let message = LoggingMessage {
            level,
            logger: logger.map(str::to_string),
            data,
        };
        self.session
            .notify(methods::LOGGING_MESSAGE, Some(serde_json::to_value(message)?))
            .await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.session.shutdown().await
    }
}

fn parse_params<T: serde::de::DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, Error> {
    match params {
        Some(params) => Ok(serde_json::from_value(params)?),
        None => Ok(T::default()),
    }
}

fn require_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, Error> {
    let params = params.ok_or_else(|| Error::rpc(ErrorCode::InvalidParams, "missing params"))?;
    Ok(serde_json::from_value(params)?)
}

/// Cuts one page out of `items`; cursors are stringified offsets
fn page<T>(
    items: impl ExactSizeIterator<Item = T>,
    page_size: Option<usize>,
    params: Option<Value>,
) -> Result<(Vec<T>, Option<Cursor>), Error> {
    let params: PaginatedParams = parse_params(params)?;
    let total = items.len();
    let start = match params.cursor {
        Some(cursor) => cursor
            .parse::<usize>()
            .ok()
            .filter(|offset| *offset <= total)
            .ok_or_else(|| {
                Error::rpc(ErrorCode::InvalidParams, format!("invalid cursor '{}'", cursor))
            })?,
        None => 0,
    };
    let end = page_size.map_or(total, |size| start.saturating_add(size).min(total));
    let next = (end < total).then(|| end.to_string());
    Ok((items.skip(start).take(end - start).collect(), next))
}

struct ListTools(Arc<Catalog>);

#[async_trait]
impl RequestHandler for ListTools {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let descriptors = self.0.tools.iter().map(|t| t.descriptor.clone());
        let (tools, next_cursor) = page(descriptors, self.0.page_size, params)?;
        Ok(serde_json::to_value(ListToolsResult { tools, next_cursor })?)
    }
}

struct CallTool(Arc<Catalog>);

#[async_trait]
impl RequestHandler for CallTool {
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let params: CallToolParams = require_params(params)?;
        let entry = self
            .0
            .tools
            .iter()
            .find(|t| t.descriptor.name == params.name)
            .ok_or_else(|| {
                Error::rpc(
                    ErrorCode::InvalidParams,
                    format!("unknown tool '{}'", params.name),
                )
            })?;

        let arguments = match params.arguments {
            Value::Null => json!({}),
            arguments => arguments,
        };
        schema::validate(&entry.descriptor.input_schema, &arguments)?;

        let result = match entry
            .handler
            .call(ToolContext { request: ctx }, arguments)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                log::warn!("tool '{}' failed: {}", params.name, e);
                CallToolResult::error(e.to_string())
            }
        };
        Ok(serde_json::to_value(result)?)
    }
}

struct ListResources(Arc<Catalog>);

#[async_trait]
impl RequestHandler for ListResources {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let listed = self.0.resources.iter().map(|r| r.resource.clone());
        let (resources, next_cursor) = page(listed, self.0.page_size, params)?;
        Ok(serde_json::to_value(ListResourcesResult {
            resources,
            next_cursor,
        })?)
    }
}

struct ReadResource(Arc<Catalog>);

#[async_trait]
impl RequestHandler for ReadResource {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let ReadResourceParams { uri } = require_params(params)?;
        let entry = self
            .0
            .resources
            .iter()
            .find(|r| r.resource.uri == uri)
            .ok_or_else(|| {
                Error::rpc(
                    ErrorCode::ResourceNotFound,
                    format!("resource not found: {}", uri),
                )
            })?;
        let contents = entry.handler.read(&uri).await?;
        Ok(serde_json::to_value(ReadResourceResult { contents })?)
    }
}

struct Subscribe(Arc<Mutex<HashSet<String>>>);

#[async_trait]
impl RequestHandler for Subscribe {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let ReadResourceParams { uri } = require_params(params)?;
        log::debug!("client subscribed to {}", uri);
        self.0.lock().await.insert(uri);
        Ok(json!({}))
    }
}

struct ListPrompts(Arc<Catalog>);

#[async_trait]
impl RequestHandler for ListPrompts {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let listed = self.0.prompts.iter().map(|p| p.prompt.clone());
        let (prompts, next_cursor) = page(listed, self.0.page_size, params)?;
        Ok(serde_json::to_value(ListPromptsResult {
            prompts,
            next_cursor,
        })?)
    }
}

struct GetPrompt(Arc<Catalog>);

#[async_trait]
impl RequestHandler for GetPrompt {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let GetPromptParams { name, arguments } = require_params(params)?;
        let entry = self
            .0
            .prompts
            .iter()
            .find(|p| p.prompt.name == name)
            .ok_or_else(|| {
                Error::rpc(ErrorCode::InvalidParams, format!("unknown prompt '{}'", name))
            })?;
        if let Some(missing) = entry
            .prompt
            .arguments
            .iter()
            .find(|a| a.required && !arguments.contains_key(&a.name))
        {
            return Err(Error::rpc(
                ErrorCode::InvalidParams,
                format!("prompt '{}' requires argument '{}'", name, missing.name),
            ));
        }
        let result = entry.handler.get(arguments).await?;
        Ok(serde_json::to_value(result)?)
    }
}

struct SetLevel(Arc<RwLock<Option<LoggingLevel>>>);

#[async_trait]
impl RequestHandler for SetLevel {
    async fn handle(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        let params: Value = require_params(params)?;
        let level = params
            .get("level")
            .cloned()
            .ok_or_else(|| Error::rpc(ErrorCode::InvalidParams, "missing 'level'"))?;
        let level: LoggingLevel = serde_json::from_value(level)?;
        log::debug!("client log level set to {:?}", level);
        *self.0.write().await = Some(level);
        Ok(json!({}))
    }
}
