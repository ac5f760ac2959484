//! Session lifecycle
//!
//! A [`Session`] drives one transport through the MCP lifecycle:
//!
//! ```text
//! Uninitialized -> Negotiating -> Ready -> Closing -> Closed
//!        \______________\____________\_______________/^
//! ```
//!
//! The client side starts with [`Session::connect`], the server side with
//! [`Session::accept`]. A single read task decodes inbound frames in order,
//! handles the lifecycle methods itself (`initialize`, `ping`, `shutdown`,
//! `notifications/initialized`, `notifications/exit`) and hands everything
//! else to the [`Dispatcher`]. Nothing leaves `Closed`.

mod state;

pub use state::{Role, SessionState};

use futures::StreamExt;
use serde_json::{json, Value};
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    codec,
    config::SessionConfig,
    dispatcher::{Dispatcher, NotificationHandler, RequestHandler},
    error::{CancelReason, Error, ErrorCode, ProtocolViolation},
    protocol::{methods, ErrorResponse, Message, Notification, Request, RequestId, Response, ResponseError},
    registry::{Capabilities, Capability, CapabilityRegistry},
    transport::{FrameStream, Transport},
    types::{InitializeParams, InitializeResult, PeerInfo, ToolDescriptor},
};

/// Methods the session answers itself
const RESERVED_METHODS: &[&str] = &[methods::INITIALIZE, methods::PING, methods::SHUTDOWN];

/// One MCP connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    registry: RwLock<CapabilityRegistry>,
    state: watch::Sender<SessionState>,
    peer: RwLock<Option<PeerInfo>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    role: OnceLock<Role>,
}

impl Session {
    pub fn new(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let registry = CapabilityRegistry::new(config.capabilities.clone());
        Self {
            inner: Arc::new(Inner {
                dispatcher: Arc::new(Dispatcher::new(transport)),
                registry: RwLock::new(registry),
                state,
                peer: RwLock::new(None),
                reader: Mutex::new(None),
                role: OnceLock::new(),
                config,
            }),
        }
    }

    /// Performs the client side of the handshake.
    ///
    /// Sends `initialize`, checks the server's protocol version against the
    /// supported list, fixes the effective capabilities and confirms with
    /// `notifications/initialized`. Any failure closes the session and is
    /// reported as [`Error::Handshake`].
    pub async fn connect(&self) -> Result<PeerInfo, Error> {
        self.begin(Role::Client)?;
        self.start_reader().await;

        match self.client_handshake().await {
            Ok(peer) => {
                log::info!(
                    "connected to {} {} (protocol {})",
                    peer.implementation.name,
                    peer.implementation.version,
                    peer.protocol_version
                );
                Ok(peer)
            }
            Err(e) => {
                log::error!("handshake failed: {}", e);
                self.inner.terminate().await;
                Err(e)
            }
        }
    }

    async fn client_handshake(&self) -> Result<PeerInfo, Error> {
        let config = &self.inner.config;
        let params = InitializeParams {
            protocol_version: config.protocol_version.clone(),
            capabilities: self.inner.registry.read().await.local().clone(),
            client_info: config.implementation.clone(),
        };

        let result = self
            .inner
            .dispatcher
            .call(
                methods::INITIALIZE,
                Some(serde_json::to_value(params)?),
                config.handshake_timeout,
            )
            .await
            .map_err(|e| Error::Handshake(format!("initialize failed: {}", e)))?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::Handshake(format!("malformed initialize result: {}", e)))?;

        if !config.supports_version(&result.protocol_version) {
            return Err(Error::Handshake(format!(
                "server answered with unsupported protocol version '{}'",
                result.protocol_version
            )));
        }

        self.inner
            .registry
            .write()
            .await
            .complete_negotiation(result.capabilities)
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let peer = PeerInfo {
            protocol_version: result.protocol_version,
            implementation: result.server_info,
            instructions: result.instructions,
        };
        *self.inner.peer.write().await = Some(peer.clone());

        if !self
            .inner
            .transition(SessionState::Ready, |s| s == SessionState::Negotiating)
        {
            return Err(Error::Handshake(
                "session closed during the handshake".to_string(),
            ));
        }
        self.inner
            .dispatcher
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| Error::Handshake(format!("could not confirm initialization: {}", e)))?;

        Ok(peer)
    }

    /// Performs the server side of the handshake.
    ///
    /// Resolves once the peer has sent `initialize` and
    /// `notifications/initialized`, within the handshake timeout.
    pub async fn accept(&self) -> Result<PeerInfo, Error> {
        self.begin(Role::Server)?;
        self.start_reader().await;

        let mut state = self.inner.state.subscribe();
        let settled = tokio::time::timeout(self.inner.config.handshake_timeout, async move {
            state
                .wait_for(|s| *s != SessionState::Negotiating)
                .await
                .map(|s| *s)
                .unwrap_or(SessionState::Closed)
        })
        .await;

        let failure = match settled {
            Ok(SessionState::Ready) => None,
            Ok(state) => Some(format!("session {} before the handshake completed", state)),
            Err(_) => Some("timed out waiting for the client to initialize".to_string()),
        };
        if let Some(failure) = failure {
            log::error!("handshake failed: {}", failure);
            self.inner.terminate().await;
            return Err(Error::Handshake(failure));
        }

        let peer = self.peer_info().await.ok_or_else(|| {
            Error::Handshake("client information missing after initialize".to_string())
        })?;
        log::info!(
            "accepted {} {} (protocol {})",
            peer.implementation.name,
            peer.implementation.version,
            peer.protocol_version
        );
        Ok(peer)
    }

    fn begin(&self, role: Role) -> Result<(), Error> {
        if !self
            .inner
            .transition(SessionState::Negotiating, |s| s == SessionState::Uninitialized)
        {
            return Err(Error::InvalidState(format!(
                "cannot start a handshake on a session that is {}",
                self.state()
            )));
        }
        let _ = self.inner.role.set(role);
        Ok(())
    }

    async fn start_reader(&self) {
        let inbound = self.inner.dispatcher.transport().receive();
        let handle = tokio::spawn(read_loop(self.inner.clone(), inbound));
        *self.inner.reader.lock().await = Some(handle);
    }

    /// Sends a request with the configured request timeout
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.call_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.ensure_ready()?;
        self.inner.dispatcher.call(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.ensure_ready()?;
        self.inner.dispatcher.notify(method, params).await
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(Error::InvalidState(format!("session is {}", state))),
        }
    }

    /// Registers the handler for an inbound request method.
    ///
    /// The lifecycle methods are answered by the session and cannot be taken over.
    pub async fn on_request(
        &self,
        method: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), Error> {
        let method = method.into();
        if RESERVED_METHODS.contains(&method.as_str()) {
            return Err(Error::DuplicateRegistration(format!(
                "'{}' is handled by the session",
                method
            )));
        }
        self.inner.dispatcher.on_request(method, handler).await
    }

    pub async fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) {
        self.inner.dispatcher.on_notification(method, handler).await
    }

    pub async fn register_tool(&self, descriptor: ToolDescriptor) -> Result<(), Error> {
        self.inner.registry.write().await.register_tool(descriptor)
    }

    /// Adds a capability to the local advertisement, before negotiation only
    pub async fn advertise(&self, capability: Capability) -> Result<(), Error> {
        self.inner.registry.write().await.advertise(capability)
    }

    pub async fn is_supported(&self, capability: Capability, feature: Option<&str>) -> bool {
        self.inner
            .registry
            .read()
            .await
            .is_supported(capability, feature)
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.registry.read().await.list_tools().to_vec()
    }

    /// The effective capabilities, once negotiated
    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.inner.registry.read().await.effective().cloned()
    }

    pub async fn local_capabilities(&self) -> Capabilities {
        self.inner.registry.read().await.local().clone()
    }

    pub async fn remote_capabilities(&self) -> Option<Capabilities> {
        self.inner.registry.read().await.remote().cloned()
    }

    pub async fn peer_info(&self) -> Option<PeerInfo> {
        self.inner.peer.read().await.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.current()
    }

    /// Subscribes to state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.role.get().copied()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    /// Shuts the session down.
    ///
    /// Pending requests fail with [`CancelReason::SessionClosing`], the peer is
    /// sent `notifications/exit` and the transport is closed. If the inbound
    /// stream has not ended within the close timeout the session is closed
    /// anyway. Calling this again, or on a closed session, does nothing.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.current().is_terminal() {
            return Ok(());
        }
        inner.transition(SessionState::Closing, |_| true);
        inner
            .dispatcher
            .cancel_all(CancelReason::SessionClosing)
            .await;

        if inner.reader.lock().await.is_none() {
            inner.dispatcher.transport().close().await?;
            inner.set_closed();
            return Ok(());
        }

        if let Err(e) = inner.dispatcher.notify(methods::EXIT, None).await {
            log::debug!("could not send exit notification: {}", e);
        }
        if let Err(e) = inner.dispatcher.transport().close().await {
            log::warn!("error closing transport: {}", e);
        }

        let mut state = inner.state.subscribe();
        let wound_down = tokio::time::timeout(inner.config.close_timeout, async move {
            let _ = state.wait_for(|s| s.is_terminal()).await;
        })
        .await;
        if wound_down.is_err() {
            log::warn!(
                "transport did not wind down within {}ms, forcing close",
                inner.config.close_timeout.as_millis()
            );
            if let Some(reader) = inner.reader.lock().await.take() {
                reader.abort();
            }
            inner.set_closed();
        }
        Ok(())
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub(crate) fn registry(&self) -> &RwLock<CapabilityRegistry> {
        &self.inner.registry
    }
}

impl Inner {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to `to` if the current state is allowed to; never leaves `Closed`
    fn transition(&self, to: SessionState, allowed: impl Fn(SessionState) -> bool) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == to || !allowed(*current) {
                return false;
            }
            log::debug!("session {} -> {}", current, to);
            *current = to;
            true
        })
    }

    fn set_closed(&self) {
        self.transition(SessionState::Closed, |_| true);
    }

    /// Closes everything immediately, after a failed handshake
    async fn terminate(&self) {
        self.dispatcher
            .cancel_all(CancelReason::TransportClosed)
            .await;
        if let Err(e) = self.dispatcher.transport().close().await {
            log::warn!("error closing transport: {}", e);
        }
        self.set_closed();
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request(request) => self.handle_request(request).await,
            Message::Notification(notification) => self.handle_notification(notification).await,
            reply => self.dispatcher.dispatch(reply).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, request: Request) {
        match request.method.as_str() {
            methods::INITIALIZE => {
                let outcome = self.handle_initialize(request.params).await;
                self.reply(request.id, outcome).await;
            }
            methods::PING => self.reply(request.id, Ok(json!({}))).await,
            methods::SHUTDOWN => {
                self.reply(request.id, Ok(json!({}))).await;
                self.begin_closing().await;
            }
            _ => match self.current() {
                SessionState::Ready => self.dispatcher.dispatch(Message::Request(request)).await,
                state => {
                    let message = match state {
                        SessionState::Closing | SessionState::Closed => "session is closing",
                        _ => "session not initialized",
                    };
                    log::warn!("refusing '{}': {}", request.method, message);
                    let error = ResponseError::new(ErrorCode::InvalidRequest, message);
                    self.reply(request.id, Err(error)).await;
                }
            },
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value, ResponseError> {
        if self.role.get() != Some(&Role::Server) {
            return Err(ResponseError::new(
                ErrorCode::InvalidRequest,
                "this peer does not accept initialize",
            ));
        }
        if self.current() != SessionState::Negotiating || self.registry.read().await.is_negotiated()
        {
            return Err(ResponseError::new(
                ErrorCode::InvalidRequest,
                "session already initialized",
            ));
        }

        let params: InitializeParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                ResponseError::new(
                    ErrorCode::InvalidParams,
                    format!("invalid initialize params: {}", e),
                )
            })?
            .ok_or_else(|| {
                ResponseError::new(ErrorCode::InvalidParams, "missing initialize params")
            })?;

        let version = if self.config.supports_version(&params.protocol_version) {
            params.protocol_version
        } else {
            log::warn!(
                "client offered unsupported protocol version '{}', answering with '{}'",
                params.protocol_version,
                self.config.protocol_version
            );
            self.config.protocol_version.clone()
        };

        let local = {
            let mut registry = self.registry.write().await;
            registry.complete_negotiation(params.capabilities)?;
            registry.local().clone()
        };
        *self.peer.write().await = Some(PeerInfo {
            protocol_version: version.clone(),
            implementation: params.client_info,
            instructions: None,
        });

        let result = InitializeResult {
            protocol_version: version,
            capabilities: local,
            server_info: self.config.implementation.clone(),
            instructions: self.config.instructions.clone(),
        };
        serde_json::to_value(result).map_err(|e| Error::from(e).into())
    }

    async fn handle_notification(self: &Arc<Self>, notification: Notification) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                let negotiated = self.registry.read().await.is_negotiated();
                if self.role.get() == Some(&Role::Server) && negotiated {
                    self.transition(SessionState::Ready, |s| s == SessionState::Negotiating);
                } else {
                    log::warn!("ignoring unexpected initialized notification");
                }
            }
            methods::EXIT => {
                self.begin_closing().await;
                if let Err(e) = self.dispatcher.transport().close().await {
                    log::warn!("error closing transport: {}", e);
                }
            }
            _ => {}
        }
        self.dispatcher
            .dispatch(Message::Notification(notification))
            .await;
    }

    /// Enters `Closing`; the transport gets `close_timeout` to wind down
    async fn begin_closing(self: &Arc<Self>) {
        if !self.transition(SessionState::Closing, |s| s != SessionState::Closing) {
            return;
        }
        self.dispatcher
            .cancel_all(CancelReason::SessionClosing)
            .await;

        let inner = self.clone();
        tokio::spawn(async move {
            let mut state = inner.state.subscribe();
            let close_timeout = inner.config.close_timeout;
            let wound_down = tokio::time::timeout(close_timeout, async move {
                let _ = state.wait_for(|s| s.is_terminal()).await;
            })
            .await;
            if wound_down.is_err() {
                log::warn!(
                    "peer did not close within {}ms, closing transport",
                    close_timeout.as_millis()
                );
                if let Err(e) = inner.dispatcher.transport().close().await {
                    log::warn!("error closing transport: {}", e);
                }
                inner.set_closed();
            }
        });
    }

    /// Answers a frame that failed to decode
    async fn reject_frame(&self, frame: &[u8], err: Error) {
        log::warn!("rejecting inbound frame: {}", err);
        let (code, id) = match &err {
            Error::Protocol {
                violation: ProtocolViolation::MalformedJson,
                ..
            } => (ErrorCode::ParseError, None),
            _ if is_reply(frame) => return,
            _ => (ErrorCode::InvalidRequest, codec::salvage_request_id(frame)),
        };
        let message = match err {
            Error::Protocol { message, .. } => message,
            other => other.to_string(),
        };
        let error = ErrorResponse::new(id, ResponseError::new(code, message));
        if let Err(e) = self.dispatcher.send_message(&Message::Error(error)).await {
            log::warn!("failed to report rejected frame: {}", e);
        }
    }

    async fn reply(&self, id: RequestId, outcome: Result<Value, ResponseError>) {
        let message = match outcome {
            Ok(result) => Message::Response(Response::success(id, result)),
            Err(error) => Message::Error(ErrorResponse::new(Some(id), error)),
        };
        if let Err(e) = self.dispatcher.send_message(&message).await {
            log::warn!("failed to send reply: {}", e);
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut inbound: FrameStream) {
    while let Some(frame) = inbound.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("transport failed: {}", e);
                break;
            }
        };
        match codec::decode(&frame) {
            Ok(message) => inner.handle_message(message).await,
            Err(e) => inner.reject_frame(&frame, e).await,
        }
    }

    log::debug!("inbound stream ended");
    inner
        .dispatcher
        .cancel_all(CancelReason::TransportClosed)
        .await;
    if let Err(e) = inner.dispatcher.transport().close().await {
        log::debug!("error closing transport: {}", e);
    }
    inner.set_closed();
}

/// A broken response is logged, never answered
fn is_reply(frame: &[u8]) -> bool {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(frame) else {
        return false;
    };
    !object.contains_key("method") && (object.contains_key("result") || object.contains_key("error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RequestContext;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_new_session_is_uninitialized() {
        let (a, _b) = MemoryTransport::pair();
        let session = Session::new(a, SessionConfig::default());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.role(), None);
        assert!(session.capabilities().await.is_none());
        assert!(matches!(
            session.call("tools/list", None).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_closes() {
        let (a, _b) = MemoryTransport::pair();
        let session = Session::new(a, SessionConfig::default());
        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.connect().await, Err(Error::InvalidState(_))));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_methods_cannot_be_registered() {
        let (a, _b) = MemoryTransport::pair();
        let session = Session::new(a, SessionConfig::default());
        let result = session
            .on_request(methods::PING, |_ctx: RequestContext, _params: Option<Value>| async move {
                Ok::<Value, Error>(Value::Null)
            })
            .await;
        assert!(matches!(result, Err(Error::DuplicateRegistration(_))));
    }

    #[test]
    fn test_is_reply() {
        assert!(is_reply(br#"{"jsonrpc":"1.0","id":1,"result":{}}"#));
        assert!(!is_reply(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#));
        assert!(!is_reply(b"[]"));
        assert!(!is_reply(&Bytes::from_static(b"{")));
    }
}
