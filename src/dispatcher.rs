//! Request/response correlation and inbound routing
//!
//! The [`Dispatcher`] owns everything that ties a message to the code waiting
//! for it:
//!
//! - outgoing ids (monotonic integers, starting at 1, never reused)
//! - the pending-request table, guarded by one mutex
//! - request handlers and notification listeners, keyed by method name
//! - progress streams, keyed by progress token
//! - inbound requests still running, so a peer can cancel them
//!
//! Completion and expiry of an outgoing request are both decided by removing
//! its entry under the table lock. Whichever side removes it wins, so a call
//! that timed out can never be completed afterwards. A call future that is
//! dropped early takes its entry with it.

use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::AbortHandle,
    time::Instant,
};

use crate::{
    codec,
    error::{CancelReason, Error, ErrorCode},
    protocol::{
        methods, ErrorResponse, Message, Notification, Request, RequestId, Response,
        ResponseError,
    },
    transport::Transport,
    types::{CancelledNotification, Progress, ProgressToken},
};

/// Handles one inbound request method
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value, Error>;
}

/// Listens to one inbound notification method
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<(), Error>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value, Error> {
        (self)(ctx, params).await
    }
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<(), Error> {
        (self)(params).await
    }
}

/// What a request handler knows about the request it is serving
#[derive(Clone)]
pub struct RequestContext {
    pub id: RequestId,
    pub method: String,
    /// Token the peer attached in `params._meta.progressToken`, if any
    pub progress_token: Option<ProgressToken>,
    dispatcher: Arc<Dispatcher>,
}

impl RequestContext {
    /// Sends a notification to the peer that issued the request
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.dispatcher.notify(method, params).await
    }

    /// Reports progress on this request.
    ///
    /// Does nothing when the peer did not ask for progress.
    pub async fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), Error> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let progress = Progress {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        self.notify(methods::PROGRESS, Some(serde_json::to_value(progress)?))
            .await
    }
}

/// How many abandoned ids are remembered for recognising late responses
const MAX_EXPIRED: usize = 1024;

struct PendingRequest {
    method: String,
    /// `None` when the timeout is too large to represent as an instant
    deadline: Option<Instant>,
    tx: oneshot::Sender<Result<Value, Error>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
    /// Ids that timed out or were abandoned; a response for one of these is
    /// late, not unknown
    expired: HashSet<RequestId>,
    expired_order: VecDeque<RequestId>,
    closed: Option<CancelReason>,
}

impl PendingTable {
    fn expire(&mut self, id: RequestId) {
        if self.expired.insert(id.clone()) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > MAX_EXPIRED {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }
}

/// Drops the pending entry of a call whose future goes away before it resolves
struct PendingGuard<'a> {
    table: &'a StdMutex<PendingTable>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.table);
        if let Some(entry) = pending.entries.remove(&self.id) {
            log::debug!("request {} '{}' abandoned by its caller", self.id, entry.method);
            pending.expire(self.id.clone());
        }
    }
}

type ProgressRoutes = Arc<StdMutex<HashMap<ProgressToken, mpsc::UnboundedSender<Progress>>>>;

/// Progress updates for one token.
///
/// Dropping it removes the route, so later updates for the token fall through
/// to the notification listeners.
pub(crate) struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Progress>,
    route: Option<(ProgressToken, ProgressRoutes)>,
}

impl ProgressReceiver {
    /// A receiver not registered with any dispatcher
    #[cfg(test)]
    pub(crate) fn detached(rx: mpsc::UnboundedReceiver<Progress>) -> Self {
        Self { rx, route: None }
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Progress>> {
        self.rx.poll_recv(cx)
    }

    pub(crate) fn try_recv(&mut self) -> Option<Progress> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ProgressReceiver {
    fn drop(&mut self) {
        if let Some((token, routes)) = self.route.take() {
            lock(&routes).remove(&token);
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: StdMutex<PendingTable>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    notification_handlers: RwLock<HashMap<String, Vec<Arc<dyn NotificationHandler>>>>,
    progress: ProgressRoutes,
    inflight: Mutex<HashMap<RequestId, AbortHandle>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(1),
            pending: StdMutex::new(PendingTable::default()),
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            progress: Arc::new(StdMutex::new(HashMap::new())),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Registers the handler for an inbound request method
    pub async fn on_request(
        &self,
        method: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), Error> {
        let method = method.into();
        let mut handlers = self.request_handlers.write().await;
        if handlers.contains_key(&method) {
            return Err(Error::DuplicateRegistration(format!(
                "a handler for '{}' is already registered",
                method
            )));
        }
        handlers.insert(method, Arc::new(handler));
        Ok(())
    }

    /// Adds a listener for an inbound notification method.
    ///
    /// Several listeners may share a method; they run in registration order.
    pub async fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) {
        self.notification_handlers
            .write()
            .await
            .entry(method.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub(crate) async fn send_message(&self, message: &Message) -> Result<(), Error> {
        let frame = codec::encode(message)?;
        log::debug!(
            "-> {}",
            message.method().unwrap_or("response")
        );
        self.transport.send(frame).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let notification = Notification::new(method, params);
        self.send_message(&Message::Notification(notification))
            .await
    }

    /// Sends a request and waits for its response.
    ///
    /// Resolves with the peer's result, its error as [`Error::Rpc`],
    /// [`Error::Timeout`] once `timeout` has passed, or [`Error::Cancelled`] if
    /// the session closes first. A timeout too large to schedule never fires.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let deadline = Instant::now().checked_add(timeout);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut pending = lock(&self.pending);
            if let Some(reason) = pending.closed {
                return Err(Error::Cancelled(reason));
            }
            pending.entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    deadline,
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            table: &self.pending,
            id: id.clone(),
        };

        let request = Message::Request(Request::new(method, params, id.clone()));
        if let Err(e) = self.send_message(&request).await {
            lock(&self.pending).entries.remove(&id);
            return Err(e);
        }

        let Some(deadline) = deadline else {
            return outcome_of(rx.await);
        };
        tokio::select! {
            outcome = &mut rx => return outcome_of(outcome),
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let expired = {
            let mut pending = lock(&self.pending);
            let removed = pending.entries.remove(&id).is_some();
            if removed {
                pending.expire(id.clone());
            }
            removed
        };
        if !expired {
            // completed between the deadline firing and the lock being taken
            return outcome_of(rx.await);
        }

        log::warn!(
            "request {} '{}' timed out after {}ms",
            id,
            method,
            timeout.as_millis()
        );
        let cancelled = CancelledNotification {
            request_id: id,
            reason: Some("request timed out".to_string()),
        };
        if let Ok(params) = serde_json::to_value(cancelled) {
            if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
                log::debug!("could not send cancellation: {}", e);
            }
        }

        Err(Error::Timeout {
            method: method.to_string(),
            after: timeout,
        })
    }

    /// Hands a response to the call waiting for it
    fn complete(&self, id: Option<RequestId>, outcome: Result<Value, Error>) {
        let Some(id) = id else {
            if let Err(e) = outcome {
                log::warn!("peer reported an error for an unidentifiable message: {}", e);
            }
            return;
        };

        let mut pending = lock(&self.pending);
        match pending.entries.remove(&id) {
            Some(entry) => {
                drop(pending);
                log::debug!("<- response to {} '{}'", id, entry.method);
                let _ = entry.tx.send(outcome);
            }
            None if pending.expired.remove(&id) => {
                log::warn!("discarding late response to request {}", id);
            }
            None => {
                log::warn!("discarding response to unknown request {}", id);
            }
        }
    }

    /// Fails every pending call with `reason` and refuses new ones
    pub async fn cancel_all(&self, reason: CancelReason) {
        let drained = {
            let mut pending = lock(&self.pending);
            if pending.closed.is_none() {
                pending.closed = Some(reason);
            }
            std::mem::take(&mut pending.entries)
        };
        for (id, entry) in drained {
            log::debug!(
                "cancelling request {} '{}' ({:?} before its deadline): {}",
                id,
                entry.method,
                entry
                    .deadline
                    .map(|deadline| deadline.saturating_duration_since(Instant::now())),
                reason
            );
            let _ = entry.tx.send(Err(Error::Cancelled(reason)));
        }

        for (_, handle) in self.inflight.lock().await.drain() {
            handle.abort();
        }
        lock(&self.progress).clear();
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).entries.len()
    }

    #[cfg(test)]
    fn expired_count(&self) -> usize {
        lock(&self.pending).expired.len()
    }

    /// Opens a progress stream for `token`; it is closed when the receiver drops
    pub(crate) fn register_progress(&self, token: ProgressToken) -> ProgressReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.progress).insert(token.clone(), tx);
        ProgressReceiver {
            rx,
            route: Some((token, self.progress.clone())),
        }
    }

    pub(crate) fn unregister_progress(&self, token: &ProgressToken) {
        lock(&self.progress).remove(token);
    }

    /// Routes one inbound message to whoever is waiting on it
    pub(crate) async fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.complete(Some(response.id), Ok(response.result)),
            Message::Error(error) => self.complete(error.id, Err(error.error.into())),
            Message::Request(request) => self.dispatch_request(request).await,
            Message::Notification(notification) => {
                self.dispatch_notification(notification).await
            }
        }
    }

    async fn dispatch_request(self: &Arc<Self>, request: Request) {
        let Request {
            method, params, id, ..
        } = request;
        log::debug!("<- request {} '{}'", id, method);

        let handler = self.request_handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            let error = ResponseError::new(
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", method),
            );
            self.reply(Message::Error(ErrorResponse::new(Some(id), error)))
                .await;
            return;
        };

        let ctx = RequestContext {
            id: id.clone(),
            method,
            progress_token: progress_token_of(params.as_ref()),
            dispatcher: self.clone(),
        };

        // handlers run on their own task, so a panic only takes down the task
        let mut inflight = self.inflight.lock().await;
        let task = tokio::spawn(async move { handler.handle(ctx, params).await });
        inflight.insert(id.clone(), task.abort_handle());
        drop(inflight);

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            dispatcher.inflight.lock().await.remove(&id);
            let message = match outcome {
                Ok(Ok(result)) => Message::Response(Response::success(id, result)),
                Ok(Err(e)) => {
                    log::debug!("request {} failed: {}", id, e);
                    Message::Error(ErrorResponse::new(Some(id), e.into()))
                }
                Err(e) if e.is_cancelled() => {
                    log::debug!("request {} was cancelled", id);
                    return;
                }
                Err(e) => {
                    log::error!("handler for request {} panicked: {}", id, e);
                    let error =
                        ResponseError::new(ErrorCode::InternalError, "request handler panicked");
                    Message::Error(ErrorResponse::new(Some(id), error))
                }
            };
            dispatcher.reply(message).await;
        });
    }

    async fn dispatch_notification(&self, notification: Notification) {
        let Notification { method, params, .. } = notification;
        log::debug!("<- notification '{}'", method);

        match method.as_str() {
            methods::CANCELLED => {
                self.cancel_inbound(params.clone()).await;
            }
            methods::PROGRESS | methods::PROGRESS_LEGACY => {
                if self.route_progress(params.clone()) {
                    return;
                }
            }
            _ => {}
        }

        let listeners = self
            .notification_handlers
            .read()
            .await
            .get(&method)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            log::debug!("no listener for notification '{}'", method);
        }
        // awaited in turn, so listeners observe notifications in arrival order
        for listener in listeners {
            if let Err(e) = listener.handle(params.clone()).await {
                log::warn!("listener for '{}' failed: {}", method, e);
            }
        }
    }

    /// Returns `true` when a progress stream took the update
    fn route_progress(&self, params: Option<Value>) -> bool {
        let progress: Progress = match params.map(serde_json::from_value).transpose() {
            Ok(Some(progress)) => progress,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("ignoring malformed progress notification: {}", e);
                return false;
            }
        };
        let mut streams = lock(&self.progress);
        let Some(tx) = streams.get(&progress.progress_token) else {
            return false;
        };
        let token = progress.progress_token.clone();
        if tx.send(progress).is_err() {
            streams.remove(&token);
            return false;
        }
        true
    }

    async fn cancel_inbound(&self, params: Option<Value>) {
        let cancelled: CancelledNotification = match params.map(serde_json::from_value) {
            Some(Ok(cancelled)) => cancelled,
            _ => {
                log::warn!("ignoring malformed cancellation");
                return;
            }
        };
        match self.inflight.lock().await.remove(&cancelled.request_id) {
            Some(handle) => {
                log::debug!(
                    "peer cancelled request {}: {}",
                    cancelled.request_id,
                    cancelled.reason.as_deref().unwrap_or("no reason given")
                );
                handle.abort();
            }
            None => log::debug!(
                "cancellation for request {} which is not running",
                cancelled.request_id
            ),
        }
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.send_message(&message).await {
            log::warn!("failed to send reply: {}", e);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn outcome_of(
    outcome: Result<Result<Value, Error>, oneshot::error::RecvError>,
) -> Result<Value, Error> {
    outcome.unwrap_or(Err(Error::Cancelled(CancelReason::TransportClosed)))
}

fn progress_token_of(params: Option<&Value>) -> Option<ProgressToken> {
    let token = params?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameStream, MemoryTransport};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// A dispatcher wired to a read pump, plus the raw peer end
    fn setup() -> (Arc<Dispatcher>, MemoryTransport, FrameStream) {
        let (ours, peer) = MemoryTransport::pair();
        let ours: Arc<dyn Transport> = Arc::new(ours);
        let dispatcher = Arc::new(Dispatcher::new(ours.clone()));

        let pump = dispatcher.clone();
        tokio::spawn(async move {
            let mut inbound = ours.receive();
            while let Some(Ok(frame)) = inbound.next().await {
                if let Ok(message) = codec::decode(&frame) {
                    pump.dispatch(message).await;
                }
            }
        });

        let peer_in = peer.receive();
        (dispatcher, peer, peer_in)
    }

    async fn next_message(stream: &mut FrameStream) -> Message {
        let frame = stream.next().await.unwrap().unwrap();
        codec::decode(&frame).unwrap()
    }

    async fn send(peer: &MemoryTransport, message: Message) {
        peer.send(codec::encode(&message).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (dispatcher, peer, mut peer_in) = setup();

        let first = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("first", None, Duration::from_secs(5)).await })
        };
        let Message::Request(req_a) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        let second = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("second", None, Duration::from_secs(5)).await })
        };
        let Message::Request(req_b) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        assert_eq!(req_a.id, RequestId::Number(1));
        assert_eq!(req_b.id, RequestId::Number(2));

        send(&peer, Message::Response(Response::success(req_b.id, json!("b")))).await;
        send(&peer, Message::Response(Response::success(req_a.id, json!("a")))).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_becomes_rpc_error() {
        let (dispatcher, peer, mut peer_in) = setup();

        let call = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("tools/call", None, Duration::from_secs(5)).await })
        };
        let Message::Request(req) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        let error = ResponseError::new(ErrorCode::InvalidParams, "bad arguments");
        send(&peer, Message::Error(ErrorResponse::new(Some(req.id), error))).await;

        match call.await.unwrap() {
            Err(Error::Rpc { code, message, .. }) => {
                assert_eq!(code, ErrorCode::InvalidParams);
                assert_eq!(message, "bad arguments");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_discards_late_response() {
        let (dispatcher, peer, mut peer_in) = setup();

        let result = dispatcher
            .call("slow", None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout { ref method, .. }) if method == "slow"));

        let Message::Request(req) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        match next_message(&mut peer_in).await {
            Message::Notification(n) => {
                assert_eq!(n.method, methods::CANCELLED);
                assert_eq!(n.params.unwrap()["requestId"], json!(1));
            }
            other => panic!("expected a cancellation, got {:?}", other),
        }

        send(&peer, Message::Response(Response::success(req.id, json!("late")))).await;

        // the id is not reused, and the late response does not leak into the next call
        let next = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("fast", None, Duration::from_secs(5)).await })
        };
        let Message::Request(req) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        assert_eq!(req.id, RequestId::Number(2));
        send(&peer, Message::Response(Response::success(req.id, json!("ok")))).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("ok"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_huge_timeout_waits_for_the_response() {
        let (dispatcher, peer, mut peer_in) = setup();

        let call = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("slow", None, Duration::MAX).await })
        };
        let Message::Request(req) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        send(&peer, Message::Response(Response::success(req.id, json!("eventually")))).await;

        assert_eq!(call.await.unwrap().unwrap(), json!("eventually"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_its_entry() {
        let (dispatcher, peer, mut peer_in) = setup();

        let call = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("abandoned", None, Duration::from_secs(30)).await })
        };
        let Message::Request(req) = next_message(&mut peer_in).await else {
            panic!("expected a request");
        };
        assert_eq!(dispatcher.pending_count(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.expired_count(), 1);

        // the answer is recognised as late and dropped
        send(&peer, Message::Response(Response::success(req.id, json!("late")))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.expired_count(), 0);
    }

    #[test]
    fn test_expired_ids_are_bounded() {
        let mut table = PendingTable::default();
        for n in 0..(MAX_EXPIRED as i64 + 10) {
            table.expire(RequestId::Number(n));
        }
        assert_eq!(table.expired.len(), MAX_EXPIRED);
        assert!(!table.expired.contains(&RequestId::Number(0)));
        assert!(table.expired.contains(&RequestId::Number(MAX_EXPIRED as i64 + 9)));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_pending_and_new_calls() {
        let (dispatcher, _peer, mut peer_in) = setup();

        let pending = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call("wait", None, Duration::from_secs(30)).await })
        };
        next_message(&mut peer_in).await;

        dispatcher.cancel_all(CancelReason::SessionClosing).await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::Cancelled(CancelReason::SessionClosing))
        ));
        assert!(matches!(
            dispatcher.call("after", None, Duration::from_secs(1)).await,
            Err(Error::Cancelled(CancelReason::SessionClosing))
        ));
    }

    #[tokio::test]
    async fn test_inbound_requests_are_answered() {
        let (dispatcher, peer, mut peer_in) = setup();
        dispatcher
            .on_request("echo", |_ctx: RequestContext, params: Option<Value>| async move {
                Ok::<Value, Error>(params.unwrap_or(Value::Null))
            })
            .await
            .unwrap();
        dispatcher
            .on_request("strict", |_ctx: RequestContext, _params: Option<Value>| async move {
                Err::<Value, Error>(Error::Validation("missing 'uri'".to_string()))
            })
            .await
            .unwrap();
        dispatcher
            .on_request("broken", |_ctx: RequestContext, _params: Option<Value>| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<Value, Error>(Value::Null)
            })
            .await
            .unwrap();
        assert!(matches!(
            dispatcher
                .on_request("echo", |_ctx: RequestContext, _p: Option<Value>| async move {
                    Ok::<Value, Error>(Value::Null)
                })
                .await,
            Err(Error::DuplicateRegistration(_))
        ));

        let cases = [
            ("echo", Some(json!({"x": 1}))),
            ("strict", None),
            ("broken", None),
            ("missing", None),
        ];
        for (i, (method, params)) in cases.into_iter().enumerate() {
            let id = RequestId::Number(100 + i as i64);
            send(&peer, Message::Request(Request::new(method, params, id))).await;
            let reply = next_message(&mut peer_in).await;
            match (method, reply) {
                ("echo", Message::Response(r)) => assert_eq!(r.result, json!({"x": 1})),
                ("strict", Message::Error(e)) => assert_eq!(e.error.code, -32602),
                ("broken", Message::Error(e)) => assert_eq!(e.error.code, -32603),
                ("missing", Message::Error(e)) => {
                    assert_eq!(e.error.code, -32601);
                    assert_eq!(e.id, Some(RequestId::Number(103)));
                }
                (method, reply) => panic!("unexpected reply to {}: {:?}", method, reply),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_can_cancel_running_handler() {
        let (dispatcher, peer, _peer_in) = setup();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        let dropped_tx = Arc::new(Mutex::new(Some(dropped_tx)));

        dispatcher
            .on_request("hang", move |_ctx: RequestContext, _p: Option<Value>| {
                let dropped_tx = dropped_tx.clone();
                async move {
                    // dropping the sender tells the test the task was torn down
                    let _guard = dropped_tx.lock().await.take();
                    std::future::pending::<()>().await;
                    Ok::<Value, Error>(Value::Null)
                }
            })
            .await
            .unwrap();

        send(
            &peer,
            Message::Request(Request::new("hang", None, RequestId::from("job-1"))),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(
            &peer,
            Message::Notification(Notification::new(
                methods::CANCELLED,
                Some(json!({"requestId": "job-1", "reason": "user abort"})),
            )),
        )
        .await;

        tokio::time::timeout(Duration::from_secs(1), dropped_rx)
            .await
            .expect("handler was not cancelled")
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_progress_goes_to_stream_then_listeners() {
        let (dispatcher, peer, _peer_in) = setup();
        let token = ProgressToken::String("t-1".to_string());
        let mut stream = dispatcher.register_progress(token);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dispatcher
            .on_notification(methods::PROGRESS, move |params: Option<Value>| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(params);
                    Ok::<(), Error>(())
                }
            })
            .await;

        send(
            &peer,
            Message::Notification(Notification::new(
                methods::PROGRESS_LEGACY,
                Some(json!({"progressToken": "t-1", "progress": 1, "total": 2})),
            )),
        )
        .await;
        let progress = stream.rx.recv().await.unwrap();
        assert_eq!(progress.progress, 1.0);
        assert_eq!(progress.total, Some(2.0));

        send(
            &peer,
            Message::Notification(Notification::new(
                methods::PROGRESS,
                Some(json!({"progressToken": "other", "progress": 5})),
            )),
        )
        .await;
        let params = seen_rx.recv().await.unwrap().unwrap();
        assert_eq!(params["progressToken"], json!("other"));
    }

    #[tokio::test]
    async fn test_dropped_progress_receiver_unroutes_its_token() {
        let (dispatcher, peer, _peer_in) = setup();
        let token = ProgressToken::String("t-2".to_string());
        let receiver = dispatcher.register_progress(token.clone());
        assert!(lock(&dispatcher.progress).contains_key(&token));

        drop(receiver);
        assert!(lock(&dispatcher.progress).is_empty());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dispatcher
            .on_notification(methods::PROGRESS, move |params: Option<Value>| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(params);
                    Ok::<(), Error>(())
                }
            })
            .await;
        send(
            &peer,
            Message::Notification(Notification::new(
                methods::PROGRESS,
                Some(json!({"progressToken": "t-2", "progress": 1})),
            )),
        )
        .await;
        let params = seen_rx.recv().await.unwrap().unwrap();
        assert_eq!(params["progressToken"], json!("t-2"));
    }

    #[test]
    fn test_progress_token_extraction() {
        let params = json!({"name": "x", "_meta": {"progressToken": 7}});
        assert_eq!(progress_token_of(Some(&params)), Some(ProgressToken::Number(7)));
        assert_eq!(progress_token_of(Some(&json!({"name": "x"}))), None);
        assert_eq!(progress_token_of(None), None);
    }
}
