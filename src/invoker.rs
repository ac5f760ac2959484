//! Tool, resource and prompt operations against a connected peer
//!
//! Every operation checks the negotiated capability first. Tool calls also
//! validate their arguments against the tool's `inputSchema` before anything
//! is written to the transport.

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use crate::{
    dispatcher::ProgressReceiver,
    error::Error,
    protocol::methods,
    registry::Capability,
    schema,
    session::Session,
    types::{
        CallToolParams, CallToolResult, Cursor, GetPromptParams, GetPromptResult,
        ListPromptsResult, ListResourcesResult, ListToolsResult, LoggingLevel, PaginatedParams,
        Progress, ProgressToken, Prompt, ReadResourceParams, ReadResourceResult, RequestMeta,
        Resource, ToolDescriptor,
    },
};

/// One item of a streaming tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Progress(Progress),
    /// The final result; always the last event
    Completed(CallToolResult),
}

type CallFuture = Pin<Box<dyn Future<Output = Result<CallToolResult, Error>> + Send>>;

/// Progress updates of a running tool call, followed by its result.
///
/// Nothing is sent until the stream is first polled. Dropping the stream
/// abandons the call and stops routing its progress.
pub struct ToolCallStream {
    progress: ProgressReceiver,
    call: Option<CallFuture>,
    outcome: Option<Result<CallToolResult, Error>>,
    done: bool,
}

impl Stream for ToolCallStream {
    type Item = Result<ToolEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Poll::Ready(Some(progress)) = this.progress.poll_recv(cx) {
            return Poll::Ready(Some(Ok(ToolEvent::Progress(progress))));
        }

        if let Some(call) = this.call.as_mut() {
            match call.as_mut().poll(cx) {
                Poll::Ready(outcome) => {
                    this.call = None;
                    this.outcome = Some(outcome);
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        // updates that arrived just ahead of the response still come first
        if let Some(progress) = this.progress.try_recv() {
            return Poll::Ready(Some(Ok(ToolEvent::Progress(progress))));
        }

        this.done = true;
        match this.outcome.take() {
            Some(outcome) => Poll::Ready(Some(outcome.map(ToolEvent::Completed))),
            None => Poll::Ready(None),
        }
    }
}

#[derive(Clone)]
pub struct Invoker {
    session: Session,
}

impl Invoker {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn require(&self, capability: Capability) -> Result<(), Error> {
        self.session.registry().read().await.require(capability)
    }

    /// Resolves the descriptor and validates `arguments` against it.
    ///
    /// Missing arguments (`null`) are sent as an empty object.
    async fn prepare_tool_call(&self, name: &str, arguments: Value) -> Result<Value, Error> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        self.require(Capability::Tools).await?;
        let registry = self.session.registry().read().await;
        let descriptor = registry
            .tool(name)
            .ok_or_else(|| Error::Validation(format!("unknown tool '{}'", name)))?;
        schema::validate(&descriptor.input_schema, &arguments).map_err(|e| match e {
            Error::Validation(reason) => {
                Error::Validation(format!("invalid arguments for '{}': {}", name, reason))
            }
            other => other,
        })?;
        Ok(arguments)
    }

    /// Calls a tool and waits for its result
    pub async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        let arguments = self.prepare_tool_call(name, arguments).await?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        let result = self
            .session
            .call(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Calls a tool with a fresh progress token attached.
    ///
    /// Validation happens up front; the request itself goes out when the
    /// returned stream is first polled.
    pub async fn invoke_tool_streaming(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallStream, Error> {
        let arguments = self.prepare_tool_call(name, arguments).await?;

        let token = ProgressToken::random();
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
            meta: Some(RequestMeta {
                progress_token: Some(token.clone()),
            }),
        })?;
        let progress = self.session.dispatcher().register_progress(token.clone());

        let session = self.session.clone();
        let call = Box::pin(async move {
            let outcome = session.call(methods::TOOLS_CALL, Some(params)).await;
            session.dispatcher().unregister_progress(&token);
            let result: CallToolResult = serde_json::from_value(outcome?)?;
            Ok::<_, Error>(result)
        });

        Ok(ToolCallStream {
            progress,
            call: Some(call),
            outcome: None,
            done: false,
        })
    }

    /// Fetches the peer's full tool catalog and caches it for argument validation
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        self.require(Capability::Tools).await?;
        let tools = self
            .paginate(methods::TOOLS_LIST, |page: ListToolsResult| {
                (page.tools, page.next_cursor)
            })
            .await?;
        self.session
            .registry()
            .write()
            .await
            .cache_remote_tools(tools.iter().cloned());
        Ok(tools)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, Error> {
        self.require(Capability::Resources).await?;
        self.paginate(methods::RESOURCES_LIST, |page: ListResourcesResult| {
            (page.resources, page.next_cursor)
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, Error> {
        self.require(Capability::Resources).await?;
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = self
            .session
            .call(methods::RESOURCES_READ, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Asks to be notified when a resource changes; needs the `subscribe` feature
    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), Error> {
        let subscribable = self
            .session
            .is_supported(Capability::Resources, Some("subscribe"))
            .await;
        if !subscribable {
            return Err(Error::NotNegotiated(Capability::Resources));
        }
        self.session
            .call(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, Error> {
        self.require(Capability::Prompts).await?;
        self.paginate(methods::PROMPTS_LIST, |page: ListPromptsResult| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, Error> {
        self.require(Capability::Prompts).await?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .session
            .call(methods::PROMPTS_GET, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> Result<(), Error> {
        self.require(Capability::Logging).await?;
        self.session
            .call(methods::LOGGING_SET_LEVEL, Some(json!({ "level": level })))
            .await?;
        Ok(())
    }

    async fn paginate<T, P>(
        &self,
        method: &str,
        split: impl Fn(P) -> (Vec<T>, Option<Cursor>),
    ) -> Result<Vec<T>, Error>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<Cursor> = None;
        let mut seen: HashSet<Cursor> = HashSet::new();
        loop {
            let params = PaginatedParams {
                cursor: cursor.clone(),
            };
            let page = self
                .session
                .call(method, Some(serde_json::to_value(params)?))
                .await?;
            let (page_items, next) = split(serde_json::from_value(page)?);
            items.extend(page_items);
            match next {
                Some(next) if !seen.insert(next.clone()) => {
                    log::warn!("'{}' returned cursor {:?} again, stopping", method, next);
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    fn stream_of(
        updates: Vec<Progress>,
        outcome: Result<CallToolResult, Error>,
    ) -> ToolCallStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for update in updates {
            tx.send(update).unwrap();
        }
        ToolCallStream {
            progress: ProgressReceiver::detached(rx),
            call: Some(Box::pin(async move {
                drop(tx);
                outcome
            })),
            outcome: None,
            done: false,
        }
    }

    fn update(progress: f64) -> Progress {
        Progress {
            progress_token: ProgressToken::Number(1),
            progress,
            total: Some(2.0),
            message: None,
        }
    }

    #[tokio::test]
    async fn test_stream_yields_progress_before_completion() {
        let stream = stream_of(vec![update(1.0), update(2.0)], Ok(CallToolResult::text("done")));
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Ok(ToolEvent::Progress(p)) if p.progress == 1.0));
        assert!(matches!(&events[1], Ok(ToolEvent::Progress(p)) if p.progress == 2.0));
        match &events[2] {
            Ok(ToolEvent::Completed(result)) => assert_eq!(result.joined_text(), "done"),
            other => panic!("unexpected final event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_after_error() {
        let mut stream = stream_of(vec![], Err(Error::Validation("nope".to_string())));
        assert!(matches!(stream.next().await, Some(Err(Error::Validation(_)))));
        assert!(stream.next().await.is_none());
    }
}
