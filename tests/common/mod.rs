#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mcp_engine::{
    transport::{FrameStream, MemoryTransport, Transport},
    Error,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::{
    sync::mpsc,
    time::{timeout, Duration},
};

type Script = dyn Fn(&Value) -> Vec<Value> + Send + Sync;

/// A peer that answers every frame it is sent according to a script.
///
/// Everything sent through it is recorded, so tests can check what went out on
/// the wire.
pub struct ScriptedTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    script: Arc<Script>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedTransport {
    pub fn new(script: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            outbound: Mutex::new(Some(tx)),
            inbox: Mutex::new(Some(rx)),
            script: Arc::new(script),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle on the frames sent so far
    pub fn sent(&self) -> Arc<Mutex<Vec<Value>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, frame: Bytes) -> Result<(), Error> {
        let value: Value = serde_json::from_slice(&frame)?;
        self.sent.lock().unwrap().push(value.clone());
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx
                .send(value)
                .map_err(|_| Error::Transport("script stopped".to_string())),
            None => Err(Error::Transport("transport is closed".to_string())),
        }
    }

    fn receive(&self) -> FrameStream {
        let rx = self.inbox.lock().unwrap().take();
        let script = self.script.clone();
        Box::pin(async_stream::stream! {
            match rx {
                None => {
                    yield Err(Error::Transport("inbound stream was already taken".to_string()));
                }
                Some(mut rx) => {
                    while let Some(frame) = rx.recv().await {
                        for reply in script(&frame) {
                            yield Ok(Bytes::from(serde_json::to_vec(&reply).unwrap()));
                        }
                    }
                }
            }
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.outbound.lock().unwrap().take();
        Ok(())
    }
}

pub fn reply(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
}

/// Script that completes the handshake as a server advertising `capabilities`
pub fn handshake(
    version: &'static str,
    capabilities: Value,
) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
    move |frame: &Value| {
        (frame["method"] == "initialize").then(|| {
            reply(
                frame,
                json!({
                    "protocolVersion": version,
                    "capabilities": capabilities,
                    "serverInfo": {"name": "scripted", "version": "0.0.1"},
                }),
            )
        })
    }
}

/// Sends a raw JSON value as one frame
pub async fn send_json(transport: &MemoryTransport, value: Value) {
    transport
        .send(Bytes::from(serde_json::to_vec(&value).unwrap()))
        .await
        .unwrap();
}

/// Next inbound frame as JSON, failing the test after two seconds
pub async fn next_json(inbound: &mut FrameStream) -> Value {
    let frame = timeout(Duration::from_secs(2), inbound.next())
        .await
        .expect("no frame within two seconds")
        .expect("stream ended")
        .unwrap();
    serde_json::from_slice(&frame).unwrap()
}
