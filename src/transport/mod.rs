//! Transport layer
//!
//! A transport moves opaque frames, each one JSON-RPC message, between two
//! peers. Framing is the transport's business (newline-delimited for stdio,
//! event-stream events for SSE, one message per WebSocket frame); the session
//! above only ever sees whole frames.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{pin::Pin, sync::Arc};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::Error;

pub mod memory;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use memory::MemoryTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Stream of inbound frames produced by [`Transport::receive`]
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Duplex frame channel underneath a session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame, failing with [`Error::Transport`] once the channel is broken
    async fn send(&self, frame: Bytes) -> Result<(), Error>;

    /// Creates the stream of inbound frames.
    ///
    /// The stream runs until the peer goes away or [`Transport::close`] is called.
    /// It can only be taken once; later calls yield a single error.
    fn receive(&self) -> FrameStream;

    /// Closes the transport. Calling it more than once is harmless.
    async fn close(&self) -> Result<(), Error>;
}

/// Signals the inbound side of a transport to stop
#[derive(Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` only for the first caller
    pub(crate) fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once the signal has fired
pub(crate) async fn closed(mut rx: watch::Receiver<bool>) {
    // the sender lives as long as the transport, so an error means it was dropped
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Inbound half shared by the channel-backed transports
pub(crate) struct FrameReader {
    inbound: Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>,
    signal: CloseSignal,
}

enum ReadState {
    Pending(Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>, watch::Receiver<bool>),
    Open(mpsc::Receiver<Bytes>, watch::Receiver<bool>),
    Done,
}

impl FrameReader {
    pub(crate) fn new(inbound: mpsc::Receiver<Bytes>, signal: CloseSignal) -> Self {
        Self {
            inbound: Arc::new(Mutex::new(Some(inbound))),
            signal,
        }
    }

    pub(crate) fn stream(&self) -> FrameStream {
        let state = ReadState::Pending(self.inbound.clone(), self.signal.subscribe());
        Box::pin(futures::stream::unfold(state, |state| async move {
            let (mut rx, closed_rx) = match state {
                ReadState::Done => return None,
                ReadState::Open(rx, closed_rx) => (rx, closed_rx),
                ReadState::Pending(slot, closed_rx) => match slot.lock().await.take() {
                    Some(rx) => (rx, closed_rx),
                    None => {
                        return Some((
                            Err(Error::Transport(
                                "inbound stream was already taken".to_string(),
                            )),
                            ReadState::Done,
                        ))
                    }
                },
            };
            if *closed_rx.borrow() {
                return None;
            }
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                _ = closed(closed_rx.clone()) => None,
            };
            frame.map(|frame| (Ok(frame), ReadState::Open(rx, closed_rx)))
        }))
    }
}
