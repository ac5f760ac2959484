//! WebSocket transport
//!
//! One JSON-RPC message per text (or binary) frame. Works over any socket
//! tokio-tungstenite can drive: [`WebSocketTransport::connect`] dials a `ws://`
//! or `wss://` URL, [`WebSocketTransport::from_stream`] wraps a socket the host
//! already upgraded.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::{closed, CloseSignal, FrameReader, FrameStream, Transport};
use crate::error::Error;

const FRAME_BUFFER_SIZE: usize = 100;

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

pub struct WebSocketTransport<S> {
    sink: Mutex<Option<WsSink<S>>>,
    reader: FrameReader,
    signal: CloseSignal,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Dials a WebSocket server
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)
            .map_err(|e| Error::Transport(format!("invalid websocket url '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Transport(format!(
                "unsupported websocket scheme '{}'",
                url.scheme()
            )));
        }

        log::debug!("connecting to {}", url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("websocket connect failed: {}", e)))?;

        Ok(Self::from_stream(ws_stream))
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket connection
    pub fn from_stream(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::channel(FRAME_BUFFER_SIZE);
        let signal = CloseSignal::new();

        let closed_rx = signal.subscribe();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = stream.next() => msg,
                    _ = closed(closed_rx.clone()) => None,
                };
                let frame = match msg {
                    Some(Ok(WsMessage::Text(text))) => Bytes::from(text),
                    Some(Ok(WsMessage::Binary(data))) => Bytes::from(data),
                    Some(Ok(WsMessage::Close(_))) => {
                        log::info!("websocket closed by peer");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::debug!("error reading from websocket: {}", e);
                        break;
                    }
                    None => break,
                };
                if tx.send(frame).await.is_err() {
                    log::debug!("frame receiver dropped, stopping websocket reader");
                    break;
                }
            }
        });

        Self {
            sink: Mutex::new(Some(sink)),
            reader: FrameReader::new(rx, signal.clone()),
            signal,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: Bytes) -> Result<(), Error> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| Error::Transport(format!("frame is not valid UTF-8: {}", e)))?;
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| Error::Transport("transport is closed".to_string()))?;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::Transport(format!("websocket send failed: {}", e)))
    }

    fn receive(&self) -> FrameStream {
        self.reader.stream()
    }

    async fn close(&self) -> Result<(), Error> {
        self.signal.close();
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                log::debug!("error sending websocket close frame: {}", e);
            }
        }
        Ok(())
    }
}
