//! HTTP + Server-Sent Events transport
//!
//! The HTTP plumbing belongs to the host. This transport only deals with the
//! event-stream framing on top of it:
//!
//! - client side: raw response body chunks come in, decoded `message` events
//!   become inbound frames, and outbound frames are handed back to the host to
//!   POST to the endpoint the server announced in its `endpoint` event.
//! - server side: POSTed bodies come in as frames, outbound frames leave as
//!   encoded `message` events ready to be written to the open response.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use url::Url;

use super::{closed, CloseSignal, FrameReader, FrameStream, Transport};
use crate::error::Error;

const FRAME_BUFFER_SIZE: usize = 100;

pub const MESSAGE_EVENT: &str = "message";
pub const ENDPOINT_EVENT: &str = "endpoint";

/// One dispatched event-stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
///
/// Chunks may split lines (and `\r\n` pairs) anywhere; an event is only
/// dispatched once its terminating blank line has been seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
            // a lone trailing \r may be the first half of \r\n
            if self.buffer[pos] == b'\r' && pos + 1 == self.buffer.len() {
                break;
            }
            let line = self.buffer.split_to(pos);
            let mut delimiter = 1;
            if self.buffer[0] == b'\r' && self.buffer.get(1) == Some(&b'\n') {
                delimiter = 2;
            }
            let _ = self.buffer.split_to(delimiter);

            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {}
            other => log::trace!("ignoring event-stream field '{}'", other),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| MESSAGE_EVENT.to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

/// Encodes one event in `text/event-stream` form
pub fn encode_event(event: &str, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + event.len() + 16);
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

enum Role {
    Client { endpoint: watch::Receiver<Option<String>> },
    Server,
}

pub struct SseTransport {
    role: Role,
    outbound: mpsc::Sender<Bytes>,
    reader: FrameReader,
    signal: CloseSignal,
}

impl SseTransport {
    /// Client side of an SSE connection.
    ///
    /// `body_chunks` carries the raw event-stream response body. Frames sent on
    /// the transport come out of `posts`, unframed, once the server has
    /// announced its endpoint.
    pub fn client(body_chunks: mpsc::Receiver<Bytes>, posts: mpsc::Sender<Bytes>) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER_SIZE);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let signal = CloseSignal::new();

        tokio::spawn(decode_body(
            body_chunks,
            frames_tx,
            endpoint_tx,
            signal.clone(),
        ));

        Self {
            role: Role::Client {
                endpoint: endpoint_rx,
            },
            outbound: posts,
            reader: FrameReader::new(frames_rx, signal.clone()),
            signal,
        }
    }

    /// Server side of an SSE connection.
    ///
    /// `posts` carries the bodies of POSTs received at the endpoint; encoded
    /// events for the open response go out on `events`.
    pub fn server(posts: mpsc::Receiver<Bytes>, events: mpsc::Sender<Bytes>) -> Self {
        let signal = CloseSignal::new();
        Self {
            role: Role::Server,
            outbound: events,
            reader: FrameReader::new(posts, signal.clone()),
            signal,
        }
    }

    /// Tells the client where to POST its messages. Server side only.
    pub async fn announce_endpoint(&self, endpoint: &str) -> Result<(), Error> {
        if !matches!(self.role, Role::Server) {
            return Err(Error::InvalidState(
                "only the server side announces an endpoint".to_string(),
            ));
        }
        self.outbound
            .send(encode_event(ENDPOINT_EVENT, endpoint))
            .await
            .map_err(|_| Error::Transport("event stream is gone".to_string()))
    }

    /// The endpoint announced by the server, if it has done so yet
    pub fn endpoint(&self) -> Option<String> {
        match &self.role {
            Role::Client { endpoint } => endpoint.borrow().clone(),
            Role::Server => None,
        }
    }

    /// Resolves the announced endpoint against the URL the stream was opened on
    pub fn endpoint_url(&self, base: &Url) -> Result<Option<Url>, Error> {
        self.endpoint()
            .map(|endpoint| {
                base.join(&endpoint)
                    .map_err(|e| Error::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))
            })
            .transpose()
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, frame: Bytes) -> Result<(), Error> {
        if self.signal.is_closed() {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        let payload = match &self.role {
            Role::Client { endpoint } => {
                let mut endpoint = endpoint.clone();
                let announced = async move { endpoint.wait_for(Option::is_some).await.is_ok() };
                tokio::select! {
                    announced = announced => {
                        if !announced {
                            return Err(Error::Transport(
                                "event stream ended before an endpoint was announced".to_string(),
                            ));
                        }
                    }
                    _ = closed(self.signal.subscribe()) => {
                        return Err(Error::Transport("transport is closed".to_string()));
                    }
                }
                frame
            }
            Role::Server => {
                let data = String::from_utf8_lossy(&frame);
                encode_event(MESSAGE_EVENT, &data)
            }
        };
        self.outbound
            .send(payload)
            .await
            .map_err(|_| Error::Transport("outbound channel is gone".to_string()))
    }

    fn receive(&self) -> FrameStream {
        self.reader.stream()
    }

    async fn close(&self) -> Result<(), Error> {
        if self.signal.close() {
            log::debug!("sse transport closed");
        }
        Ok(())
    }
}

async fn decode_body(
    mut body_chunks: mpsc::Receiver<Bytes>,
    frames: mpsc::Sender<Bytes>,
    endpoint: watch::Sender<Option<String>>,
    signal: CloseSignal,
) {
    let mut decoder = SseDecoder::new();
    let mut closed_rx = signal.subscribe();
    loop {
        let chunk = tokio::select! {
            chunk = body_chunks.recv() => chunk,
            _ = closed_rx.wait_for(|closed| *closed) => None,
        };
        let Some(chunk) = chunk else { break };

        for event in decoder.feed(&chunk) {
            match event.event.as_str() {
                ENDPOINT_EVENT => {
                    log::debug!("server announced endpoint {}", event.data);
                    endpoint.send_replace(Some(event.data));
                }
                MESSAGE_EVENT => {
                    if frames.send(Bytes::from(event.data)).await.is_err() {
                        return;
                    }
                }
                other => log::debug!("ignoring '{}' event", other),
            }
        }
    }
    log::debug!("event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: mess").is_empty());
        assert!(decoder.feed(b"age\r").is_empty());
        assert!(decoder.feed(b"\ndata: {\"a\"").is_empty());
        let events = decoder.feed(b":1}\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".to_string(),
                data: "{\"a\":1}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_decoder_joins_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\ndata: one\ndata:two\nid: 7\n\nevent: endpoint\ndata: /post\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "one\ntwo");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[1].event, "endpoint");
        assert_eq!(events[1].data, "/post");
    }

    #[test]
    fn test_encode_event_splits_lines() {
        assert_eq!(
            encode_event("message", "a\nb"),
            Bytes::from_static(b"event: message\ndata: a\ndata: b\n\n")
        );
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(&encode_event("message", "{\"x\":1}"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_client_waits_for_endpoint_then_posts() {
        let (body_tx, body_rx) = mpsc::channel(8);
        let (posts_tx, mut posts_rx) = mpsc::channel(8);
        let transport = SseTransport::client(body_rx, posts_tx);
        let mut inbound = transport.receive();

        body_tx
            .send(Bytes::from_static(b"event: endpoint\ndata: /messages?session=1\n\n"))
            .await
            .unwrap();
        body_tx
            .send(Bytes::from_static(b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n\n"))
            .await
            .unwrap();

        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}")
        );
        assert_eq!(transport.endpoint().as_deref(), Some("/messages?session=1"));

        let base = Url::parse("http://localhost:8080/sse").unwrap();
        assert_eq!(
            transport.endpoint_url(&base).unwrap().unwrap().as_str(),
            "http://localhost:8080/messages?session=1"
        );

        transport.send(Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(posts_rx.recv().await, Some(Bytes::from_static(b"{}")));
    }

    #[tokio::test]
    async fn test_server_encodes_outbound_frames() {
        let (posts_tx, posts_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let transport = SseTransport::server(posts_rx, events_tx);
        let mut inbound = transport.receive();

        transport.announce_endpoint("/messages").await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(Bytes::from_static(b"event: endpoint\ndata: /messages\n\n"))
        );

        posts_tx.send(Bytes::from_static(b"{\"id\":1}")).await.unwrap();
        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"id\":1}")
        );

        transport.send(Bytes::from_static(b"{\"id\":2}")).await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(Bytes::from_static(b"event: message\ndata: {\"id\":2}\n\n"))
        );

        transport.close().await.unwrap();
        assert!(inbound.next().await.is_none());
    }
}
