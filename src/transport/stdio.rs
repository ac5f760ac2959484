//! Standard I/O transport
//!
//! Frames travel as newline-delimited JSON over a pair of byte streams. The
//! transport can sit on top of:
//! - the current process' stdin/stdout, for servers launched by a host
//! - a spawned child process, for clients driving a local server
//! - any pair of async readers/writers, or plain line channels
//!
//! Reading and writing happen on background tasks; the transport itself only
//! exchanges frames with them over Tokio channels.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    Mutex,
};

use super::{CloseSignal, FrameReader, FrameStream, Transport};
use crate::{
    error::Error,
    process::{read_lines, write_lines, ProcessManager},
};

const LINE_BUFFER_SIZE: usize = 100;

pub struct StdioTransport {
    reader: FrameReader,
    write_connection: Sender<Bytes>,
    signal: CloseSignal,
    process: Option<Mutex<ProcessManager>>,
}

impl StdioTransport {
    /// Creates a transport over line channels.
    ///
    /// `read` yields one frame per line with the delimiter already stripped;
    /// frames sent on the transport go out on `write`.
    pub fn new(read: Receiver<Bytes>, write: Sender<Bytes>) -> Self {
        let signal = CloseSignal::new();
        Self {
            reader: FrameReader::new(read, signal.clone()),
            write_connection: write,
            signal,
            process: None,
        }
    }

    /// Creates a transport over an arbitrary reader/writer pair
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(LINE_BUFFER_SIZE);
        let (out_tx, out_rx) = mpsc::channel(LINE_BUFFER_SIZE);
        tokio::spawn(read_lines(reader, in_tx));
        tokio::spawn(write_lines(writer, out_rx));
        Self::new(in_rx, out_tx)
    }

    /// Creates a transport over this process' stdin and stdout
    pub fn stdio() -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawns `command` and talks to it over its stdin and stdout.
    ///
    /// The child is killed when the transport is closed or dropped.
    pub async fn spawn(command: Command) -> Result<Self, Error> {
        let (output_tx, output_rx) = mpsc::channel(LINE_BUFFER_SIZE);
        let mut manager = ProcessManager::new();
        let process_tx = manager.start_process(command, output_tx).await?;

        let mut transport = Self::new(output_rx, process_tx);
        transport.process = Some(Mutex::new(manager));
        Ok(transport)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: Bytes) -> Result<(), Error> {
        if self.signal.is_closed() {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        self.write_connection
            .send(frame)
            .await
            .map_err(|_| Error::Transport("output stream is gone".to_string()))
    }

    fn receive(&self) -> FrameStream {
        self.reader.stream()
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.signal.close() {
            return Ok(());
        }
        log::debug!("closing stdio transport");
        if let Some(process) = &self.process {
            process.lock().await.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_frames_are_newline_delimited() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n")
            .read(b"\n")
            .build();
        let (output, mut peer) = tokio::io::duplex(256);
        let transport = StdioTransport::from_streams(input, output);

        let mut inbound = transport.receive();
        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}")
        );
        assert!(inbound.next().await.is_none());

        transport
            .send(Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}"))
            .await
            .unwrap();
        let mut buf = vec![0u8; 37];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"{\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}\n".to_vec());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_sending() {
        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let transport = StdioTransport::new(in_rx, out_tx);
        let mut inbound = transport.receive();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(inbound.next().await.is_none());
        assert!(matches!(
            transport.send(Bytes::from_static(b"{}")).await,
            Err(Error::Transport(_))
        ));
    }
}
