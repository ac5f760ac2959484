//! In-process transport
//!
//! [`MemoryTransport::pair`] returns two connected ends backed by Tokio channels.
//! It is what the test suites use, and it also suits a client and server living
//! in the same process.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{CloseSignal, FrameReader, FrameStream, Transport};
use crate::error::Error;

const CHANNEL_CAPACITY: usize = 100;

pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    reader: FrameReader,
    signal: CloseSignal,
    peer_signal: CloseSignal,
}

impl MemoryTransport {
    /// Creates two transports wired to each other
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let a_signal = CloseSignal::new();
        let b_signal = CloseSignal::new();

        let a = MemoryTransport {
            tx: a_tx,
            reader: FrameReader::new(a_rx, a_signal.clone()),
            signal: a_signal.clone(),
            peer_signal: b_signal.clone(),
        };
        let b = MemoryTransport {
            tx: b_tx,
            reader: FrameReader::new(b_rx, b_signal.clone()),
            signal: b_signal,
            peer_signal: a_signal,
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<(), Error> {
        if self.signal.is_closed() {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        log::debug!("memory transport sending {} bytes", frame.len());
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("peer hung up".to_string()))
    }

    fn receive(&self) -> FrameStream {
        self.reader.stream()
    }

    /// Closing either end ends the inbound stream on both
    async fn close(&self) -> Result<(), Error> {
        if self.signal.close() {
            log::debug!("memory transport closed");
        }
        self.peer_signal.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = MemoryTransport::pair();
        let mut a_in = a.receive();
        let mut b_in = b.receive();

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(b_in.next().await.unwrap().unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a_in.next().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_close_ends_both_streams() {
        let (a, b) = MemoryTransport::pair();
        let mut a_in = a.receive();
        let mut b_in = b.receive();

        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(a_in.next().await.is_none());
        assert!(b_in.next().await.is_none());
        assert!(matches!(
            a.send(Bytes::from_static(b"late")).await,
            Err(Error::Transport(_))
        ));
    }
}
