//! In-memory transport.
//!
//! A channel-backed duplex used to drive relay connections without a
//! network. The server side gets a reader and a writer; the test side gets a
//! [`MemoryClient`]. A client that stops reading eventually blocks the
//! writer, which is how slow consumers are simulated.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{CloseReason, FrameReader, FrameWriter, TransportError};

/// Something the client side sent.
#[derive(Debug)]
enum ClientEvent {
    Frame(Bytes),
    Fail(String),
}

/// Something the server side wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// An encoded frame.
    Frame(Bytes),
    /// A keep-alive ping.
    Ping,
    /// The server closed the transport.
    Close(CloseReason),
}

/// Create a connected transport pair.
///
/// `buffer` bounds the server-to-client direction.
#[must_use]
pub fn pair(buffer: usize) -> (MemoryReader, MemoryWriter, MemoryClient) {
    let (client_tx, client_rx) = mpsc::channel(64);
    let (server_tx, server_rx) = mpsc::channel(buffer.max(1));

    (
        MemoryReader { inbound: client_rx },
        MemoryWriter {
            outbound: server_tx,
            closed: false,
        },
        MemoryClient {
            outbound: Some(client_tx),
            inbound: server_rx,
        },
    )
}

/// Server-side receiving half.
pub struct MemoryReader {
    inbound: mpsc::Receiver<ClientEvent>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.inbound.recv().await {
            Some(ClientEvent::Frame(frame)) => Ok(Some(frame)),
            Some(ClientEvent::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// Server-side sending half.
pub struct MemoryWriter {
    outbound: mpsc::Sender<ServerEvent>,
    closed: bool,
}

impl MemoryWriter {
    async fn push(&mut self, event: ServerEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.push(ServerEvent::Frame(frame)).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(ServerEvent::Ping).await
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        // A stalled client must not keep the close pending.
        let _ = self.outbound.try_send(ServerEvent::Close(reason));
        self.closed = true;
        Ok(())
    }
}

/// Client side of an in-memory transport.
pub struct MemoryClient {
    outbound: Option<mpsc::Sender<ClientEvent>>,
    inbound: mpsc::Receiver<ServerEvent>,
}

impl MemoryClient {
    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(ClientEvent::Frame(Bytes::from(text.into())))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Answer a keep-alive; the server reads an empty frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn pong(&self) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(ClientEvent::Frame(Bytes::new()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the server's next read fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(ClientEvent::Fail(reason.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the client's sending direction; the server reads end-of-stream.
    pub fn close(&mut self) {
        self.outbound = None;
    }

    /// Receive the next server event.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Receive the next frame, skipping pings.
    ///
    /// Returns `None` once the server closed the transport.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.inbound.recv().await? {
                ServerEvent::Frame(frame) => return Some(frame),
                ServerEvent::Ping => continue,
                ServerEvent::Close(_) => return None,
            }
        }
    }

    /// Take a pending frame without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.inbound.try_recv().ok()? {
                ServerEvent::Frame(frame) => return Some(frame),
                ServerEvent::Ping => continue,
                ServerEvent::Close(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut reader, mut writer, mut client) = pair(8);

        client.send_text("hello").await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(Bytes::from("hello")));

        writer.send(Bytes::from("world")).await.unwrap();
        writer.ping().await.unwrap();
        assert_eq!(client.recv_frame().await, Some(Bytes::from("world")));

        writer.close(CloseReason::Normal).await.unwrap();
        assert_eq!(client.recv().await, Some(ServerEvent::Close(CloseReason::Normal)));
        assert!(writer.send(Bytes::from("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_client_close_ends_stream() {
        let (mut reader, _writer, mut client) = pair(8);
        client.close();
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_client_failure() {
        let (mut reader, _writer, client) = pair(8);
        client.fail("reset").await.unwrap();
        assert!(matches!(
            reader.recv().await,
            Err(TransportError::ReceiveFailed(reason)) if reason == "reset"
        ));
    }

    #[tokio::test]
    async fn test_dropped_client_fails_writes() {
        let (_reader, mut writer, client) = pair(8);
        drop(client);
        assert!(matches!(
            writer.send(Bytes::from("x")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
