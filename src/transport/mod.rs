//! Transport abstraction for the mesh
//!
//! The protocol engine speaks to a multiplexed, encrypted, stream-oriented
//! connection through [`Transport`], [`Listener`] and [`Connection`]: listen,
//! dial, open-stream, accept-stream. Every event travels on its own stream
//! (open, write one frame, close; mirrored by accept, read one frame, close
//! on the remote), which keeps the engine independent of the carrier.
//!
//! The bundled implementation rides WebSocket binary messages, one stream per
//! message, sealed by the connection's session cipher.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::security::{SecurityError, SessionCipher};

pub mod websocket;

pub use websocket::WsTransport;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failure establishing a connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// Failure binding the listener
    #[error("bind failed: {0}")]
    Bind(String),

    /// The connection closed; normal at end of a peer's life
    #[error("connection closed")]
    Closed,

    /// Carrier protocol failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Frame could not be encoded for transmission
    #[error("encode failed: {0}")]
    Encode(String),

    /// Handshake / encryption failure
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Operation exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection factory: listen for inbound connections, dial outbound ones.
/// Both sides come back authenticated and encrypted.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener on `addr`.
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>>;

    /// Dial a remote node and run the security exchange.
    async fn dial(&self, addr: SocketAddr) -> Result<Box<dyn Connection>>;
}

/// Accepts inbound connections, running the security exchange on each.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next connection.
    async fn accept(&mut self) -> Result<Box<dyn Connection>>;

    /// The bound local address.
    fn local_addr(&self) -> SocketAddr;
}

/// One authenticated, encrypted connection to a remote node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open an outbound stream for exactly one frame.
    async fn open_stream(&self) -> Result<SendStream>;

    /// Accept the next inbound stream. Returns [`TransportError::Closed`]
    /// when the connection ends.
    async fn accept_stream(&self) -> Result<RecvStream>;

    /// Remote address of the connection.
    fn remote_addr(&self) -> SocketAddr;

    /// Close the connection; pending accepts unblock promptly.
    async fn close(&self);
}

pub(crate) enum WriterCmd {
    Frame(Bytes),
    Shutdown,
}

/// Outbound stream carrying one frame. Bytes written here are buffered,
/// sealed with the session cipher on [`SendStream::finish`] and handed to the
/// connection writer.
pub struct SendStream {
    buf: Vec<u8>,
    cipher: Arc<SessionCipher>,
    out: mpsc::Sender<WriterCmd>,
}

impl SendStream {
    pub(crate) fn new(cipher: Arc<SessionCipher>, out: mpsc::Sender<WriterCmd>) -> Self {
        Self {
            buf: Vec::new(),
            cipher,
            out,
        }
    }

    /// Seal the buffered frame and send it, closing the stream.
    pub async fn finish(self) -> Result<()> {
        let sealed = self.cipher.seal(&self.buf)?;
        self.out
            .send(WriterCmd::Frame(Bytes::from(sealed)))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl AsyncWrite for SendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Inbound stream: the decrypted bytes of one frame.
pub struct RecvStream {
    data: Bytes,
    pos: usize,
}

impl RecvStream {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let remaining = &me.data[me.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        me.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Identity, SessionSetup};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        let sa = SessionSetup::new(&a).unwrap();
        let sb = SessionSetup::new(&b).unwrap();
        let ha = sa.hello().clone();
        let hb = sb.hello().clone();
        (sa.establish(&a, &hb).unwrap(), sb.establish(&b, &ha).unwrap())
    }

    #[tokio::test]
    async fn test_send_stream_seals_one_frame() {
        let (ca, cb) = cipher_pair();
        let (tx, mut rx) = mpsc::channel(1);

        let mut stream = SendStream::new(Arc::new(ca), tx);
        stream.write_all(b"frame bytes").await.unwrap();
        stream.finish().await.unwrap();

        let sealed = match rx.recv().await.unwrap() {
            WriterCmd::Frame(b) => b,
            WriterCmd::Shutdown => panic!("unexpected shutdown"),
        };
        assert_eq!(cb.open(&sealed).unwrap(), b"frame bytes");
    }

    #[tokio::test]
    async fn test_recv_stream_reads_to_end() {
        let mut stream = RecvStream::new(Bytes::from_static(b"inbound"));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"inbound");
    }
}
