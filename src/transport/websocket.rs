//! WebSocket carrier for the transport abstraction
//!
//! Each connection starts with a cleartext hello exchange (identity key,
//! ephemeral session key, signature), after which every binary message is one
//! sealed stream. Reader and writer halves run as background tasks; closing
//! the connection unblocks pending stream accepts promptly.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message as WsMessage, WebSocketStream,
};
use tracing::{debug, warn};

use super::{Connection, Listener, RecvStream, Result, SendStream, Transport, TransportError, WriterCmd};
use crate::security::{Hello, Identity, SessionSetup};

const WRITER_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 32;

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Deadline for establishing the carrier connection
    pub connect_timeout: Duration,
    /// Deadline for the peer's hello after ours is sent
    pub hello_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket-backed [`Transport`].
pub struct WsTransport {
    identity: Arc<Identity>,
    config: WsConfig,
}

impl WsTransport {
    pub fn new(identity: Arc<Identity>, config: WsConfig) -> Self {
        Self { identity, config }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>> {
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind(format!("{addr}: {e}")))?;
        let local_addr = tcp.local_addr()?;
        debug!(%local_addr, "listener bound");
        Ok(Box::new(WsListener::spawn(
            tcp,
            local_addr,
            Arc::clone(&self.identity),
            self.config.clone(),
        )))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Box<dyn Connection>> {
        let url = format!("ws://{addr}/mesh");
        let (ws, _response) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        let conn = secure_connection(&self.identity, ws, addr, self.config.hello_timeout).await?;
        Ok(Box::new(conn))
    }
}

const ACCEPT_QUEUE: usize = 16;

/// Listener that keeps the TCP accept loop free of per-connection work.
///
/// Each accepted socket gets its own task running the WebSocket upgrade and
/// hello exchange under the hello deadline, so a client that connects and
/// then goes silent stalls only its own task. Upgrade failures are logged
/// and dropped; `accept` yields secured connections only.
struct WsListener {
    local_addr: SocketAddr,
    conn_rx: mpsc::Receiver<Result<Box<dyn Connection>>>,
    accept_task: JoinHandle<()>,
}

impl WsListener {
    fn spawn(
        tcp: TcpListener,
        local_addr: SocketAddr,
        identity: Arc<Identity>,
        config: WsConfig,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE);
        let accept_task = tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, remote)) => {
                        let identity = Arc::clone(&identity);
                        let config = config.clone();
                        let conn_tx = conn_tx.clone();
                        tokio::spawn(async move {
                            let secured = timeout(config.hello_timeout, async {
                                let ws = accept_async(stream)
                                    .await
                                    .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                                secure_connection(&identity, ws, remote, config.hello_timeout)
                                    .await
                            })
                            .await
                            .unwrap_or(Err(TransportError::Timeout));
                            match secured {
                                Ok(conn) => {
                                    let _ = conn_tx
                                        .send(Ok(Box::new(conn) as Box<dyn Connection>))
                                        .await;
                                }
                                Err(e) => {
                                    debug!(%remote, error = %e, "inbound connection rejected");
                                }
                            }
                        });
                    }
                    // The listener socket itself failed; surface and stop.
                    Err(e) => {
                        let _ = conn_tx.send(Err(TransportError::Io(e))).await;
                        return;
                    }
                }
            }
        });
        Self {
            local_addr,
            conn_rx,
            accept_task,
        }
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        match self.conn_rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// One secured WebSocket connection.
pub struct WsConnection {
    remote: SocketAddr,
    cipher: Arc<crate::security::SessionCipher>,
    writer_tx: mpsc::Sender<WriterCmd>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn open_stream(&self) -> Result<SendStream> {
        Ok(SendStream::new(
            Arc::clone(&self.cipher),
            self.writer_tx.clone(),
        ))
    }

    async fn accept_stream(&self) -> Result<RecvStream> {
        match self.inbound_rx.lock().await.recv().await {
            Some(plaintext) => Ok(RecvStream::new(plaintext)),
            None => Err(TransportError::Closed),
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn close(&self) {
        let _ = self.writer_tx.try_send(WriterCmd::Shutdown);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
    }
}

/// Exchange hellos over a fresh WebSocket and start the reader/writer tasks.
async fn secure_connection<S>(
    identity: &Identity,
    mut ws: WebSocketStream<S>,
    remote: SocketAddr,
    hello_timeout: Duration,
) -> Result<WsConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let setup = SessionSetup::new(identity)?;
    let hello_bytes = setup.hello().encode()?;
    ws.send(WsMessage::Binary(hello_bytes.into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let peer_bytes = timeout(hello_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(b))) => return Ok(b),
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    let peer_hello = Hello::decode(&peer_bytes)?;
    let cipher = Arc::new(setup.establish(identity, &peer_hello)?);

    let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCmd>(WRITER_QUEUE);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(INBOUND_QUEUE);
    let (mut sink, mut stream) = ws.split();

    let writer_task = tokio::spawn(async move {
        while let Some(cmd) = writer_rx.recv().await {
            match cmd {
                WriterCmd::Frame(frame) => {
                    if sink.send(WsMessage::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                WriterCmd::Shutdown => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_cipher = Arc::clone(&cipher);
    let reader_task = tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(sealed))) => match reader_cipher.open(&sealed) {
                    Ok(plaintext) => {
                        if inbound_tx.send(Bytes::from(plaintext)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%remote, error = %e, "dropping undecryptable frame");
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(%remote, error = %e, "connection read ended");
                    break;
                }
            }
        }
        // inbound_tx drops here, unblocking accept_stream with Closed.
    });

    Ok(WsConnection {
        remote,
        cipher,
        writer_tx,
        inbound_rx: Mutex::new(inbound_rx),
        reader_task: Mutex::new(Some(reader_task)),
        writer_task: Mutex::new(Some(writer_task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connected_pair(
        a: Arc<Identity>,
        b: Arc<Identity>,
    ) -> Result<(Box<dyn Connection>, Box<dyn Connection>)> {
        let ta = WsTransport::new(a, WsConfig::default());
        let tb = WsTransport::new(b, WsConfig::default());
        let mut listener = ta.listen("127.0.0.1:0".parse().unwrap()).await?;
        let addr = listener.local_addr();
        let (accepted, dialed) = tokio::join!(listener.accept(), tb.dial(addr));
        Ok((accepted?, dialed?))
    }

    #[tokio::test]
    async fn test_stream_round_trip_over_loopback() {
        let a = Arc::new(Identity::generate().unwrap());
        let b = Arc::new(Identity::generate().unwrap());
        let (server, client) = connected_pair(a, b).await.unwrap();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"one event per stream").await.unwrap();
        out.finish().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut payload = Vec::new();
        inbound.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"one event per stream");

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let a = Arc::new(Identity::generate().unwrap());
        let b = Arc::new(Identity::generate().unwrap());
        let (server, client) = connected_pair(a, b).await.unwrap();

        client.close().await;
        let got = timeout(Duration::from_secs(5), server.accept_stream()).await;
        assert!(matches!(got, Ok(Err(TransportError::Closed))));
        server.close().await;
    }

    #[tokio::test]
    async fn test_silent_client_does_not_stall_accept() {
        let a = Arc::new(Identity::generate().unwrap());
        let b = Arc::new(Identity::generate().unwrap());
        let ta = WsTransport::new(a, WsConfig::default());
        let tb = WsTransport::new(b, WsConfig::default());
        let mut listener = ta.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        // Completes the TCP connect and never speaks; must only stall its
        // own upgrade task, not the accept loop.
        let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();

        let (accepted, dialed) = timeout(Duration::from_secs(5), async {
            tokio::join!(listener.accept(), tb.dial(addr))
        })
        .await
        .expect("accept loop stalled behind a silent client");
        accepted.unwrap();
        dialed.unwrap();
    }

    #[tokio::test]
    async fn test_secret_mismatch_refuses_connection() {
        let a = Arc::new(Identity::from_secret("left").unwrap());
        let b = Arc::new(Identity::from_secret("right").unwrap());
        let ta = WsTransport::new(a, WsConfig::default());
        let tb = WsTransport::new(b, WsConfig::default());
        let listener = ta.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // The listener rejects the mismatched hello inside its upgrade task;
        // the dialer observes the failure directly.
        let result = tb.dial(listener.local_addr()).await;
        assert!(result.is_err());
    }
}
