//! Node orchestrator
//!
//! A [`Node`] accepts and dials connections, drives the application
//! handshake, registers peers, watches the local clipboard and performs
//! flood broadcast with per-message and per-peer duplicate suppression.
//!
//! Per-connection state machine: Dialing/Accepting, Handshaking, Registered,
//! Receiving, Closed.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelError};
use crate::clipboard::ClipboardProvider;
use crate::config::Config;
use crate::discovery::Connector;
use crate::filestore::FileStore;
use crate::identity::{Device, IdGenerator, MessageId, NodeId};
use crate::peer::Peer;
use crate::protocol::{
    codec, Announce, Event, Handshake, Message, Payload, Request, PROTOCOL_VERSION,
};
use crate::registry::Registry;
use crate::security::Identity;
use crate::transport::{websocket::WsConfig, Connection, Transport, TransportError, WsTransport};

/// Node lifecycle errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// The peer identity is already registered; redundant mesh edge refused
    #[error("peer {0} is already connected")]
    AlreadyConnected(NodeId),

    /// The remote presented our own identity
    #[error("refusing connection to self")]
    SelfConnection,

    /// The peer did not complete the application handshake in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The first event on the connection was not a handshake
    #[error("expected handshake, received {0}")]
    UnexpectedEvent(&'static str),
}

/// One participating process in the clipboard mesh.
pub struct Node {
    config: Config,
    device: Device,
    generator: IdGenerator,
    channel: Arc<Channel>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    clipboard: Arc<dyn ClipboardProvider>,
    filestore: FileStore,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Build a node over the WebSocket transport with an identity derived
    /// from the configured secret.
    pub fn new(config: Config, clipboard: Arc<dyn ClipboardProvider>) -> crate::Result<Arc<Self>> {
        config.validate()?;
        let identity = Arc::new(Identity::from_config(config.secret.as_deref())?);
        info!(fingerprint = %identity.fingerprint(), secret = identity.secret_derived(), "identity ready");
        let ws_config = WsConfig {
            connect_timeout: config.handshake_timeout(),
            hello_timeout: config.handshake_timeout(),
        };
        let transport = Arc::new(WsTransport::new(identity, ws_config));
        Ok(Self::with_transport(config, clipboard, transport))
    }

    /// Build a node over a caller-supplied transport. The seam the tests use
    /// to run several nodes in one process.
    pub fn with_transport(
        config: Config,
        clipboard: Arc<dyn ClipboardProvider>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let generator = IdGenerator::new();
        let device = Device::local(generator.node_id());
        let channel = Arc::new(Channel::new(config.history_size, config.announce_buffer));
        let filestore = FileStore::new(
            config
                .file_dir
                .clone()
                .unwrap_or_else(FileStore::default_dir),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            device,
            generator,
            channel,
            registry: Arc::new(Registry::new()),
            transport,
            clipboard,
            filestore,
            shutdown_tx,
        })
    }

    /// This node's identity.
    pub fn id(&self) -> NodeId {
        self.device.id
    }

    /// This node's device metadata.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The shared message bus.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Currently connected peer count.
    pub async fn peer_count(&self) -> usize {
        self.registry.len().await
    }

    /// Run listener and monitor together. Listener failures are fatal.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        let listener = Arc::clone(&self).start();
        let monitor = self.monitor();
        tokio::try_join!(listener, monitor)?;
        Ok(())
    }

    /// Bind the listener and accept connections until a listener-level
    /// error, which is fatal. Per-connection upgrade and hello failures are
    /// handled inside the transport listener and never reach this loop.
    pub async fn start(self: Arc<Self>) -> crate::Result<()> {
        let addr = self.config.listen_socket_addr()?;
        let mut listener = self.transport.listen(addr).await?;
        info!(addr = %listener.local_addr(), node = %self.device.id, "listening for peers");
        loop {
            let conn = listener.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(conn).await {
                    debug!(error = %e, "inbound connection ended");
                }
            });
        }
    }

    /// Dial a peer and run its whole lifecycle within this call. Dial and
    /// handshake failures return to the caller; they are never fatal to the
    /// node.
    pub async fn connect_to(&self, addr: SocketAddr) -> crate::Result<()> {
        let conn = self.transport.dial(addr).await?;
        self.handle_connection(conn).await
    }

    /// Handshake, register, then pump the receive loop until disconnect.
    async fn handle_connection(&self, conn: Box<dyn Connection>) -> crate::Result<()> {
        let remote = conn.remote_addr();

        // Send ours, then await theirs. The send is buffered by the
        // transport, so the symmetric exchange cannot deadlock; the deadline
        // bounds a peer that never answers.
        let ours = Event::new(
            self.device.id,
            Payload::Handshake(Handshake {
                version: PROTOCOL_VERSION,
                port: self.config.listen_port(),
                device: self.device.clone(),
                provider: self.clipboard.name().to_string(),
            }),
        );
        let frame = codec::encode_event(&ours)?;
        {
            use tokio::io::AsyncWriteExt;
            let mut stream = conn.open_stream().await?;
            stream.write_all(&frame).await.map_err(TransportError::Io)?;
            stream.finish().await?;
        }

        let theirs = match timeout(self.config.handshake_timeout(), async {
            let mut stream = conn.accept_stream().await?;
            let event = codec::decode_reader(&mut stream).await?;
            Ok::<Event, crate::Error>(event)
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                conn.close().await;
                return Err(NodeError::HandshakeTimeout.into());
            }
        };

        let handshake = match theirs.payload {
            Payload::Handshake(h) => h,
            other => {
                conn.close().await;
                return Err(NodeError::UnexpectedEvent(other.kind()).into());
            }
        };
        if handshake.version != PROTOCOL_VERSION {
            // Forward compatibility is best-effort.
            warn!(
                peer = %handshake.device.id,
                theirs = handshake.version,
                ours = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
        }
        if handshake.device.id == self.device.id {
            conn.close().await;
            return Err(NodeError::SelfConnection.into());
        }

        let peer_id = handshake.device.id;
        let peer = Arc::new(Peer::new(
            conn,
            handshake.device.clone(),
            Arc::clone(&self.channel),
            self.config.write_timeout(),
        ));
        if self.registry.insert(peer_id, Arc::clone(&peer)).await.is_err() {
            peer.close().await;
            return Err(NodeError::AlreadyConnected(peer_id).into());
        }
        info!(
            peer = %handshake.device,
            provider = %handshake.provider,
            port = handshake.port,
            %remote,
            "peer registered"
        );

        let result = peer.receive(self.shutdown_tx.subscribe()).await;
        self.registry.remove(peer_id).await;
        peer.close().await;
        match result {
            Ok(()) => {
                info!(peer = %peer_id, "peer disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "peer torn down after protocol error");
                Err(e.into())
            }
        }
    }

    /// Fan an event out to every registered peer except `ignore` and any peer
    /// whose last-received message duplicates this one. A write failure
    /// evicts only that peer.
    pub async fn broadcast(&self, event: &Event, ignore: Option<NodeId>) {
        let frame = match codec::encode_event(event) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to encode broadcast frame");
                return;
            }
        };
        let msg = event.message();
        for (id, peer) in self.registry.snapshot().await {
            if Some(id) == ignore {
                continue;
            }
            if let (Some(current), Some(last)) = (msg, peer.last_received()) {
                if last.duplicate(current) {
                    trace!(peer = %id, "skipping peer holding a duplicate");
                    continue;
                }
            }
            if let Err(e) = peer.write(frame.clone()).await {
                warn!(peer = %id, error = %e, "write failed, evicting peer");
                self.registry.remove(id).await;
                peer.close().await;
            }
        }
    }

    /// Run the clipboard poll loop and both bus drains.
    pub async fn monitor(&self) -> crate::Result<()> {
        tokio::try_join!(
            self.poll_clipboard(),
            self.drain_messages(),
            self.drain_announces()
        )?;
        Ok(())
    }

    /// Poll the local clipboard; on genuine content change publish a Message
    /// (or an Announce when the payload is large) into the bus.
    async fn poll_clipboard(&self) -> crate::Result<()> {
        let mut ticker = interval(self.config.poll_interval());
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut last_hash: Option<u64> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return Ok(()),
            }
            let data = match self.clipboard.get().await {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "clipboard read failed");
                    continue;
                }
            };
            if data.is_empty() {
                continue;
            }
            let hash = crate::protocol::content_hash(&data);
            if last_hash == Some(hash) {
                continue;
            }
            last_hash = Some(hash);

            let msg = Message::new(self.generator.message_id(), data, "text/plain");
            debug!(id = %msg.id, bytes = msg.content_length, "local clipboard changed");
            let published = if msg.data.len() > self.config.announce_threshold {
                let announce = Event::new(self.device.id, Payload::Announce(Announce::from(&msg)));
                let full = Event::new(self.device.id, Payload::Message(msg));
                let result = self.channel.announce(announce);
                // Keep the body servable for incoming Requests.
                self.channel.remember(full);
                result
            } else {
                self.channel
                    .send(Event::new(self.device.id, Payload::Message(msg)))
                    .await
            };
            match published {
                Ok(()) => {}
                Err(ChannelError::Closed) => return Ok(()),
            }
        }
    }

    /// Drain the message path: apply remote snapshots locally and re-flood
    /// them onward, excluding the originator; serve body requests.
    async fn drain_messages(&self) -> crate::Result<()> {
        while let Some(event) = self.channel.recv().await {
            match &event.payload {
                Payload::Message(msg) => {
                    if event.from != self.device.id {
                        self.apply(msg).await;
                    }
                    if msg.data.len() > self.config.announce_threshold {
                        // Relay large bodies as announces so the threshold
                        // holds at every hop; downstream peers pull the body
                        // from whoever already has it.
                        let announce =
                            Event::new(event.from, Payload::Announce(Announce::from(msg)));
                        self.broadcast(&announce, Some(event.from)).await;
                    } else {
                        self.broadcast(&event, Some(event.from)).await;
                    }
                }
                Payload::Request(req) => {
                    self.serve_request(event.from, req.id).await;
                }
                other => {
                    debug!(kind = other.kind(), "unexpected event on message path");
                }
            }
        }
        Ok(())
    }

    /// Drain the announce path: request unknown bodies from the announcer
    /// and re-flood the announce onward.
    async fn drain_announces(&self) -> crate::Result<()> {
        while let Some(event) = self.channel.recv_announce().await {
            let Payload::Announce(announce) = &event.payload else {
                continue;
            };
            if event.from != self.device.id {
                let have_body = self
                    .channel
                    .get(announce.id)
                    .map(|e| e.message().is_some())
                    .unwrap_or(false);
                if !have_body {
                    let request = Event::new(
                        self.device.id,
                        Payload::Request(Request { id: announce.id }),
                    );
                    if let Some(peer) = self.registry.get(event.from).await {
                        if let Err(e) = peer.write_event(&request).await {
                            warn!(peer = %event.from, error = %e, "body request failed");
                        }
                    } else {
                        // The announcer is beyond a relay; ask the neighbors.
                        // Whoever holds the body serves it, the rest ignore
                        // the unknown id.
                        self.broadcast(&request, None).await;
                    }
                }
            }
            self.broadcast(&event, Some(event.from)).await;
        }
        Ok(())
    }

    /// Apply a remote snapshot: clipboard for unnamed payloads, file store
    /// for named ones.
    async fn apply(&self, msg: &Message) {
        if msg.name.is_empty() {
            match self.clipboard.set(&msg.data).await {
                Ok(()) => info!(id = %msg.id, bytes = msg.content_length, "applied remote clipboard"),
                Err(e) => error!(id = %msg.id, error = %e, "failed to apply remote clipboard"),
            }
        } else {
            match self.filestore.write(msg).await {
                Ok(path) => info!(id = %msg.id, path = %path.display(), "stored remote file"),
                Err(e) => error!(id = %msg.id, error = %e, "failed to store remote file"),
            }
        }
    }

    /// Serve a previously announced body to the requesting peer.
    async fn serve_request(&self, requester: NodeId, id: MessageId) {
        let Some(event) = self.channel.get(id) else {
            debug!(%id, "request for id outside the history window");
            return;
        };
        if event.message().is_none() {
            debug!(%id, "request for id without a cached body");
            return;
        }
        let Some(peer) = self.registry.get(requester).await else {
            debug!(peer = %requester, "requester no longer connected");
            return;
        };
        if let Err(e) = peer.write_event(&event).await {
            warn!(peer = %requester, error = %e, "serving request failed, evicting peer");
            self.registry.remove(requester).await;
            peer.close().await;
        }
    }

    /// Stop producing, close the bus and drop every connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.channel.close().await;
        for (id, peer) in self.registry.snapshot().await {
            self.registry.remove(id).await;
            peer.close().await;
        }
        info!(node = %self.device.id, "node shut down");
    }
}

/// Discovery backends dial through the node itself. Running the lifecycle in
/// a spawned task keeps the callback prompt.
#[async_trait]
impl Connector for Arc<Node> {
    async fn connect(&self, addr: SocketAddr, node: NodeId) {
        if node == self.device.id || self.registry.contains(node).await {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.connect_to(addr).await {
                debug!(%addr, error = %e, "discovery-triggered connect ended");
            }
        });
    }
}
