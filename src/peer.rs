//! Per-connection peer actor
//!
//! A [`Peer`] owns one authenticated connection. Its receive loop accepts one
//! inbound stream at a time, decodes the frame and routes the event into the
//! shared [`Channel`]; its write path opens a fresh stream per frame under a
//! deadline. A write failure is terminal for the peer at this layer; the node
//! decides on eviction.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::identity::Device;
use crate::protocol::{codec, Event, Message, Payload, ProtocolError};
use crate::transport::{Connection, TransportError};

/// Actor for one authenticated connection to a remote node.
pub struct Peer {
    device: Device,
    conn: Box<dyn Connection>,
    channel: Arc<Channel>,
    last_received: std::sync::Mutex<Option<Message>>,
    write_deadline: Duration,
}

impl Peer {
    pub fn new(
        conn: Box<dyn Connection>,
        device: Device,
        channel: Arc<Channel>,
        write_deadline: Duration,
    ) -> Self {
        Self {
            device,
            conn,
            channel,
            last_received: std::sync::Mutex::new(None),
            write_deadline,
        }
    }

    /// Metadata of the remote device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The last message payload received from this peer, used for
    /// broadcast-time duplicate suppression.
    pub fn last_received(&self) -> Option<Message> {
        self.last_received.lock().expect("last_received poisoned").clone()
    }

    /// Run until the connection closes, `shutdown` flips, or a decode error
    /// occurs. A normal network close returns cleanly; protocol errors are
    /// surfaced so the owner can log and tear the peer down.
    pub async fn receive(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProtocolError> {
        loop {
            let stream = tokio::select! {
                accepted = self.conn.accept_stream() => accepted,
                _ = shutdown.changed() => {
                    debug!(peer = %self.device.id, "receive loop cancelled");
                    self.conn.close().await;
                    return Ok(());
                }
            };
            let mut stream = match stream {
                Ok(s) => s,
                // Normal disconnect.
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => {
                    debug!(peer = %self.device.id, error = %e, "connection ended");
                    return Ok(());
                }
            };
            let event = codec::decode_reader(&mut stream).await?;
            trace!(peer = %self.device.id, kind = event.payload.kind(), from = %event.from, "event received");
            self.route(event).await;
        }
    }

    async fn route(&self, event: Event) {
        match &event.payload {
            Payload::Message(msg) => {
                *self.last_received.lock().expect("last_received poisoned") = Some(msg.clone());
                if let Err(e) = self.channel.send(event).await {
                    warn!(peer = %self.device.id, error = %e, "bus rejected message");
                }
            }
            Payload::Announce(_) => {
                if let Err(e) = self.channel.announce(event) {
                    warn!(peer = %self.device.id, error = %e, "bus rejected announce");
                }
            }
            Payload::Request(_) => {
                if let Err(e) = self.channel.send(event).await {
                    warn!(peer = %self.device.id, error = %e, "bus rejected request");
                }
            }
            Payload::Handshake(_) => {
                debug!(peer = %self.device.id, "ignoring repeated handshake");
            }
        }
    }

    /// Write one pre-encoded frame on a fresh stream under the write
    /// deadline. Errors are terminal for this peer; no retry here.
    pub async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        timeout(self.write_deadline, async {
            let mut stream = self.conn.open_stream().await?;
            use tokio::io::AsyncWriteExt;
            stream.write_all(&frame).await?;
            stream.finish().await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    /// Encode and write one event.
    pub async fn write_event(&self, event: &Event) -> Result<(), TransportError> {
        let frame = codec::encode_event(event)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.write(frame).await
    }

    /// Close the underlying connection.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}
