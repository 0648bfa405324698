//! Narrow discovery interface
//!
//! Peer discovery itself (mDNS, UDP broadcast, ...) lives outside the core.
//! A backend hands discovered `(address, payload)` pairs to
//! [`handle_payload`], which decodes the advertisement and asks the
//! [`Connector`] to dial the advertised endpoint.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identity::NodeId;
use crate::protocol::PROTOCOL_VERSION;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Advertisement payload could not be decoded
    #[error("invalid advertisement: {0}")]
    InvalidAdvertisement(#[from] serde_json::Error),

    /// Advertisement speaks a different protocol version
    #[error("advertisement version {0} unsupported")]
    VersionMismatch(u32),
}

/// JSON advertisement a node publishes for discovery backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Advertising node id
    pub node: NodeId,
    /// Human-readable device name
    pub name: String,
    /// Port the node listens on
    pub port: u16,
    /// Protocol version
    pub version: u32,
}

impl Advertisement {
    pub fn new(node: NodeId, name: impl Into<String>, port: u16) -> Self {
        Self {
            node,
            name: name.into(),
            port,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DiscoveryError> {
        let ad: Self = serde_json::from_slice(payload)?;
        if ad.version != PROTOCOL_VERSION {
            return Err(DiscoveryError::VersionMismatch(ad.version));
        }
        Ok(ad)
    }
}

/// Callback a discovery backend uses to trigger outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the discovered endpoint.
    async fn connect(&self, addr: SocketAddr, node: NodeId);
}

/// Decode a discovered payload and hand the advertised endpoint to the
/// connector. The advertised port replaces the source port, since the source
/// address of a broadcast is ephemeral.
pub async fn handle_payload(
    connector: &dyn Connector,
    source: SocketAddr,
    payload: &[u8],
) -> Result<(), DiscoveryError> {
    let ad = Advertisement::decode(payload)?;
    let addr = SocketAddr::new(source.ip(), ad.port);
    debug!(node = %ad.node, %addr, name = %ad.name, "discovered peer");
    connector.connect(addr, ad.node).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingConnector {
        seen: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self, addr: SocketAddr, _node: NodeId) {
            self.seen.lock().unwrap().push(addr);
        }
    }

    #[tokio::test]
    async fn test_payload_triggers_connect_on_advertised_port() {
        let ad = Advertisement::new(NodeId(42), "tester", 7777);
        let payload = ad.encode().unwrap();
        let connector = RecordingConnector {
            seen: Mutex::new(Vec::new()),
        };

        let source: SocketAddr = "192.168.1.5:51523".parse().unwrap();
        handle_payload(&connector, source, &payload).await.unwrap();

        let seen = connector.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &["192.168.1.5:7777".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_garbage_payload_rejected() {
        let connector = RecordingConnector {
            seen: Mutex::new(Vec::new()),
        };
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = handle_payload(&connector, source, b"not json").await;
        assert!(matches!(
            result,
            Err(DiscoveryError::InvalidAdvertisement(_))
        ));
    }
}
