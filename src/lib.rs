//! # ClipMesh
//!
//! Encrypted peer-to-peer clipboard synchronization over an ad-hoc mesh.
//!
//! Each node watches its local clipboard and floods changes to its connected
//! peers, which apply them locally and re-broadcast to their own neighbors.
//! Loops are suppressed by content-addressed deduplication at the message bus
//! and again per peer at broadcast time.

pub mod channel;
pub mod clipboard;
pub mod config;
pub mod discovery;
pub mod filestore;
pub mod identity;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod security;
pub mod transport;

pub use config::Config;
pub use identity::{Device, NodeId};
pub use node::Node;

/// Result type alias for ClipMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipMesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Security / handshake error
    #[error("security error: {0}")]
    Security(#[from] security::SecurityError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// Message bus error
    #[error("channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    /// Node lifecycle error
    #[error("node error: {0}")]
    Node(#[from] node::NodeError),

    /// Peer discovery error
    #[error("discovery error: {0}")]
    Discovery(#[from] discovery::DiscoveryError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a single wire frame (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
