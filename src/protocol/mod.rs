//! Typed wire protocol for the clipboard mesh
//!
//! Four event kinds flow between peers: `Handshake` (exchanged once per
//! connection), `Message` (a full clipboard snapshot), `Announce` (a snapshot
//! advertisement without the payload body) and `Request` (ask for an announced
//! body). Every event travels inside an envelope carrying the originating
//! node id and a creation timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Device, MessageId, NodeId};

pub mod codec;

/// Protocol version carried in every application handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame declared a length above [`crate::MAX_FRAME_SIZE`]
    #[error("frame of {declared} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    /// The wire discriminant matched none of the four event kinds
    #[error("unknown event kind {0}")]
    UnknownEventKind(u8),

    /// The frame body ended before a complete event was read
    #[error("truncated frame")]
    Truncated,

    /// Event serialization failure
    #[error("encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Event deserialization failure
    #[error("decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Underlying stream error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One clipboard snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Snapshot identifier, minted by the originating node
    pub id: MessageId,
    /// Raw clipboard payload
    pub data: Vec<u8>,
    /// MIME type of the payload
    pub mime: String,
    /// Fast non-cryptographic hash of `data` (XXH3-64)
    pub content_hash: u64,
    /// Payload length in bytes
    pub content_length: u64,
    /// File name when the payload is a file, empty otherwise
    pub name: String,
}

impl Message {
    /// Build a snapshot over `data`, computing hash and length.
    pub fn new(id: MessageId, data: Vec<u8>, mime: impl Into<String>) -> Self {
        let content_hash = content_hash(&data);
        let content_length = data.len() as u64;
        Self {
            id,
            data,
            mime: mime.into(),
            content_hash,
            content_length,
            name: String::new(),
        }
    }

    /// Build a named (file) snapshot.
    pub fn file(id: MessageId, data: Vec<u8>, mime: impl Into<String>, name: impl Into<String>) -> Self {
        let mut msg = Self::new(id, data, mime);
        msg.name = name.into();
        msg
    }

    /// Duplicate policy governing flood suppression:
    ///
    /// 1. identical id: duplicate (same causal origin)
    /// 2. differing mime type: never duplicate
    /// 3. equal non-zero content hash: duplicate
    /// 4. otherwise not duplicate
    ///
    /// A zero content hash never matches anything, guarding against
    /// zero-value false positives.
    pub fn duplicate(&self, other: &Message) -> bool {
        if self.id == other.id {
            return true;
        }
        if self.mime != other.mime {
            return false;
        }
        self.content_hash != 0 && self.content_hash == other.content_hash
    }
}

/// Advertisement of content availability without the payload body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    /// Identifier of the advertised snapshot
    pub id: MessageId,
    /// MIME type of the advertised payload
    pub mime: String,
    /// Content hash of the advertised payload
    pub content_hash: u64,
    /// Payload length in bytes
    pub content_length: u64,
}

impl Announce {
    /// Same policy as [`Message::duplicate`], applied to announce metadata.
    pub fn duplicate(&self, other: &Announce) -> bool {
        if self.id == other.id {
            return true;
        }
        if self.mime != other.mime {
            return false;
        }
        self.content_hash != 0 && self.content_hash == other.content_hash
    }
}

impl From<&Message> for Announce {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            mime: msg.mime.clone(),
            content_hash: msg.content_hash,
            content_length: msg.content_length,
        }
    }
}

/// Ask a peer to transmit the full body of a previously announced snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Identifier of the wanted snapshot
    pub id: MessageId,
}

/// Exchanged once per connection before any other traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version of the sender
    pub version: u32,
    /// Port the sender accepts connections on
    pub port: u16,
    /// Sender device metadata
    pub device: Device,
    /// Name of the sender's clipboard provider
    pub provider: String,
}

/// The closed set of payload kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(Handshake),
    Message(Message),
    Announce(Announce),
    Request(Request),
}

impl Payload {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Handshake(_) => "handshake",
            Payload::Message(_) => "message",
            Payload::Announce(_) => "announce",
            Payload::Request(_) => "request",
        }
    }

    /// Message/announce identifier, when the payload carries one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Payload::Message(m) => Some(m.id),
            Payload::Announce(a) => Some(a.id),
            Payload::Request(r) => Some(r.id),
            Payload::Handshake(_) => None,
        }
    }
}

/// Envelope wrapping one payload with its origin and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Identifier of the originating node
    pub from: NodeId,
    /// Creation timestamp at the origin
    pub created: DateTime<Utc>,
    /// The payload itself
    pub payload: Payload,
}

impl Event {
    /// Wrap a payload, stamping it with the origin and the current time.
    pub fn new(from: NodeId, payload: Payload) -> Self {
        Self {
            from,
            created: Utc::now(),
            payload,
        }
    }

    /// The message payload, if this event carries one.
    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            Payload::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// XXH3-64 over the payload bytes. Cheap duplicate detection, not integrity.
pub fn content_hash(data: &[u8]) -> u64 {
    twox_hash::xxh3::hash64(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdGenerator;

    fn gen() -> IdGenerator {
        IdGenerator::with_tag(3)
    }

    #[test]
    fn test_duplicate_same_id() {
        let g = gen();
        let a = Message::new(g.message_id(), b"aaa".to_vec(), "text/plain");
        let mut b = Message::new(a.id, b"bbb".to_vec(), "text/plain");
        b.id = a.id;
        assert!(a.duplicate(&b));
    }

    #[test]
    fn test_duplicate_equal_hash_differing_id() {
        let g = gen();
        let a = Message::new(g.message_id(), b"same".to_vec(), "text/plain");
        let b = Message::new(g.message_id(), b"same".to_vec(), "text/plain");
        assert_ne!(a.id, b.id);
        assert!(a.duplicate(&b));
        assert!(b.duplicate(&a));
    }

    #[test]
    fn test_duplicate_mime_mismatch_never_matches() {
        let g = gen();
        let a = Message::new(g.message_id(), b"same".to_vec(), "text/plain");
        let b = Message::new(g.message_id(), b"same".to_vec(), "text/html");
        assert!(!a.duplicate(&b));
    }

    #[test]
    fn test_zero_hash_is_never_duplicate() {
        let g = gen();
        let mut a = Message::new(g.message_id(), vec![], "text/plain");
        let mut b = Message::new(g.message_id(), vec![], "text/plain");
        a.content_hash = 0;
        b.content_hash = 0;
        assert!(!a.duplicate(&b));
    }

    #[test]
    fn test_announce_mirrors_message_metadata() {
        let g = gen();
        let msg = Message::new(g.message_id(), b"payload".to_vec(), "text/plain");
        let ann = Announce::from(&msg);
        assert_eq!(ann.id, msg.id);
        assert_eq!(ann.content_hash, msg.content_hash);
        assert_eq!(ann.content_length, 7);
    }

    #[test]
    fn test_payload_ids() {
        let g = gen();
        let msg = Message::new(g.message_id(), b"x".to_vec(), "text/plain");
        let id = msg.id;
        assert_eq!(Payload::Message(msg).id(), Some(id));
        assert_eq!(Payload::Request(Request { id }).id(), Some(id));
    }
}
