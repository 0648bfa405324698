//! Node and message identity
//!
//! Identifiers are 63-bit snowflake-style values: 41 bits of milliseconds
//! since a custom epoch, a 12-bit per-millisecond sequence, and a 10-bit
//! node-instance tag in the low bits. Because every id minted by a node
//! carries the node's tag, the originating node of any message can be
//! recovered from the id alone via [`author`].

use std::hash::Hasher;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Custom epoch: 2020-01-01T00:00:00Z, milliseconds.
const EPOCH_MS: i64 = 1_577_836_800_000;

const TAG_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Node-instance tag embedded in the low bits of every id.
pub type AuthorTag = u16;

/// Extract the node-instance tag from any id minted by [`IdGenerator`].
pub fn author(id: u64) -> AuthorTag {
    (id & TAG_MASK) as AuthorTag
}

/// Process-unique node identifier. Stable for the process lifetime and used
/// as the peer-registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The node-instance tag carried in the low bits.
    pub fn author(&self) -> AuthorTag {
        author(self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of one clipboard snapshot or announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// The tag of the node that minted this id.
    pub fn author(&self) -> AuthorTag {
        author(self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies a peer for logging and dedup purposes. Created once at process
/// start; immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Node identifier, minted by the local generator
    pub id: NodeId,
    /// Human-readable name, `user@hostname`
    pub name: String,
    /// Target architecture the node runs on
    pub arch: String,
}

impl Device {
    /// Build the local device descriptor from hostname, user and arch.
    pub fn local(id: NodeId) -> Self {
        Self {
            id,
            name: format!("{}@{}", local_user(), local_hostname()),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.id, self.arch)
    }
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Snowflake-style id generator bound to one node-instance tag.
#[derive(Debug)]
pub struct IdGenerator {
    tag: AuthorTag,
    state: Mutex<GenState>,
}

#[derive(Debug, Default)]
struct GenState {
    last_ms: i64,
    seq: u64,
}

impl IdGenerator {
    /// Create a generator with a tag derived from the machine identity,
    /// salted per process so two nodes on one host stay distinguishable.
    pub fn new() -> Self {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(local_hostname().as_bytes());
        hasher.write(local_user().as_bytes());
        hasher.write(std::env::consts::ARCH.as_bytes());
        let salt: u64 = rand::random();
        let tag = ((hasher.finish() ^ salt) & TAG_MASK) as AuthorTag;
        Self::with_tag(tag)
    }

    /// Create a generator with an explicit tag. Used by tests simulating
    /// several nodes in one process.
    pub fn with_tag(tag: AuthorTag) -> Self {
        Self {
            tag: tag & TAG_MASK as AuthorTag,
            state: Mutex::new(GenState::default()),
        }
    }

    /// The node-instance tag embedded in every generated id.
    pub fn tag(&self) -> AuthorTag {
        self.tag
    }

    /// Mint the next id. Monotonic within the process.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock().expect("id generator poisoned");
        let mut now = chrono::Utc::now().timestamp_millis() - EPOCH_MS;
        if now < state.last_ms {
            // Clock went backwards; hold at the last timestamp.
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.seq = (state.seq + 1) & SEQ_MASK;
            if state.seq == 0 {
                now += 1;
            }
        } else {
            state.seq = 0;
        }
        state.last_ms = now;
        ((now as u64) << (SEQ_BITS + TAG_BITS)) | (state.seq << TAG_BITS) | self.tag as u64
    }

    /// Mint the node's own identifier.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.next_id())
    }

    /// Mint a message identifier.
    pub fn message_id(&self) -> MessageId {
        MessageId(self.next_id())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
