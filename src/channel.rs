//! Per-node message bus with deduplication and bounded history
//!
//! The bus decouples clipboard-watch producers and remote receive loops from
//! the broadcast consumer. Message delivery is intentionally backpressured:
//! `send` awaits the consumer on a capacity-1 channel, so a slow broadcast
//! step throttles the clipboard watcher instead of buffering unboundedly.
//! Announces are advisory and never block: a full buffer drops the newest.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::MessageId;
use crate::protocol::{Event, Payload};

/// Message bus errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The bus was closed; no further delivery is possible
    #[error("channel closed")]
    Closed,
}

/// Bounded FIFO cache of recently seen events, keyed by message id.
/// Eviction is strict insertion order, independent of lookups.
struct History {
    entries: HashMap<u64, Event>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: MessageId, event: Event) {
        if self.entries.insert(id.0, event).is_none() {
            self.order.push_back(id.0);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, id: MessageId) -> Option<Event> {
        self.entries.get(&id.0).cloned()
    }
}

/// Deduplicating, history-bearing message bus shared by one node.
pub struct Channel {
    last_message: Mutex<Option<Event>>,
    last_announce: Mutex<Option<Event>>,
    history: Mutex<History>,
    msg_tx: mpsc::Sender<Event>,
    msg_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    ann_tx: mpsc::Sender<Event>,
    ann_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
}

impl Channel {
    /// Create a bus with the given history capacity and announce buffer size.
    pub fn new(history_capacity: usize, announce_buffer: usize) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (ann_tx, ann_rx) = mpsc::channel(announce_buffer.max(1));
        Self {
            last_message: Mutex::new(None),
            last_announce: Mutex::new(None),
            history: Mutex::new(History::new(history_capacity.max(1))),
            msg_tx,
            msg_rx: tokio::sync::Mutex::new(msg_rx),
            ann_tx,
            ann_rx: tokio::sync::Mutex::new(ann_rx),
        }
    }

    /// Publish an event to the broadcast consumer.
    ///
    /// A Message payload that duplicates the last observed message is
    /// suppressed silently; this is the primary loop-breaker for flood
    /// propagation. Delivery awaits the consumer (backpressure).
    pub async fn send(&self, event: Event) -> Result<(), ChannelError> {
        if let Payload::Message(msg) = &event.payload {
            {
                let mut last = self.last_message.lock().expect("last_message poisoned");
                if let Some(prev) = last.as_ref().and_then(Event::message) {
                    if prev.duplicate(msg) {
                        trace!(id = %msg.id, "suppressed duplicate message");
                        return Ok(());
                    }
                }
                *last = Some(event.clone());
            }
            self.remember(event.clone());
        }
        self.msg_tx
            .send(event)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Publish an announce without blocking. Duplicates of the last announce
    /// are suppressed; a full buffer drops the newest announce.
    pub fn announce(&self, event: Event) -> Result<(), ChannelError> {
        if let Payload::Announce(ann) = &event.payload {
            {
                let mut last = self.last_announce.lock().expect("last_announce poisoned");
                if let Some(Payload::Announce(prev)) = last.as_ref().map(|e| &e.payload) {
                    if prev.duplicate(ann) {
                        trace!(id = %ann.id, "suppressed duplicate announce");
                        return Ok(());
                    }
                }
                *last = Some(event.clone());
            }
            self.remember(event.clone());
        }
        match self.ann_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(ev)) => {
                debug!(kind = ev.payload.kind(), "announce buffer full, dropping");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Receive the next message-path event. Returns `None` once the bus is
    /// closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        self.msg_rx.lock().await.recv().await
    }

    /// Receive the next announce-path event.
    pub async fn recv_announce(&self) -> Option<Event> {
        self.ann_rx.lock().await.recv().await
    }

    /// Record an event in the bounded history without delivering it.
    /// Replaces an existing entry with the same id, so a full Message can
    /// supersede its Announce and be served to requesters.
    pub fn remember(&self, event: Event) {
        if let Some(id) = event.payload.id() {
            self.history.lock().expect("history poisoned").insert(id, event);
        }
    }

    /// Look up an event by id across the live cells and the bounded history.
    /// A hit carrying a full Message body wins over a body-less Announce for
    /// the same id. Ids fallen out of the window return `None`.
    pub fn get(&self, id: MessageId) -> Option<Event> {
        let mut fallback = None;
        for cell in [&self.last_message, &self.last_announce] {
            let guard = cell.lock().expect("channel cell poisoned");
            if let Some(event) = guard.as_ref() {
                if event.payload.id() == Some(id) {
                    if event.message().is_some() {
                        return Some(event.clone());
                    }
                    fallback.get_or_insert_with(|| event.clone());
                }
            }
        }
        if let Some(event) = self.history.lock().expect("history poisoned").get(id) {
            if event.message().is_some() || fallback.is_none() {
                return Some(event);
            }
        }
        fallback
    }

    /// Close both delivery channels. In-flight receives drain what was
    /// already accepted; later sends fail with [`ChannelError::Closed`].
    pub async fn close(&self) {
        self.msg_rx.lock().await.close();
        self.ann_rx.lock().await.close();
    }
}
