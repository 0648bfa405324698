//! Wire framing: 4-byte big-endian length prefix, then a one-byte event
//! discriminant, then the bincode-encoded event body.
//!
//! A declared length above [`crate::MAX_FRAME_SIZE`] fails decoding before any
//! body bytes are read, so a corrupt or malicious peer cannot make us allocate
//! multi-gigabyte buffers. Scratch buffers are pooled and returned on success
//! and error alike.

use std::sync::Mutex;

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Announce, Event, Handshake, Message, Payload, ProtocolError, Request};
use crate::identity::NodeId;
use crate::MAX_FRAME_SIZE;

const KIND_HANDSHAKE: u8 = 1;
const KIND_MESSAGE: u8 = 2;
const KIND_ANNOUNCE: u8 = 3;
const KIND_REQUEST: u8 = 4;

/// Envelope fields shared by all four kinds on the wire. The origin node id
/// travels here and is reconstructed into [`Event::from`] at decode time.
#[derive(Serialize, Deserialize)]
struct WireFrame<T> {
    node: u64,
    created_ms: i64,
    payload: T,
}

static BUF_POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));
const POOL_LIMIT: usize = 8;
const POOL_BUF_CAP: usize = 64 * 1024;

/// Scratch buffer checked out of the pool; returned on drop.
struct PooledBuf(Vec<u8>);

impl PooledBuf {
    fn acquire() -> Self {
        let buf = BUF_POOL
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(POOL_BUF_CAP));
        Self(buf)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.0);
        buf.clear();
        // A frame near the size limit would otherwise pin its capacity in
        // the pool indefinitely.
        if buf.capacity() > POOL_BUF_CAP {
            buf.shrink_to(POOL_BUF_CAP);
        }
        let mut pool = BUF_POOL.lock().expect("buffer pool poisoned");
        if pool.len() < POOL_LIMIT {
            pool.push(buf);
        }
    }
}

fn wire_kind(payload: &Payload) -> u8 {
    match payload {
        Payload::Handshake(_) => KIND_HANDSHAKE,
        Payload::Message(_) => KIND_MESSAGE,
        Payload::Announce(_) => KIND_ANNOUNCE,
        Payload::Request(_) => KIND_REQUEST,
    }
}

fn encode_body(event: &Event, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    buf.push(wire_kind(&event.payload));
    let node = event.from.0;
    let created_ms = event.created.timestamp_millis();
    let cfg = bincode::config::standard();
    match &event.payload {
        Payload::Handshake(p) => {
            bincode::serde::encode_into_std_write(
                WireFrame { node, created_ms, payload: p },
                buf,
                cfg,
            )?;
        }
        Payload::Message(p) => {
            bincode::serde::encode_into_std_write(
                WireFrame { node, created_ms, payload: p },
                buf,
                cfg,
            )?;
        }
        Payload::Announce(p) => {
            bincode::serde::encode_into_std_write(
                WireFrame { node, created_ms, payload: p },
                buf,
                cfg,
            )?;
        }
        Payload::Request(p) => {
            bincode::serde::encode_into_std_write(
                WireFrame { node, created_ms, payload: p },
                buf,
                cfg,
            )?;
        }
    }
    Ok(())
}

fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<(NodeId, chrono::DateTime<chrono::Utc>, T), ProtocolError> {
    let cfg = bincode::config::standard();
    let (frame, _): (WireFrame<T>, usize) = bincode::serde::decode_from_slice(body, cfg)?;
    let created = chrono::DateTime::from_timestamp_millis(frame.created_ms)
        .unwrap_or_else(chrono::Utc::now);
    Ok((NodeId(frame.node), created, frame.payload))
}

fn decode_body(body: &[u8]) -> Result<Event, ProtocolError> {
    let (&kind, rest) = body.split_first().ok_or(ProtocolError::Truncated)?;
    let (from, created, payload) = match kind {
        KIND_HANDSHAKE => {
            let (n, c, p) = decode_frame::<Handshake>(rest)?;
            (n, c, Payload::Handshake(p))
        }
        KIND_MESSAGE => {
            let (n, c, p) = decode_frame::<Message>(rest)?;
            (n, c, Payload::Message(p))
        }
        KIND_ANNOUNCE => {
            let (n, c, p) = decode_frame::<Announce>(rest)?;
            (n, c, Payload::Announce(p))
        }
        KIND_REQUEST => {
            let (n, c, p) = decode_frame::<Request>(rest)?;
            (n, c, Payload::Request(p))
        }
        other => return Err(ProtocolError::UnknownEventKind(other)),
    };
    Ok(Event { from, created, payload })
}

/// Encode one event as a complete frame: length prefix plus body.
pub fn encode_event(event: &Event) -> Result<Bytes, ProtocolError> {
    let mut scratch = PooledBuf::acquire();
    encode_body(event, &mut scratch.0)?;
    let body = &scratch.0;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    Ok(Bytes::from(out))
}

/// Decode one event from complete frame bytes.
pub fn decode_event(frame: &[u8]) -> Result<Event, ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            limit: MAX_FRAME_SIZE,
        });
    }
    let body = frame
        .get(4..4 + declared)
        .ok_or(ProtocolError::Truncated)?;
    decode_body(body)
}

/// Write one framed event into `writer`, returning the bytes written.
pub async fn encode_writer<W>(event: &Event, writer: &mut W) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut scratch = PooledBuf::acquire();
    encode_body(event, &mut scratch.0)?;
    let body = &scratch.0;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(4 + body.len())
}

/// Read one framed event from `reader`.
///
/// Fails with [`ProtocolError::FrameTooLarge`] before reading the body when
/// the declared length exceeds the limit.
pub async fn decode_reader<R>(reader: &mut R) -> Result<Event, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let declared = reader.read_u32().await? as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut scratch = PooledBuf::acquire();
    scratch.0.resize(declared, 0);
    reader.read_exact(&mut scratch.0).await?;
    decode_body(&scratch.0)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::identity::{Device, IdGenerator};

    fn sample_events() -> Vec<Event> {
        let g = IdGenerator::with_tag(0x155);
        let node = g.node_id();
        let msg = Message::new(g.message_id(), b"hello mesh".to_vec(), "text/plain");
        let ann = Announce::from(&msg);
        let req = Request { id: msg.id };
        let hs = Handshake {
            version: super::super::PROTOCOL_VERSION,
            port: 7777,
            device: Device {
                id: node,
                name: "tester@host".into(),
                arch: "x86_64".into(),
            },
            provider: "memory".into(),
        };
        vec![
            Event::new(node, Payload::Handshake(hs)),
            Event::new(node, Payload::Message(msg)),
            Event::new(node, Payload::Announce(ann)),
            Event::new(node, Payload::Request(req)),
        ]
    }

    #[tokio::test]
    async fn test_round_trip_all_kinds() {
        for event in sample_events() {
            let frame = encode_event(&event).unwrap();
            let mut cursor = Cursor::new(frame.as_ref());
            let decoded = decode_reader(&mut cursor).await.unwrap();
            // From is reconstructed from the wire node encoding.
            assert_eq!(decoded.from, event.from);
            assert_eq!(decoded.payload, event.payload);
            assert_eq!(
                decoded.created.timestamp_millis(),
                event.created.timestamp_millis()
            );
        }
    }

    #[tokio::test]
    async fn test_writer_reader_round_trip() {
        let event = sample_events().remove(1);
        let mut buf = Cursor::new(Vec::new());
        let written = encode_writer(&event, &mut buf).await.unwrap();
        assert_eq!(written, buf.get_ref().len());

        let mut cursor = Cursor::new(buf.get_ref().as_slice());
        let decoded = decode_reader(&mut cursor).await.unwrap();
        assert_eq!(decoded.payload, event.payload);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_body_read() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = Cursor::new(frame.as_slice());
        match decode_reader(&mut cursor).await {
            Err(ProtocolError::FrameTooLarge { declared, .. }) => {
                assert_eq!(declared, u32::MAX as usize);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let body = [0xEEu8, 0, 0, 0];
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        let mut cursor = Cursor::new(frame.as_slice());
        match decode_reader(&mut cursor).await {
            Err(ProtocolError::UnknownEventKind(k)) => assert_eq!(k, 0xEE),
            other => panic!("expected UnknownEventKind, got {other:?}"),
        }
    }

    #[test]
    fn test_pool_does_not_retain_oversized_buffers() {
        {
            let mut big = PooledBuf::acquire();
            big.0.resize(MAX_FRAME_SIZE / 2, 0);
        }
        // Every pooled (and fresh) buffer stays at the bounded capacity.
        for _ in 0..POOL_LIMIT + 1 {
            let buf = PooledBuf::acquire();
            assert!(buf.0.capacity() <= POOL_BUF_CAP);
        }
    }

    #[tokio::test]
    async fn test_empty_frame_is_truncated() {
        let frame = 0u32.to_be_bytes();
        let mut cursor = Cursor::new(frame.as_slice());
        assert!(matches!(
            decode_reader(&mut cursor).await,
            Err(ProtocolError::Truncated)
        ));
    }
}
