//! Wire codec for the native relay protocol
//!
//! Length-prefixed messages over TCP:
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────────────────┐
//! │  length (4)  │   type (1)   │          body             │
//! └──────────────┴──────────────┴───────────────────────────┘
//! ```
//!
//! Control bodies are JSON; frame bodies are binary:
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────┬───────────┬──────────┐
//! │ track (1) │  dts (8)  │  pts_offset (4)  │ flags (1) │ payload  │
//! └───────────┴───────────┴──────────────────┴───────────┴──────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};
use crate::frame::{Frame, Track};

/// Upper bound on any single message, frames included.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const TYPE_HELLO: u8 = 0x01;
const TYPE_HELLO_OK: u8 = 0x02;
const TYPE_ERROR: u8 = 0x03;
const TYPE_TRACKS: u8 = 0x04;
const TYPE_TRACKS_OK: u8 = 0x05;
const TYPE_FRAME: u8 = 0x06;
const TYPE_TERMINATE: u8 = 0x07;

const FLAG_KEYFRAME: u8 = 0b0000_0001;

/// Requested attach role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    Publish,
    Read,
}

/// Client greeting: role, path, credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub role: WireRole,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// All messages on the native wire.
#[derive(Debug, Clone)]
pub enum Message {
    Hello(Hello),
    HelloOk,
    /// Server-side refusal; the connection closes after this
    Error { error: String },
    Tracks(Vec<Track>),
    TracksOk,
    Frame(Frame),
    /// End of stream with a terse reason
    Terminate { reason: String },
}

/// Read one message. Peer disconnects map to `Terminated`, malformed
/// input to `Protocol`.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)
        .await
        .map_err(|_| RelayError::Terminated)?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(RelayError::Protocol(format!("message length {len}")));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)
        .await
        .map_err(|_| RelayError::Terminated)?;

    let kind = body[0];
    let body = Bytes::from(body).slice(1..);
    match kind {
        TYPE_HELLO => Ok(Message::Hello(decode_json(&body)?)),
        TYPE_HELLO_OK => Ok(Message::HelloOk),
        TYPE_ERROR => {
            let v: serde_json::Value = decode_json(&body)?;
            Ok(Message::Error {
                error: v["error"].as_str().unwrap_or("unknown").to_string(),
            })
        }
        TYPE_TRACKS => Ok(Message::Tracks(decode_json(&body)?)),
        TYPE_TRACKS_OK => Ok(Message::TracksOk),
        TYPE_FRAME => Ok(Message::Frame(decode_frame(body)?)),
        TYPE_TERMINATE => {
            let v: serde_json::Value = decode_json(&body)?;
            Ok(Message::Terminate {
                reason: v["reason"].as_str().unwrap_or("unknown").to_string(),
            })
        }
        other => Err(RelayError::Protocol(format!("unknown message type {other:#x}"))),
    }
}

/// Write one message. Write failures map to `Terminated`.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<u64> {
    let body = encode_body(msg)?;
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    let n = out.len() as u64;
    w.write_all(&out).await.map_err(|_| RelayError::Terminated)?;
    w.flush().await.map_err(|_| RelayError::Terminated)?;
    Ok(n)
}

fn encode_body(msg: &Message) -> Result<BytesMut> {
    let mut body = BytesMut::with_capacity(64);
    match msg {
        Message::Hello(h) => {
            body.put_u8(TYPE_HELLO);
            body.put_slice(&encode_json(h)?);
        }
        Message::HelloOk => body.put_u8(TYPE_HELLO_OK),
        Message::Error { error } => {
            body.put_u8(TYPE_ERROR);
            body.put_slice(&encode_json(&serde_json::json!({ "error": error }))?);
        }
        Message::Tracks(tracks) => {
            body.put_u8(TYPE_TRACKS);
            body.put_slice(&encode_json(tracks)?);
        }
        Message::TracksOk => body.put_u8(TYPE_TRACKS_OK),
        Message::Frame(frame) => {
            body.put_u8(TYPE_FRAME);
            encode_frame(&mut body, frame);
        }
        Message::Terminate { reason } => {
            body.put_u8(TYPE_TERMINATE);
            body.put_slice(&encode_json(&serde_json::json!({ "reason": reason }))?);
        }
    }
    Ok(body)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RelayError::Protocol(e.to_string()))
}

fn decode_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| RelayError::Protocol(e.to_string()))
}

pub(crate) fn encode_frame(out: &mut BytesMut, frame: &Frame) {
    out.put_u8(frame.track as u8);
    out.put_i64(frame.dts);
    out.put_i32(frame.pts_offset);
    out.put_u8(if frame.keyframe { FLAG_KEYFRAME } else { 0 });
    out.put_slice(&frame.payload);
}

pub(crate) fn decode_frame(mut body: Bytes) -> Result<Frame> {
    if body.len() < 14 {
        return Err(RelayError::Protocol("short frame header".into()));
    }
    let track = body.get_u8() as usize;
    let dts = body.get_i64();
    let pts_offset = body.get_i32();
    let flags = body.get_u8();
    Ok(Frame {
        track,
        dts,
        pts_offset,
        keyframe: flags & FLAG_KEYFRAME != 0,
        payload: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        read_message(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let msg = Message::Hello(Hello {
            role: WireRole::Publish,
            path: "live/cam1".into(),
            user: Some("u".into()),
            pass: Some("p".into()),
            query: None,
        });
        match round_trip(msg).await {
            Message::Hello(h) => {
                assert_eq!(h.role, WireRole::Publish);
                assert_eq!(h.path, "live/cam1");
                assert_eq!(h.user.as_deref(), Some("u"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frame = Frame::video(0, 123_456, true, Bytes::from_static(&[1, 2, 3]))
            .with_pts_offset(-1500);
        match round_trip(Message::Frame(frame)).await {
            Message::Frame(f) => {
                assert_eq!(f.track, 0);
                assert_eq!(f.dts, 123_456);
                assert_eq!(f.pts_offset, -1500);
                assert!(f.keyframe);
                assert_eq!(&f.payload[..], &[1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tracks_round_trip() {
        let tracks = vec![
            Track::video("avc1.640028", Bytes::from_static(&[9; 4])),
            Track::audio("mp4a.40.2", 48_000, Bytes::new()),
        ];
        match round_trip(Message::Tracks(tracks.clone())).await {
            Message::Tracks(t) => assert_eq!(t, tracks),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_input_is_terminated() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0]);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert_eq!(err, RelayError::Terminated);
    }

    #[tokio::test]
    async fn test_short_frame_rejected() {
        let mut buf = Vec::new();
        // length 2: type byte + one body byte, too short for a frame.
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(TYPE_FRAME);
        buf.push(0);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
