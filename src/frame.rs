//! Frame envelope and track descriptions
//!
//! Frames are the unit of fan-out: cheap to clone because the payload is a
//! reference-counted `Bytes`. Track sets are fixed when a Stream is created
//! and travel with attach replies so protocol fronts can advertise them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Clock rate used by video tracks (ticks per second).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Description of one media track within a stream.
///
/// The relay is opaque past framing: `params` is the codec's sample-entry
/// blob (e.g. an `avc1` box), produced and consumed by external
/// depacketizers. The relay only copies it into init descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub kind: TrackKind,
    /// Timestamp clock in ticks per second (90000 for video, the sample
    /// rate for audio).
    pub clock_rate: u32,
    /// RFC 6381 style codec string, advertised in playlists.
    pub codec: String,
    /// Opaque sample-entry bytes, passed through to init descriptors.
    #[serde(with = "base64_bytes")]
    pub params: Bytes,
}

impl Track {
    /// Create a video track on the standard 90 kHz clock.
    pub fn video(codec: impl Into<String>, params: Bytes) -> Self {
        Self {
            kind: TrackKind::Video,
            clock_rate: VIDEO_CLOCK_RATE,
            codec: codec.into(),
            params,
        }
    }

    /// Create an audio track on its sample-rate clock.
    pub fn audio(codec: impl Into<String>, clock_rate: u32, params: Bytes) -> Self {
        Self {
            kind: TrackKind::Audio,
            clock_rate,
            codec: codec.into(),
            params,
        }
    }
}

/// A single media frame flowing from a publisher to readers.
///
/// `dts` is in the owning track's clock; `pts_offset` is the signed delta
/// from DTS to presentation time. Fan-out clones this struct; the payload
/// allocation is shared, never copied.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Index into the Stream's track set
    pub track: usize,
    /// Decode timestamp in track clock ticks
    pub dts: i64,
    /// Signed PTS-minus-DTS delta in track clock ticks
    pub pts_offset: i32,
    /// Keyframe bit (video only; always false for audio)
    pub keyframe: bool,
    /// Frame payload (shared, immutable)
    pub payload: Bytes,
}

impl Frame {
    /// Create a video frame.
    pub fn video(track: usize, dts: i64, keyframe: bool, payload: Bytes) -> Self {
        Self {
            track,
            dts,
            pts_offset: 0,
            keyframe,
            payload,
        }
    }

    /// Create an audio frame.
    pub fn audio(track: usize, dts: i64, payload: Bytes) -> Self {
        Self {
            track,
            dts,
            pts_offset: 0,
            keyframe: false,
            payload,
        }
    }

    /// Set the PTS offset (builder style).
    pub fn with_pts_offset(mut self, pts_offset: i32) -> Self {
        self.pts_offset = pts_offset;
        self
    }
}

/// Serde adapter storing `Bytes` as base64 so track sets survive the JSON
/// handshake on the native wire.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        let raw = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        let v = Frame::video(0, 9000, true, Bytes::from_static(b"nal"));
        assert_eq!(v.track, 0);
        assert!(v.keyframe);
        assert_eq!(v.pts_offset, 0);

        let a = Frame::audio(1, 1024, Bytes::from_static(b"aac"));
        assert!(!a.keyframe);
        assert_eq!(a.dts, 1024);
    }

    #[test]
    fn test_pts_offset_builder() {
        let f = Frame::video(0, 0, false, Bytes::new()).with_pts_offset(-3000);
        assert_eq!(f.pts_offset, -3000);
    }

    #[test]
    fn test_clone_shares_payload() {
        let payload = Bytes::from(vec![0u8; 1024]);
        let f = Frame::video(0, 0, true, payload.clone());
        let g = f.clone();
        // Same allocation, not a copy.
        assert_eq!(g.payload.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_track_json_round_trip() {
        let t = Track::video("avc1.640028", Bytes::from_static(&[1, 2, 3]));
        let json = serde_json::to_string(&t).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_audio_track_clock() {
        let t = Track::audio("mp4a.40.2", 48_000, Bytes::new());
        assert_eq!(t.clock_rate, 48_000);
        assert_eq!(t.kind, TrackKind::Audio);
    }
}
