//! Live frames → addressable media segments
//!
//! The Segmenter attaches to a Stream as an ordinary reader and converts
//! the frame sequence into self-contained fMP4 segments addressed by a
//! monotonic sequence number, plus an init descriptor. Adaptive-segment
//! clients and the playback recorder pull from it; a bounded window of
//! recent segments is retained.

pub mod fmp4;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::frame::{Frame, Track, TrackKind};
use crate::metrics::Metrics;
use crate::routine::RoutinePool;
use crate::stream::{ReaderHandle, ReaderItem};

/// Rebased DTS values are stored in 63 bits.
const DTS_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Segmentation tuning.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Target segment duration; produced durations land within one frame
    /// interval of this, except the final segment on Stream close.
    pub target_duration: Duration,
    /// Number of most recent segments retained.
    pub window: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            target_duration: Duration::from_secs(2),
            window: 7,
        }
    }
}

/// A finished segment.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Monotonic sequence number, starting at 0
    pub sequence: u64,
    /// Rebased decode time of the first sample (boundary track)
    pub start_dts: u64,
    /// Actual produced duration
    pub duration: Duration,
    /// moof + mdat bytes
    pub payload: Bytes,
}

/// Playlist-facing view of the retained window.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    pub target_duration: Duration,
    pub segments: Vec<(u64, Duration)>,
    pub closed: bool,
}

struct SegmenterState {
    window: VecDeque<Segment>,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    init: Bytes,
    config: SegmenterConfig,
    state: Mutex<SegmenterState>,
    notify: Notify,
    stop: CancellationToken,
}

/// Pull interface over the live segment sequence.
///
/// Cloning shares the same window; `close` is idempotent and also fires
/// when the upstream Stream terminates.
#[derive(Clone)]
pub struct Segmenter {
    shared: Arc<Shared>,
}

impl Segmenter {
    /// Attach to a Stream (via an already-created reader) and start
    /// producing segments on a pool task.
    pub fn start(
        reader: ReaderHandle,
        config: SegmenterConfig,
        pool: &RoutinePool,
        metrics: Metrics,
    ) -> Self {
        let shared = Arc::new(Shared {
            init: fmp4::write_init(reader.tracks()),
            config: config.clone(),
            state: Mutex::new(SegmenterState {
                window: VecDeque::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            stop: pool.token().child_token(),
        });

        let segmenter = Self {
            shared: shared.clone(),
        };
        let mut builder = Builder::new(reader.tracks().to_vec(), config.target_duration);

        pool.add(move |_| async move {
            loop {
                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    item = reader.next() => match item {
                        ReaderItem::Frame(frame) => {
                            if let Some(finished) = builder.push(frame) {
                                push_segment(&shared, &metrics, finished);
                            }
                        }
                        ReaderItem::Terminated(reason) => {
                            tracing::debug!(%reason, "Segmenter upstream terminated");
                            // The trailing partial segment is exempt from
                            // the duration tolerance.
                            if let Some(finished) = builder.finalize() {
                                push_segment(&shared, &metrics, finished);
                            }
                            break;
                        }
                    }
                }
            }
            mark_closed(&shared);
        });

        segmenter
    }

    /// The init descriptor (ftyp + moov).
    pub fn init(&self) -> Bytes {
        self.shared.init.clone()
    }

    /// Fetch segment `sequence`, optionally waiting up to `wait` for it
    /// to be produced. Evicted and post-close sequences are not found.
    pub async fn segment(&self, sequence: u64, wait: Option<Duration>) -> Result<Segment> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            // Register with the Notify before inspecting state so a
            // notify_waiters between the check and the await is not lost.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock().unwrap();
                if sequence < state.next_seq {
                    return state
                        .window
                        .iter()
                        .find(|s| s.sequence == sequence)
                        .cloned()
                        .ok_or(RelayError::SegmentNotFound);
                }
                if state.closed {
                    return Err(RelayError::SegmentNotFound);
                }
            }
            match deadline {
                None => return Err(RelayError::SegmentNotFound),
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Err(RelayError::Timeout);
                    }
                }
            }
        }
    }

    /// Snapshot of the retained window for playlist generation.
    pub fn playlist(&self) -> PlaylistSnapshot {
        let state = self.shared.state.lock().unwrap();
        PlaylistSnapshot {
            target_duration: self.shared.config.target_duration,
            segments: state
                .window
                .iter()
                .map(|s| (s.sequence, s.duration))
                .collect(),
            closed: state.closed,
        }
    }

    /// Whether the segmenter has terminated.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Stop producing; in-flight waits resolve not-found.
    pub fn close(&self) {
        self.shared.stop.cancel();
        mark_closed(&self.shared);
    }
}

fn push_segment(shared: &Shared, metrics: &Metrics, segment: Segment) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }
    tracing::debug!(
        sequence = segment.sequence,
        duration_ms = segment.duration.as_millis() as u64,
        bytes = segment.payload.len(),
        "Segment produced"
    );
    state.window.push_back(segment);
    state.next_seq += 1;
    while state.window.len() > shared.config.window {
        state.window.pop_front();
    }
    drop(state);
    metrics.inc(&metrics.segments_produced);
    shared.notify.notify_waiters();
}

fn mark_closed(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    if !state.closed {
        state.closed = true;
        drop(state);
        shared.notify.notify_waiters();
    }
}

/// Accumulates frames into the running segment.
struct Builder {
    tracks: Vec<Track>,
    /// Track whose timeline defines segment boundaries: the first video
    /// track, or track 0 when audio-only.
    boundary_track: usize,
    has_video: bool,
    target: Duration,
    base_dts: Option<i64>,
    next_sequence: u64,
    seg_start: Option<u64>,
    accum: Vec<TrackAccum>,
}

struct TrackAccum {
    /// Last sample held back until its duration is known
    pending: Option<PendingSample>,
    samples: Vec<fmp4::SampleEntry>,
    payloads: Vec<Bytes>,
    run_base: Option<u64>,
    last_delta: Option<u32>,
    last_dts: Option<u64>,
}

struct PendingSample {
    dts: u64,
    pts_offset: i32,
    keyframe: bool,
    payload: Bytes,
}

impl Builder {
    fn new(tracks: Vec<Track>, target: Duration) -> Self {
        let boundary_track = tracks
            .iter()
            .position(|t| t.kind == TrackKind::Video)
            .unwrap_or(0);
        let has_video = tracks.iter().any(|t| t.kind == TrackKind::Video);
        let accum = tracks
            .iter()
            .map(|_| TrackAccum {
                pending: None,
                samples: Vec::new(),
                payloads: Vec::new(),
                run_base: None,
                last_delta: None,
                last_dts: None,
            })
            .collect();
        Self {
            tracks,
            boundary_track,
            has_video,
            target,
            base_dts: None,
            next_sequence: 0,
            seg_start: None,
            accum,
        }
    }

    fn target_ticks(&self, track: usize) -> u64 {
        (self.target.as_secs_f64() * f64::from(self.tracks[track].clock_rate)) as u64
    }

    /// Feed one frame; returns a finished segment when a boundary closed.
    fn push(&mut self, frame: Frame) -> Option<Segment> {
        let base = *self.base_dts.get_or_insert(frame.dts);
        let rel = match frame.dts.checked_sub(base) {
            Some(d) if d >= 0 => (d as u64) & DTS_MASK,
            _ => {
                // Publisher-side validation already rejects this; never
                // rebase backwards here.
                tracing::warn!(track = frame.track, dts = frame.dts, "Non-monotonic DTS discarded");
                return None;
            }
        };

        if let Some(last) = self.accum[frame.track].last_dts {
            if rel < last {
                tracing::warn!(track = frame.track, "Non-monotonic DTS discarded");
                return None;
            }
        }

        let mut finished = None;
        if frame.track == self.boundary_track {
            let start = *self.seg_start.get_or_insert(rel);
            let boundary_ok = !self.has_video || frame.keyframe;
            if boundary_ok
                && rel.saturating_sub(start) >= self.target_ticks(self.boundary_track)
                && self.has_samples()
            {
                finished = self.finalize_at(rel);
                self.seg_start = Some(rel);
            }
        }

        self.append(frame, rel);
        finished
    }

    fn has_samples(&self) -> bool {
        self.accum
            .iter()
            .any(|a| a.pending.is_some() || !a.samples.is_empty())
    }

    fn append(&mut self, frame: Frame, rel: u64) {
        let acc = &mut self.accum[frame.track];
        if let Some(prev) = acc.pending.take() {
            let delta = (rel - prev.dts) as u32;
            acc.last_delta = Some(delta);
            Self::commit(acc, prev, delta);
        }
        acc.run_base.get_or_insert(rel);
        acc.last_dts = Some(rel);
        acc.pending = Some(PendingSample {
            dts: rel,
            pts_offset: frame.pts_offset,
            keyframe: frame.keyframe,
            payload: frame.payload,
        });
    }

    fn commit(acc: &mut TrackAccum, sample: PendingSample, duration: u32) {
        acc.samples.push(fmp4::SampleEntry {
            duration,
            size: sample.payload.len() as u32,
            keyframe: sample.keyframe,
            pts_offset: sample.pts_offset,
        });
        acc.payloads.push(sample.payload);
    }

    /// Close the running segment at boundary time `end` (exclusive).
    fn finalize_at(&mut self, end: u64) -> Option<Segment> {
        let start = self.seg_start?;

        let target_ticks: Vec<u64> = (0..self.accum.len()).map(|idx| self.target_ticks(idx)).collect();

        let mut runs = Vec::new();
        for (idx, acc) in self.accum.iter_mut().enumerate() {
            if let Some(prev) = acc.pending.take() {
                // The held-back sample's duration runs to the boundary on
                // the boundary track, otherwise to its usual interval.
                let duration = if idx == self.boundary_track {
                    (end.saturating_sub(prev.dts)) as u32
                } else {
                    acc.last_delta.unwrap_or(target_ticks[idx] as u32)
                };
                let prev_dts = prev.dts;
                Self::commit(acc, prev, duration.max(1));
                acc.last_dts = Some(prev_dts);
            }
            if acc.samples.is_empty() {
                acc.run_base = None;
                continue;
            }
            runs.push(fmp4::TrackRun {
                track_id: idx as u32 + 1,
                base_dts: acc.run_base.take().unwrap_or(0),
                samples: std::mem::take(&mut acc.samples),
                payloads: std::mem::take(&mut acc.payloads),
            });
        }

        if runs.is_empty() {
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let clock = f64::from(self.tracks[self.boundary_track].clock_rate);
        let duration = Duration::from_secs_f64(end.saturating_sub(start) as f64 / clock);

        Some(Segment {
            sequence,
            start_dts: start,
            duration,
            payload: fmp4::write_segment(sequence as u32, &runs),
        })
    }

    /// Flush the trailing partial segment on Stream close.
    fn finalize(&mut self) -> Option<Segment> {
        let acc = &self.accum[self.boundary_track];
        let end = acc
            .pending
            .as_ref()
            .map(|p| p.dts + u64::from(acc.last_delta.unwrap_or(1)))
            .or(acc.last_dts)?;
        self.finalize_at(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::stream::Stream;

    fn video_track() -> Vec<Track> {
        vec![Track::video("avc1.640028", Bytes::from_static(&[0u8; 16]))]
    }

    /// 30 fps on the 90 kHz clock.
    const FRAME_TICKS: i64 = 3000;

    fn feed(builder: &mut Builder, n: i64, keyframe_every: i64) -> Vec<Segment> {
        let mut out = Vec::new();
        for i in 0..n {
            let frame = Frame::video(
                0,
                i * FRAME_TICKS,
                i % keyframe_every == 0,
                Bytes::from_static(&[0xCC; 64]),
            );
            if let Some(seg) = builder.push(frame) {
                out.push(seg);
            }
        }
        out
    }

    #[test]
    fn test_boundary_on_keyframe_after_target() {
        // 1s target at 30 fps, keyframe every 30 frames: segments close
        // exactly at each keyframe.
        let mut b = Builder::new(video_track(), Duration::from_secs(1));
        let segs = feed(&mut b, 91, 30);
        assert_eq!(segs.len(), 3);
        for seg in &segs {
            let err = (seg.duration.as_secs_f64() - 1.0).abs();
            assert!(err < 3000.0 / 90_000.0, "duration off: {:?}", seg.duration);
        }
        assert_eq!(segs[0].sequence, 0);
        assert_eq!(segs[1].sequence, 1);
        assert_eq!(segs[1].start_dts, 30 * FRAME_TICKS as u64);
    }

    #[test]
    fn test_rebasing_starts_at_zero() {
        // Source DTS starts far from zero; the first segment is rebased.
        let mut b = Builder::new(video_track(), Duration::from_secs(1));
        let mut first = None;
        for i in 0..31 {
            let seg = b.push(Frame::video(
                0,
                500_000 + i * FRAME_TICKS,
                i % 30 == 0,
                Bytes::from_static(&[1; 8]),
            ));
            first = first.or(seg);
        }
        let seg = first.expect("boundary at frame 30");
        assert_eq!(seg.sequence, 0);
        assert_eq!(seg.start_dts, 0);
    }

    #[test]
    fn test_non_monotonic_dts_discarded() {
        let mut b = Builder::new(video_track(), Duration::from_secs(1));
        b.push(Frame::video(0, 9000, true, Bytes::from_static(&[1; 8])));
        assert!(b.push(Frame::video(0, 3000, false, Bytes::new())).is_none());
        // The bad frame left no sample behind.
        let seg = b.finalize().unwrap();
        assert_eq!(seg.start_dts, 0);
    }

    #[test]
    fn test_audio_only_boundary_by_elapsed_time() {
        let tracks = vec![Track::audio("mp4a.40.2", 48_000, Bytes::new())];
        let mut b = Builder::new(tracks, Duration::from_secs(1));
        let mut segs = Vec::new();
        // 1024-sample AAC frames: ~46.9 per second.
        for i in 0..100 {
            if let Some(s) = b.push(Frame::audio(0, i * 1024, Bytes::from_static(&[5; 32]))) {
                segs.push(s);
            }
        }
        assert!(!segs.is_empty());
        let err = (segs[0].duration.as_secs_f64() - 1.0).abs();
        assert!(err < 1024.0 / 48_000.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn test_window_eviction_and_not_found() {
        let stream = Stream::new(video_track(), 100, metrics::new());
        let pool = RoutinePool::new();
        let seg = Segmenter::start(
            stream.add_reader(1024),
            SegmenterConfig {
                target_duration: Duration::from_secs(1),
                window: 2,
            },
            &pool,
            metrics::new(),
        );

        for i in 0..121 {
            stream.write_frame(Frame::video(
                0,
                i * FRAME_TICKS,
                i % 30 == 0,
                Bytes::from_static(&[7; 32]),
            ));
        }

        // Segments 0..=3 produced; window keeps the last two.
        let s3 = seg.segment(3, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(s3.sequence, 3);
        assert_eq!(
            seg.segment(0, None).await.unwrap_err(),
            RelayError::SegmentNotFound
        );

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let stream = Stream::new(video_track(), 100, metrics::new());
        let pool = RoutinePool::new();
        let seg = Segmenter::start(
            stream.add_reader(64),
            SegmenterConfig::default(),
            &pool,
            metrics::new(),
        );

        let err = seg
            .segment(0, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_upstream_close_flushes_partial_and_closes() {
        let stream = Stream::new(video_track(), 100, metrics::new());
        let pool = RoutinePool::new();
        let seg = Segmenter::start(
            stream.add_reader(1024),
            SegmenterConfig {
                target_duration: Duration::from_secs(10),
                window: 4,
            },
            &pool,
            metrics::new(),
        );

        for i in 0..10 {
            stream.write_frame(Frame::video(
                0,
                i * FRAME_TICKS,
                i == 0,
                Bytes::from_static(&[3; 16]),
            ));
        }
        stream.close();

        // The final short segment is flushed despite missing the target.
        let s0 = seg.segment(0, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(s0.sequence, 0);
        assert!(s0.duration < Duration::from_secs(10));

        // Everything after the close is not-found, including waits.
        let err = seg.segment(1, Some(Duration::from_secs(5))).await.unwrap_err();
        assert_eq!(err, RelayError::SegmentNotFound);
        assert!(seg.is_closed());

        pool.cancel();
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_init_available_immediately() {
        let stream = Stream::new(video_track(), 100, metrics::new());
        let pool = RoutinePool::new();
        let seg = Segmenter::start(
            stream.add_reader(64),
            SegmenterConfig::default(),
            &pool,
            metrics::new(),
        );
        let init = seg.init();
        assert_eq!(&init[4..8], b"ftyp");

        pool.cancel();
        pool.wait().await;
    }
}
