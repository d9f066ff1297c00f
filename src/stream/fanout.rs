//! The fan-out object itself

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::RelayError;
use crate::frame::{Frame, Track, TrackKind};
use crate::metrics::Metrics;

use super::reader::{ReaderHandle, ReaderShared};

/// Multicasts frames from one publisher to N readers.
///
/// Cloning shares the same fan-out state; the Path actor keeps one clone
/// and hands others to the publisher's write loop.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    tracks: Arc<Vec<Track>>,
    has_video: bool,
    overflow_threshold: u64,
    metrics: Metrics,
    state: Mutex<FanoutState>,
}

struct FanoutState {
    readers: HashMap<u64, Arc<ReaderShared>>,
    next_id: u64,
    closed: bool,
}

impl Stream {
    /// Create a Stream with its track set fixed for life.
    pub fn new(tracks: Vec<Track>, overflow_threshold: u64, metrics: Metrics) -> Self {
        let has_video = tracks.iter().any(|t| t.kind == TrackKind::Video);
        Self {
            inner: Arc::new(StreamInner {
                tracks: Arc::new(tracks),
                has_video,
                overflow_threshold,
                metrics,
                state: Mutex::new(FanoutState {
                    readers: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// The track set advertised to readers.
    pub fn tracks(&self) -> &[Track] {
        &self.inner.tracks
    }

    /// Number of currently attached readers.
    pub fn reader_count(&self) -> usize {
        self.inner.state.lock().unwrap().readers.len()
    }

    /// Enqueue `frame` into every reader's queue for its track.
    ///
    /// Non-blocking and infallible: a full queue drops the frame for that
    /// reader only. Readers past the drop threshold are ejected here with
    /// a `ReaderOverflow` terminal. A no-op after `close()`.
    pub fn write_frame(&self, frame: Frame) {
        if frame.track >= self.inner.tracks.len() {
            tracing::debug!(track = frame.track, "Frame for unknown track discarded");
            return;
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }

        let mut evicted: Vec<u64> = Vec::new();
        for (id, reader) in &state.readers {
            if !self.deliver(reader, &frame) {
                evicted.push(*id);
            }
        }

        for id in evicted {
            state.readers.remove(&id);
            self.inner.metrics.inc(&self.inner.metrics.readers_ejected);
            tracing::warn!(reader = id, "Reader ejected: drop threshold exceeded");
        }
    }

    /// Returns false when the reader crossed the overflow threshold.
    fn deliver(&self, reader: &Arc<ReaderShared>, frame: &Frame) -> bool {
        let mut q = reader.queues.lock().unwrap();
        if q.terminal.is_some() {
            return true;
        }

        // Late joiners start at the next keyframe boundary. Skipped
        // frames are not drops.
        if !q.gate_open {
            if !frame.keyframe {
                return true;
            }
            q.gate_open = true;
        }

        let queue = &mut q.tracks[frame.track];
        if queue.len() >= reader.capacity {
            self.inner.metrics.inc(&self.inner.metrics.frames_dropped);
            let dropped = reader.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped > self.inner.overflow_threshold {
                q.terminal = Some(RelayError::ReaderOverflow);
                for t in &mut q.tracks {
                    t.clear();
                }
                drop(q);
                reader.notify.notify_one();
                return false;
            }
            return true;
        }

        queue.push_back(frame.clone());
        self.inner.metrics.inc(&self.inner.metrics.frames_relayed);
        drop(q);
        reader.notify.notify_one();
        true
    }

    /// Attach a reader with a per-track queue of `buffer_size` frames.
    ///
    /// On a closed Stream the handle is born terminal.
    pub fn add_reader(&self, buffer_size: usize) -> ReaderHandle {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        // Audio-only streams have no keyframe boundary to wait for, so
        // their gate starts open.
        let shared = Arc::new(ReaderShared::new(
            id,
            buffer_size.max(1),
            self.inner.tracks.len(),
            !self.inner.has_video,
        ));

        if state.closed {
            shared.terminate(RelayError::Terminated, true);
        } else {
            state.readers.insert(id, shared.clone());
        }

        ReaderHandle {
            shared,
            tracks: self.inner.tracks.clone(),
        }
    }

    /// Detach a reader. Its queues are flushed and `next()` observes the
    /// terminal immediately. Safe to call twice.
    pub fn remove_reader(&self, handle: &ReaderHandle) {
        self.remove_reader_by_id(handle.id());
    }

    /// Detach by reader id; used by the owning Path, which keeps ids
    /// rather than handles.
    pub fn remove_reader_by_id(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(reader) = state.readers.remove(&id) {
            reader.terminate(RelayError::Terminated, true);
        }
    }

    /// Close the Stream: every reader receives a terminal marker after
    /// draining what is already queued, and further writes are no-ops.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        for reader in state.readers.values() {
            reader.terminate(RelayError::Terminated, false);
        }
        state.readers.clear();
    }
}
