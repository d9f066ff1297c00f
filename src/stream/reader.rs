//! Reader handles and their bounded queues
//!
//! A `ReaderHandle` is a relation, not ownership: the Stream (via its
//! Path actor) may invalidate it unilaterally, at which point `next()`
//! yields a terminal marker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::RelayError;
use crate::frame::{Frame, Track};

/// What a reader receives from `next()`.
#[derive(Debug, Clone)]
pub enum ReaderItem {
    /// The next frame, per-track FIFO order preserved
    Frame(Frame),
    /// Terminal marker: the handle is dead and stays dead
    Terminated(RelayError),
}

/// Queues and gate state for one reader, shared between the Stream's
/// write path and the handle's read path.
#[derive(Debug)]
pub(super) struct ReaderShared {
    pub(super) id: u64,
    pub(super) capacity: usize,
    pub(super) dropped: AtomicU64,
    pub(super) queues: Mutex<ReaderQueues>,
    pub(super) notify: Notify,
}

#[derive(Debug)]
pub(super) struct ReaderQueues {
    /// One bounded FIFO per track
    pub(super) tracks: Vec<VecDeque<Frame>>,
    /// Closed until the first video keyframe (or first frame when the
    /// stream carries no video)
    pub(super) gate_open: bool,
    pub(super) terminal: Option<RelayError>,
}

impl ReaderShared {
    pub(super) fn new(id: u64, capacity: usize, track_count: usize, gate_open: bool) -> Self {
        Self {
            id,
            capacity,
            dropped: AtomicU64::new(0),
            queues: Mutex::new(ReaderQueues {
                tracks: (0..track_count).map(|_| VecDeque::new()).collect(),
                gate_open,
                terminal: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark the reader dead. `flush` discards anything still queued so
    /// the next `next()` observes the terminal immediately.
    pub(super) fn terminate(&self, reason: RelayError, flush: bool) {
        let mut q = self.queues.lock().unwrap();
        if q.terminal.is_none() {
            q.terminal = Some(reason);
        }
        if flush {
            for t in &mut q.tracks {
                t.clear();
            }
        }
        drop(q);
        self.notify.notify_one();
    }
}

/// Per-reader view of a Stream.
///
/// Holds the shared queue state; dropping the handle does not detach the
/// reader (the owning Path does that explicitly), but the handle becomes
/// terminal as soon as the Stream invalidates it.
#[derive(Debug)]
pub struct ReaderHandle {
    pub(super) shared: Arc<ReaderShared>,
    pub(super) tracks: Arc<Vec<Track>>,
}

impl ReaderHandle {
    /// Stable identifier of this reader within its Stream.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The Stream's track set, fixed for its lifetime.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Frames dropped for this reader so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next frame or the terminal marker.
    ///
    /// Queued frames are drained before a terminal is reported, except
    /// when the reader was detached forcibly (kick, overflow eviction),
    /// in which case the queues were flushed and the terminal is
    /// immediate. Cancellation-safe: a lost wakeup is re-checked on the
    /// next call.
    pub async fn next(&self) -> ReaderItem {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut q = self.shared.queues.lock().unwrap();
                if let Some(frame) = pop_earliest(&mut q.tracks) {
                    return ReaderItem::Frame(frame);
                }
                if let Some(reason) = q.terminal.clone() {
                    return ReaderItem::Terminated(reason);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `next()`, for tests and drain loops.
    pub fn try_next(&self) -> Option<ReaderItem> {
        let mut q = self.shared.queues.lock().unwrap();
        if let Some(frame) = pop_earliest(&mut q.tracks) {
            return Some(ReaderItem::Frame(frame));
        }
        q.terminal.clone().map(ReaderItem::Terminated)
    }
}

/// Pop the queued head with the lowest DTS across tracks. Ties go to the
/// lowest track index, which keeps delivery deterministic.
fn pop_earliest(tracks: &mut [VecDeque<Frame>]) -> Option<Frame> {
    let mut best: Option<(usize, i64)> = None;
    for (idx, q) in tracks.iter().enumerate() {
        if let Some(head) = q.front() {
            match best {
                Some((_, dts)) if dts <= head.dts => {}
                _ => best = Some((idx, head.dts)),
            }
        }
    }
    best.and_then(|(idx, _)| tracks[idx].pop_front())
}
