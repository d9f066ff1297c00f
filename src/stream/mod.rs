//! Stream fan-out from one publisher to many readers
//!
//! A Stream exists only while a publisher is active on a path. Frames
//! written by the publisher are multicast into per-reader bounded queues;
//! the publisher is never slowed by any reader.
//!
//! # Architecture
//!
//! ```text
//!                         Stream (owned by a Path actor)
//!                  ┌────────────────────────────────────────┐
//!                  │ tracks: [Track]                        │
//!                  │ readers: HashMap<id,                   │
//!                  │   ReaderShared {                       │
//!                  │     per-track bounded FIFO,            │
//!                  │     drop counter,                      │
//!                  │   }                                    │
//!                  │ >                                      │
//!                  └──────────────────┬─────────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              ▼                      ▼                      ▼
//!         [Reader]               [Reader]               [Segmenter]
//!         next().await           next().await           next().await
//! ```
//!
//! # Zero-copy design
//!
//! Frame payloads are `bytes::Bytes`: fan-out clones the `Frame` struct,
//! but the payload allocation is reference-counted and shared. A full
//! queue drops the frame for that reader only and bumps its drop counter;
//! past the threshold the reader is ejected with a `ReaderOverflow`
//! terminal marker.

mod fanout;
mod reader;

pub use fanout::Stream;
pub use reader::{ReaderHandle, ReaderItem};

/// Default drop threshold before a slow reader is ejected.
pub const DEFAULT_OVERFLOW_THRESHOLD: u64 = 100;

/// Default per-track queue capacity handed to readers.
pub const DEFAULT_READER_BUFFER: usize = 64;
