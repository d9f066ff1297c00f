//! Multi-protocol live media relay
//!
//! One publisher per named path, any number of readers, each possibly on
//! a different transport. The crate is organized around actors that own
//! their state and talk through mailboxes:
//!
//! ```text
//!   [native conn]──┐                       ┌──▶ [Reader conn]
//!   [web publish]──┤   PathManager         ├──▶ [HLS muxer ──▶ segments]
//!                  ├──▶  └─ Path actor ────┤
//!                  │       └─ Stream ──────┼──▶ [web ws reader]
//!                  │       └─ on-demand    └──▶ [recorder ──▶ playback]
//!                  │          source
//!   [admin API]────┘
//! ```
//!
//! Frame payloads are reference-counted `Bytes`; fan-out copies handles,
//! never payloads, and a publisher is never throttled by its readers.

pub mod api;
pub mod conf;
pub mod conn;
pub mod error;
pub mod frame;
pub mod hls;
pub mod metrics;
pub mod path;
pub mod playback;
pub mod record;
pub mod routine;
pub mod segmenter;
pub mod server;
pub mod stream;
pub mod web;

pub use error::{RelayError, Result};
pub use frame::{Frame, Track, TrackKind};
pub use routine::RoutinePool;
