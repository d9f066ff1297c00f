//! Native relay protocol front-end
//!
//! The one concrete network protocol shipped with the relay: a
//! length-prefixed TCP framing carrying the handshake, track
//! declarations and frame envelopes. Other protocol fronts (HTTP-based
//! ones aside) are external collaborators that speak to the same Path
//! Manager.

pub mod config;
pub mod listener;
pub mod proto;

pub use config::ServerConfig;
pub use listener::RelayServer;
pub use proto::{Hello, Message, WireRole, MAX_MESSAGE_SIZE};
