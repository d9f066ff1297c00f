//! Path actors and the Path Manager
//!
//! A Path is one logical stream name: a single publisher slot, many
//! readers, an authorization policy, and an optional on-demand source.
//! The manager owns the name → actor map; each actor owns its Stream and
//! reader set. Everything is reached through mailbox messages.

pub mod manager;

mod actor;
mod auth;
mod messages;
mod source;

pub use actor::{PathHandle, PathSettings, PublisherSession, ReaderDetacher, ReaderSession};
pub use auth::AuthHook;
pub use manager::PathManagerHandle;
pub use messages::{
    Credentials, PathDescription, PathInfo, Protocol, Role, SessionIdent, SessionInfo,
};
pub use source::{CommandLauncher, SourceLauncher};
