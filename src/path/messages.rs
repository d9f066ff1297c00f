//! Typed envelopes exchanged over actor mailboxes
//!
//! Every request carries a oneshot reply sender; a dropped reply or a
//! closed mailbox resolves as `Terminated` at the caller, never a hang.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::frame::Track;

/// Protocol front-end an attach came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Native TCP relay protocol
    Relay,
    /// Adaptive-segment HTTP front
    Hls,
    /// Browser real-time front
    Web,
    /// Recorded-segment replay
    Playback,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Relay => "relay",
            Protocol::Hls => "hls",
            Protocol::Web => "web",
            Protocol::Playback => "playback",
        })
    }
}

/// Attach role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publish,
    Read,
}

/// Credentials captured from a protocol envelope.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub query: Option<String>,
    pub ip: IpAddr,
}

impl Credentials {
    /// Anonymous credentials from an address only.
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            user: None,
            pass: None,
            query: None,
            ip,
        }
    }

    /// Whether any credential material was supplied at all. Fronts use
    /// this to decide between a challenge and a plain denial.
    pub fn provided(&self) -> bool {
        self.user.is_some() || self.pass.is_some()
    }
}

/// Immutable identity of an attached session.
#[derive(Debug, Clone)]
pub struct SessionIdent {
    pub id: Uuid,
    pub protocol: Protocol,
    pub created: SystemTime,
}

impl SessionIdent {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol,
            created: SystemTime::now(),
        }
    }
}

/// Reply to `describe`.
#[derive(Debug, Clone)]
pub struct PathDescription {
    /// Whether a Stream exists right now
    pub ready: bool,
    /// The track set, present iff ready
    pub tracks: Option<Vec<Track>>,
}

/// One attached session, as reported by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub protocol: Protocol,
    /// Seconds since the Unix epoch
    pub created: u64,
}

impl SessionInfo {
    pub fn from_ident(ident: &SessionIdent) -> Self {
        Self {
            id: ident.id,
            protocol: ident.protocol,
            created: ident
                .created
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Admin view of one path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    /// The configuration entry the name resolved to
    pub conf_name: String,
    pub source: Option<SessionInfo>,
    pub source_ready: bool,
    pub readers: Vec<SessionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Relay.to_string(), "relay");
        assert_eq!(Protocol::Hls.to_string(), "hls");
    }

    #[test]
    fn test_credentials_provided() {
        let ip = "127.0.0.1".parse().unwrap();
        assert!(!Credentials::anonymous(ip).provided());

        let with_user = Credentials {
            user: Some("u".into()),
            pass: None,
            query: None,
            ip,
        };
        assert!(with_user.provided());
    }

    #[test]
    fn test_session_info_serializes_protocol() {
        let info = SessionInfo::from_ident(&SessionIdent::new(Protocol::Web));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["protocol"], "web");
    }
}
