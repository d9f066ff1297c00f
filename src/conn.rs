//! Generic per-connection state shared by every protocol front-end
//!
//! Tracks the lifecycle phases every endpoint walks through (handshake →
//! authorize → attach → active → close), plus the immutable identity and
//! byte counters the admin API reports. The protocol-specific work
//! happens in each server; this is the part they all share.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::path::Protocol;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnPhase {
    /// Handshake done, credentials not yet accepted
    PreAuth,
    /// Credentials accepted, not yet attached
    Authorized,
    /// Attached to a path as its publisher
    Publisher,
    /// Attached to a path as a reader
    Reader,
    Closing,
    Closed,
}

/// Identity and counters for one connection.
#[derive(Debug)]
pub struct ConnInfo {
    pub id: Uuid,
    pub remote: SocketAddr,
    pub protocol: Protocol,
    pub created: SystemTime,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    phase: Mutex<ConnPhase>,
}

impl ConnInfo {
    pub fn new(remote: SocketAddr, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            protocol,
            created: SystemTime::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            phase: Mutex::new(ConnPhase::PreAuth),
        }
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_phase(&self, phase: ConnPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn phase(&self) -> ConnPhase {
        *self.phase.lock().unwrap()
    }

    /// Plain copy for the admin API.
    pub fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            id: self.id,
            remote_addr: self.remote.to_string(),
            protocol: self.protocol,
            created: self
                .created
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            state: self.phase(),
        }
    }
}

/// Admin-API view of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnSnapshot {
    pub id: Uuid,
    pub remote_addr: String,
    pub protocol: Protocol,
    /// Seconds since the Unix epoch
    pub created: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub state: ConnPhase,
}

struct ConnEntry {
    info: Arc<ConnInfo>,
    stop: CancellationToken,
}

/// Registry of live connections, shared between servers and the admin
/// API. Kick cancels the connection's token; the connection unregisters
/// itself on the way out, so re-kicking a gone id is not found.
#[derive(Clone, Default)]
pub struct ConnRegistry {
    inner: Arc<Mutex<HashMap<Uuid, ConnEntry>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: Arc<ConnInfo>, stop: CancellationToken) {
        self.inner
            .lock()
            .unwrap()
            .insert(info.id, ConnEntry { info, stop });
    }

    pub fn unregister(&self, id: Uuid) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// Snapshot of connections for one protocol front.
    pub fn list(&self, protocol: Protocol) -> Vec<ConnSnapshot> {
        let mut out: Vec<ConnSnapshot> = self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.info.protocol == protocol)
            .map(|e| e.info.snapshot())
            .collect();
        out.sort_by_key(|c| c.created);
        out
    }

    /// Terminate a connection by id.
    pub fn kick(&self, id: Uuid) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let entry = guard.get(&id).ok_or(RelayError::PathNotFound)?;
        entry.info.set_phase(ConnPhase::Closing);
        entry.stop.cancel();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> Arc<ConnInfo> {
        Arc::new(ConnInfo::new(
            "127.0.0.1:5000".parse().unwrap(),
            Protocol::Relay,
        ))
    }

    #[test]
    fn test_phase_walk() {
        let conn = info();
        assert_eq!(conn.phase(), ConnPhase::PreAuth);
        conn.set_phase(ConnPhase::Authorized);
        conn.set_phase(ConnPhase::Reader);
        assert_eq!(conn.phase(), ConnPhase::Reader);
    }

    #[test]
    fn test_snapshot_counters() {
        let conn = info();
        conn.add_bytes_received(100);
        conn.add_bytes_received(50);
        conn.add_bytes_sent(7);
        let snap = conn.snapshot();
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.bytes_sent, 7);
        assert_eq!(snap.remote_addr, "127.0.0.1:5000");
    }

    #[test]
    fn test_registry_kick_and_rekick() {
        let registry = ConnRegistry::new();
        let conn = info();
        let stop = CancellationToken::new();
        registry.register(conn.clone(), stop.clone());

        registry.kick(conn.id).unwrap();
        assert!(stop.is_cancelled());

        // The connection unregisters on exit; a later kick is not found.
        registry.unregister(conn.id);
        assert_eq!(registry.kick(conn.id).unwrap_err(), RelayError::PathNotFound);
    }

    #[test]
    fn test_list_filters_by_protocol() {
        let registry = ConnRegistry::new();
        registry.register(info(), CancellationToken::new());
        registry.register(
            Arc::new(ConnInfo::new(
                "127.0.0.1:5001".parse().unwrap(),
                Protocol::Web,
            )),
            CancellationToken::new(),
        );

        assert_eq!(registry.list(Protocol::Relay).len(), 1);
        assert_eq!(registry.list(Protocol::Web).len(), 1);
        assert_eq!(registry.list(Protocol::Hls).len(), 0);
        assert_eq!(registry.len(), 2);
    }
}
