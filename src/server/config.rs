//! Native relay server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::conf::Conf;

/// Listener options for the native relay front-end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Handshake must complete within this
    pub handshake_timeout: Duration,
    /// Per-message read deadline on publish loops
    pub read_timeout: Duration,
    /// Per-message write deadline on read loops; slow sockets are cut
    pub write_timeout: Duration,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".parse().unwrap(),
            max_connections: 0,
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Derive listener options from the loaded configuration file.
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            bind_addr: conf
                .relay_address
                .parse()
                .expect("validated at config load"),
            max_connections: conf.max_connections,
            handshake_timeout: conf.handshake_timeout(),
            read_timeout: conf.read_timeout(),
            write_timeout: conf.write_timeout(),
            tcp_nodelay: true,
        }
    }

    /// Set the bind address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}
