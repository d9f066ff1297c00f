//! Configuration model and file loading
//!
//! One TOML file: a global section plus `[paths.<name>]` tables. Path
//! entries keep declaration order (it breaks template-ranking ties), so
//! the map is an `IndexMap`.

mod path;

pub use path::{
    is_template, literal_prefix_len, template_match, validate_path_name, IpRange, PathConf,
};

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Conf {
    /// Native relay protocol listener
    pub relay_address: String,
    /// HTTP listener: adaptive-segment, browser and playback endpoints
    pub http_address: String,
    /// Administrative API listener
    pub api_address: String,

    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Shutdown grace; the supervisor must return within twice this
    pub shutdown_grace_secs: u64,
    /// Maximum concurrent native connections (0 = unlimited)
    pub max_connections: usize,

    /// Per-track reader queue capacity (power of two recommended)
    pub reader_buffer: usize,
    /// Dropped frames tolerated before a reader is ejected
    pub overflow_threshold: u64,

    pub segment_duration_secs: u64,
    pub segment_window: usize,
    /// How long a segment request may wait for a not-yet-produced sequence
    pub segment_wait_secs: u64,
    /// Idle time before an adaptive-segment muxer is torn down
    pub muxer_close_after_secs: u64,

    pub record_dir: PathBuf,
    pub log_level: String,

    pub paths: IndexMap<String, PathConf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            relay_address: "0.0.0.0:8554".into(),
            http_address: "0.0.0.0:8888".into(),
            api_address: "127.0.0.1:9997".into(),
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            handshake_timeout_secs: 10,
            shutdown_grace_secs: 10,
            max_connections: 0,
            reader_buffer: crate::stream::DEFAULT_READER_BUFFER,
            overflow_threshold: crate::stream::DEFAULT_OVERFLOW_THRESHOLD,
            segment_duration_secs: 2,
            segment_window: 7,
            segment_wait_secs: 5,
            muxer_close_after_secs: 60,
            record_dir: PathBuf::from("./recordings"),
            log_level: "info".into(),
            paths: IndexMap::new(),
        }
    }
}

impl Conf {
    /// Load and validate a configuration file.
    pub fn load(file: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?;
        let conf: Conf =
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))?;
        conf.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(conf)
    }

    /// Structural validation; returns the first offending key.
    pub fn validate(&self) -> Result<(), String> {
        for (key, addr) in [
            ("relay_address", &self.relay_address),
            ("http_address", &self.http_address),
            ("api_address", &self.api_address),
        ] {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|_| format!("{key}: invalid listen address '{addr}'"))?;
        }
        if self.segment_window == 0 {
            return Err("segment_window: must be at least 1".into());
        }
        if self.segment_duration_secs == 0 {
            return Err("segment_duration_secs: must be at least 1".into());
        }
        if self.reader_buffer == 0 {
            return Err("reader_buffer: must be at least 1".into());
        }
        for (name, path_conf) in &self.paths {
            path_conf.validate(name)?;
        }
        Ok(())
    }

    /// Resolve a concrete name to its configured entry.
    ///
    /// Exact matches outrank templates; among templates the longest
    /// literal prefix wins and declaration order breaks ties. Returns the
    /// configured key, its conf, and wildcard captures.
    pub fn resolve(&self, name: &str) -> Option<(&str, &PathConf, Vec<String>)> {
        if !is_template(name) {
            if let Some((key, conf)) = self.paths.get_key_value(name) {
                return Some((key.as_str(), conf, Vec::new()));
            }
        }

        let mut best: Option<(&str, &PathConf, Vec<String>, usize)> = None;
        for (pattern, conf) in &self.paths {
            if !is_template(pattern) {
                continue;
            }
            if let Some(captures) = template_match(pattern, name) {
                let rank = literal_prefix_len(pattern);
                // Strictly-greater keeps declaration order on ties.
                if best.as_ref().map_or(true, |(_, _, _, r)| rank > *r) {
                    best = Some((pattern.as_str(), conf, captures, rank));
                }
            }
        }
        best.map(|(k, c, caps, _)| (k, c, caps))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    pub fn segment_wait(&self) -> Duration {
        Duration::from_secs(self.segment_wait_secs)
    }

    pub fn muxer_close_after(&self) -> Duration {
        Duration::from_secs(self.muxer_close_after_secs)
    }
}
