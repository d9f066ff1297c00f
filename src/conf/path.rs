//! Per-path configuration and name-template matching

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

fn default_on_demand_start_timeout() -> u64 {
    10
}

fn default_on_demand_close_after() -> u64 {
    10
}

/// Configuration of one path entry (exact name or template).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathConf {
    /// Required publisher credentials; `sha256:<base64>` digests accepted
    pub publish_user: Option<String>,
    pub publish_pass: Option<String>,
    /// Required reader credentials
    pub read_user: Option<String>,
    pub read_pass: Option<String>,
    /// CIDR allow-list for publishers (empty = allow all)
    pub publish_ips: Vec<String>,
    /// CIDR allow-list for readers (empty = allow all)
    pub read_ips: Vec<String>,
    /// Command started with the server; its process is expected to
    /// connect and publish this path
    pub run_on_init: Option<String>,
    /// Command started when the first reader attaches (on-demand source)
    pub on_demand: Option<String>,
    #[serde(default = "default_on_demand_start_timeout")]
    pub on_demand_start_timeout_secs: u64,
    #[serde(default = "default_on_demand_close_after")]
    pub on_demand_close_after_secs: u64,
    /// Write finished segments under the record directory while publishing
    pub record: bool,
    /// Allow a second publisher to take over the slot
    pub allow_swap: bool,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            publish_user: None,
            publish_pass: None,
            read_user: None,
            read_pass: None,
            publish_ips: Vec::new(),
            read_ips: Vec::new(),
            run_on_init: None,
            on_demand: None,
            on_demand_start_timeout_secs: default_on_demand_start_timeout(),
            on_demand_close_after_secs: default_on_demand_close_after(),
            record: false,
            allow_swap: false,
        }
    }
}

impl PathConf {
    /// Whether switching from `self` to `next` can be hot-applied.
    /// Source-defining fields force a stop-and-restart.
    pub fn hot_applicable(&self, next: &PathConf) -> bool {
        self.run_on_init == next.run_on_init
            && self.on_demand == next.on_demand
            && self.on_demand_start_timeout_secs == next.on_demand_start_timeout_secs
            && self.on_demand_close_after_secs == next.on_demand_close_after_secs
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_path_entry(name)?;
        for ip in self.publish_ips.iter().chain(&self.read_ips) {
            IpRange::parse(ip).map_err(|e| format!("path '{name}': {e}"))?;
        }
        for cred in [
            &self.publish_user,
            &self.publish_pass,
            &self.read_user,
            &self.read_pass,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(digest) = cred.strip_prefix("sha256:") {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(digest)
                    .map_err(|_| format!("path '{name}': invalid sha256 credential"))?;
            }
        }
        if self.run_on_init.is_some() && is_template(name) {
            return Err(format!("path '{name}': run_on_init needs an exact name"));
        }
        Ok(())
    }
}

/// Whether a configured entry is a template rather than an exact name.
pub fn is_template(name: &str) -> bool {
    name.split('/').any(|seg| seg == "*" || seg == "**")
}

/// Validate a configured entry name (may contain wildcards).
pub fn validate_path_entry(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty path name".into());
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(format!("path '{name}': leading/trailing slash"));
    }
    let segments: Vec<&str> = name.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return Err(format!("path '{name}': empty segment"));
        }
        if *seg == "." || *seg == ".." {
            return Err(format!("path '{name}': dot segment"));
        }
        if *seg == "**" && i != segments.len() - 1 {
            return Err(format!("path '{name}': '**' must be the last segment"));
        }
        if seg.contains('*') && *seg != "*" && *seg != "**" {
            return Err(format!(
                "path '{name}': '*' must stand alone in a segment"
            ));
        }
    }
    Ok(())
}

/// Validate a concrete (request-time) path name: wildcards rejected.
pub fn validate_path_name(name: &str) -> Result<(), String> {
    validate_path_entry(name)?;
    if is_template(name) {
        return Err(format!("path '{name}': wildcards not allowed"));
    }
    Ok(())
}

/// Match a concrete name against a template, returning wildcard captures.
///
/// `*` matches exactly one segment; a trailing `**` matches the rest
/// (at least one segment).
pub fn template_match(pattern: &str, name: &str) -> Option<Vec<String>> {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = name.split('/').collect();
    let mut captures = Vec::new();

    for (i, p) in pat.iter().enumerate() {
        match *p {
            "**" => {
                if i >= segs.len() {
                    return None;
                }
                captures.push(segs[i..].join("/"));
                return Some(captures);
            }
            "*" => {
                let seg = segs.get(i)?;
                captures.push((*seg).to_string());
            }
            lit => {
                if segs.get(i) != Some(&lit) {
                    return None;
                }
            }
        }
    }

    (pat.len() == segs.len()).then_some(captures)
}

/// Number of leading literal segments, used to rank template matches.
pub fn literal_prefix_len(pattern: &str) -> usize {
    pattern
        .split('/')
        .take_while(|seg| *seg != "*" && *seg != "**")
        .count()
}

/// An IPv4/IPv6 CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    addr: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Parse `a.b.c.d/n`, `addr6/n`, or a bare address (host range).
    pub fn parse(s: &str) -> Result<Self, String> {
        let (addr_s, prefix_s) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_s
            .parse()
            .map_err(|_| format!("invalid IP range '{s}'"))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_s {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid IP range '{s}'"))?,
            None => max,
        };
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let shift = 32 - u32::from(self.prefix);
                let mask = if shift >= 32 { 0 } else { u32::MAX << shift };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let shift = 128 - u32::from(self.prefix);
                let mask = if shift >= 128 { 0 } else { u128::MAX << shift };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}
