//! Attach authorization
//!
//! Checked inside the Path actor on every attach: allowed IP ranges,
//! required credentials (literal or `sha256:` digest), and an optional
//! externally delegated hook. All failures collapse into the same
//! `Authentication` error so callers cannot probe which check failed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::conf::{IpRange, PathConf};
use crate::error::{RelayError, Result};

use super::messages::{Credentials, Role};

/// Externally delegated authorization, consulted after the built-in
/// checks pass. Wired in at manager construction.
#[async_trait::async_trait]
pub trait AuthHook: Send + Sync {
    async fn authorize(&self, path: &str, role: Role, creds: &Credentials) -> bool;
}

/// Run the configured checks for one attach.
pub async fn authorize(
    path: &str,
    conf: &PathConf,
    role: Role,
    creds: &Credentials,
    hook: Option<&std::sync::Arc<dyn AuthHook>>,
) -> Result<()> {
    let (user, pass, ips) = match role {
        Role::Publish => (&conf.publish_user, &conf.publish_pass, &conf.publish_ips),
        Role::Read => (&conf.read_user, &conf.read_pass, &conf.read_ips),
    };

    if !ips.is_empty() {
        // Ranges were validated at config load; a parse failure here can
        // only follow a config API write that bypassed validation.
        let allowed = ips
            .iter()
            .filter_map(|r| IpRange::parse(r).ok())
            .any(|r| r.contains(creds.ip));
        if !allowed {
            return Err(RelayError::Authentication);
        }
    }

    if let Some(required) = user {
        if !credential_matches(required, creds.user.as_deref()) {
            return Err(RelayError::Authentication);
        }
    }
    if let Some(required) = pass {
        if !credential_matches(required, creds.pass.as_deref()) {
            return Err(RelayError::Authentication);
        }
    }

    if let Some(hook) = hook {
        if !hook.authorize(path, role, creds).await {
            return Err(RelayError::Authentication);
        }
    }

    Ok(())
}

/// Compare a provided credential against a required one, which is either
/// a literal or a `sha256:<base64>` digest.
fn credential_matches(required: &str, provided: Option<&str>) -> bool {
    let Some(provided) = provided else {
        return false;
    };
    match required.strip_prefix("sha256:") {
        Some(digest) => BASE64.encode(Sha256::digest(provided.as_bytes())) == digest,
        None => required == provided,
    }
}
