//! Error taxonomy shared by the relay fabric
//!
//! Every actor and front-end maps its failures onto this enum; protocol
//! layers translate variants into their own status codes.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error type for relay operations.
///
/// `Authentication` carries no detail on purpose: callers must not be able
/// to distinguish a bad credential from a denied IP range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Attach denied by the path's authorization policy
    #[error("authentication failed")]
    Authentication,

    /// Name did not match any configured path
    #[error("path not found")]
    PathNotFound,

    /// Second publisher attempt on a path that rejects swaps
    #[error("path already has a publisher")]
    PathBusy,

    /// Reader evicted after exceeding its drop threshold
    #[error("reader queue overflow")]
    ReaderOverflow,

    /// Operation cancelled by shutdown or parent teardown
    #[error("terminated")]
    Terminated,

    /// On-demand startup or segment wait exceeded its deadline
    #[error("timed out")]
    Timeout,

    /// Requested segment was evicted or the segmenter is closed
    #[error("segment not found")]
    SegmentNotFound,

    /// Malformed message at the protocol layer; scoped to one connection
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Whether the error ends the surrounding actor (fatal) or is logged
    /// and absorbed (recoverable).
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_message_is_uniform() {
        // The display must not leak which check failed.
        assert_eq!(RelayError::Authentication.to_string(), "authentication failed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RelayError::Terminated.is_fatal());
        assert!(!RelayError::Timeout.is_fatal());
        assert!(!RelayError::Protocol("bad frame".into()).is_fatal());
    }
}
