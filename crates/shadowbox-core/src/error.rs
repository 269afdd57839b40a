//! The error taxonomy shared by every fallible ShadowBox operation.

use thiserror::Error;

/// Errors surfaced by the core. Every kind is distinguishable so frontends
/// and the wire `ERROR` frame can map them without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// A box, file, version or rendezvous code does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Bad password or bad rendezvous code. Deliberately carries no detail:
    /// the remote side must not let callers distinguish "no such box" from
    /// "wrong code".
    #[error("authentication failed")]
    AuthFailure,
    /// The operation needs an unlocked box.
    #[error("box {0} is locked")]
    Locked(String),
    /// Hash mismatch or AEAD tag failure on a read path.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    /// Disk-level failure (blob store or metadata index).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame or frame received in the wrong protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A bounded operation ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The caller's cancellation signal fired.
    #[error("cancelled")]
    Cancelled,
    /// Duplicate name where one is not allowed.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Payload above the configured `max_file_size`.
    #[error("quota exceeded: {size} bytes > {max} bytes")]
    QuotaExceeded {
        /// Size of the rejected payload.
        size: u64,
        /// Configured ceiling.
        max: u64,
    },
}

impl Error {
    /// Stable machine-readable kind, used verbatim as the `code` of the
    /// wire `ERROR` frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AuthFailure => "auth_failure",
            Self::Locked(_) => "locked",
            Self::IntegrityFailure(_) => "integrity_failure",
            Self::Io(_) => "io_error",
            Self::Protocol(_) => "protocol_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Conflict(_) => "conflict",
            Self::QuotaExceeded { .. } => "quota_exceeded",
        }
    }

    /// Rebuild an error from a wire `ERROR` frame.
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "auth_failure" => Self::AuthFailure,
            "not_found" => Self::NotFound(message.to_string()),
            "locked" => Self::Locked(message.to_string()),
            "integrity_failure" => Self::IntegrityFailure(message.to_string()),
            "timeout" => Self::Timeout(message.to_string()),
            "cancelled" => Self::Cancelled,
            "conflict" => Self::Conflict(message.to_string()),
            "quota_exceeded" => Self::QuotaExceeded { size: 0, max: 0 },
            "io_error" => Self::Io(std::io::Error::other(message.to_string())),
            _ => Self::Protocol(format!("{code}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errs = [
            Error::NotFound("x".into()),
            Error::AuthFailure,
            Error::Locked("b".into()),
            Error::IntegrityFailure("x".into()),
            Error::Io(std::io::Error::other("x")),
            Error::Protocol("x".into()),
            Error::Timeout("x".into()),
            Error::Cancelled,
            Error::Conflict("x".into()),
            Error::QuotaExceeded { size: 2, max: 1 },
        ];
        let mut kinds: Vec<_> = errs.iter().map(Error::kind).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errs.len());
    }

    #[test]
    fn wire_roundtrip_preserves_kind() {
        let e = Error::AuthFailure;
        let back = Error::from_wire(e.kind(), &e.to_string());
        assert_eq!(back.kind(), "auth_failure");
    }
}
