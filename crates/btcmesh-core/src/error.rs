//! Error types for the mesh relay core.
//!
//! Wire-level failures are collapsed into a single kind and never echoed back
//! to the peer; only terminal results cross the mesh.

use thiserror::Error;

/// Core error type for relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A received text frame did not parse as any protocol message.
    /// Logged and dropped; never answered.
    #[error("malformed message")]
    Malformed(String),

    /// The submitted transaction hex was empty.
    #[error("empty transaction")]
    EmptyTransaction,

    /// The submitted transaction was not valid hex of even length.
    #[error("invalid transaction hex")]
    InvalidHex(String),

    /// A chunk contradicted the session it belongs to
    /// (total mismatch, conflicting duplicate, out-of-range number).
    #[error("inconsistent session")]
    InconsistentSession(String),

    /// A node identifier was not `!` followed by hex digits.
    #[error("invalid node id")]
    InvalidNodeId(String),

    /// The mesh transport could not hand a frame to the radio.
    #[error("transport send failed")]
    TransportSend(String),

    /// Bitcoin Core RPC failure; the detail travels verbatim in NACKs.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should be dropped silently instead of answered.
    /// Malformed frames are never NACKed; a crafted flood of garbage must not
    /// be amplified into a flood of replies.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Malformed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_classification() {
        assert!(Error::Malformed("junk".into()).should_silent_drop());
        assert!(!Error::InconsistentSession("total".into()).should_silent_drop());
        assert!(!Error::Rpc("conflict".into()).should_silent_drop());
    }

    #[test]
    fn test_display_is_stable() {
        assert_eq!(Error::EmptyTransaction.to_string(), "empty transaction");
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
    }
}
