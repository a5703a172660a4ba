//! Session identifiers and the client-side transaction session.

use crate::chunk;
use crate::error::{Error, Result};
use crate::transport::NodeId;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::time::Instant;

/// Number of hex characters in a generated session id.
pub const SESSION_ID_LEN: usize = 5;

/// Short opaque token binding all chunks and ACKs of one transaction send.
///
/// Generated ids are 5 lowercase hex characters from the OS random source.
/// Uniqueness is probabilistic; the receiver detects collisions within its
/// active window through the total-chunks consistency rule and sender pinning
/// rather than at generation time. Parsed ids are treated as opaque and may
/// be longer (legacy senders), as long as they are printable ASCII without
/// the frame delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 4];
        OsRng.fill_bytes(&mut bytes);
        let value = u32::from_be_bytes(bytes) & 0xf_ffff;
        Self(format!("{value:05x}"))
    }

    /// Accept an id observed on the wire.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_graphic() && b != b'|') {
            return Err(Error::Malformed(format!("bad session id: {raw}")));
        }
        Ok(Self(raw.to_string()))
    }

    /// The id as a wire-format string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One transaction send, fixed at construction.
///
/// Owns the ordered fragment sequence; the send engine consumes it and the
/// session ends on a terminal ACK/NACK, timeout, or cancellation.
#[derive(Debug)]
pub struct TxSession {
    id: SessionId,
    fragments: Vec<String>,
    destination: NodeId,
    created_at: Instant,
}

impl TxSession {
    /// Validate and chunk a transaction for `destination`.
    pub fn new(tx_hex: &str, destination: NodeId, chunk_size: usize) -> Result<Self> {
        let fragments = chunk::split_transaction(tx_hex, chunk_size)?;
        Ok(Self {
            id: SessionId::generate(),
            fragments,
            destination,
            created_at: Instant::now(),
        })
    }

    /// Session id shared by every frame of this send.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Destination node for every frame of this send.
    pub fn destination(&self) -> &NodeId {
        &self.destination
    }

    /// Number of chunks the transaction was split into.
    pub fn total_chunks(&self) -> u32 {
        self.fragments.len() as u32
    }

    /// Fragment for 1-indexed chunk `index`, if in range.
    pub fn fragment(&self, index: u32) -> Option<&str> {
        self.fragments.get(index.checked_sub(1)? as usize).map(String::as_str)
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        for _ in 0..32 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
            assert_eq!(id.as_str(), id.as_str().to_ascii_lowercase());
        }
    }

    #[test]
    fn test_parse_rejects_delimiter_and_empty() {
        assert!(SessionId::parse("a1b2c").is_ok());
        assert!(SessionId::parse("legacy-sender-id").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("ab|cd").is_err());
        assert!(SessionId::parse("ab cd").is_err());
    }

    #[test]
    fn test_session_fragments() {
        let dest = NodeId::parse("!abcdef12").expect("node id");
        let hex = "ab".repeat(100);
        let session = TxSession::new(&hex, dest, 170).expect("session");
        assert_eq!(session.total_chunks(), 2);
        assert_eq!(session.fragment(1).expect("first").len(), 170);
        assert_eq!(session.fragment(2).expect("second").len(), 30);
        assert!(session.fragment(0).is_none());
        assert!(session.fragment(3).is_none());
    }
}
