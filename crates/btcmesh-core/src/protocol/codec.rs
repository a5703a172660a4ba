//! Message formatting and parsing.
//!
//! The codec performs no I/O and no session bookkeeping; it turns text frames
//! into [`WireMessage`] values and back, rejecting anything that does not
//! match the framing rules exactly.

use crate::error::{Error, Result};
use crate::session::SessionId;

const CHUNK_KEYWORD: &str = "BTC_TX";
const CHUNK_ACK_KEYWORD: &str = "BTC_CHUNK_ACK";
const ACK_KEYWORD: &str = "BTC_ACK";
const NACK_KEYWORD: &str = "BTC_NACK";

/// One transaction chunk on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    /// Session the chunk belongs to.
    pub session_id: SessionId,
    /// 1-indexed chunk number, `1 <= index <= total`.
    pub index: u32,
    /// Declared total number of chunks for the session.
    pub total: u32,
    /// Lowercase hex fragment, even length, non-empty.
    pub payload: String,
}

/// Receiver-driven per-chunk acknowledgement.
///
/// Carries both the chunk being acknowledged and the chunk the receiver wants
/// next; the sender advances, retransmits, or finishes purely on `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    /// Session being acknowledged.
    pub session_id: SessionId,
    /// Chunk number the receiver just processed.
    pub index: u32,
    /// Chunk number the receiver wants next (`total + 1` once complete).
    pub next: u32,
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// `BTC_TX|<sid>|<n>/<total>|<payload>`
    Chunk(ChunkMessage),
    /// `BTC_CHUNK_ACK|<sid>|<n>|OK|REQUEST_CHUNK|<next>`
    ChunkAck(ChunkAck),
    /// `BTC_ACK|<sid>|SUCCESS|TXID:<txid>`
    TxAck {
        /// Session that completed.
        session_id: SessionId,
        /// Transaction id returned by the broadcasting node.
        txid: String,
    },
    /// `BTC_NACK|<sid>|ERROR|<detail>`
    TxNack {
        /// Session that failed.
        session_id: SessionId,
        /// Human-readable failure detail; may contain `|`.
        detail: String,
    },
}

impl WireMessage {
    /// Parse a text frame.
    ///
    /// Any deviation from the framing rules yields [`Error::Malformed`];
    /// receivers drop such frames without replying.
    pub fn parse(text: &str) -> Result<Self> {
        if !text.is_ascii() {
            return Err(Error::Malformed("non-ascii frame".into()));
        }
        let keyword = text.split('|').next().unwrap_or_default();
        match keyword {
            CHUNK_KEYWORD => parse_chunk(text),
            CHUNK_ACK_KEYWORD => parse_chunk_ack(text),
            ACK_KEYWORD => parse_tx_ack(text),
            NACK_KEYWORD => parse_tx_nack(text),
            other => Err(Error::Malformed(format!("unknown keyword: {other}"))),
        }
    }

    /// Format the message as a text frame.
    pub fn encode(&self) -> String {
        match self {
            WireMessage::Chunk(c) => format!(
                "{CHUNK_KEYWORD}|{}|{}/{}|{}",
                c.session_id, c.index, c.total, c.payload
            ),
            WireMessage::ChunkAck(a) => format!(
                "{CHUNK_ACK_KEYWORD}|{}|{}|OK|REQUEST_CHUNK|{}",
                a.session_id, a.index, a.next
            ),
            WireMessage::TxAck { session_id, txid } => {
                format!("{ACK_KEYWORD}|{session_id}|SUCCESS|TXID:{txid}")
            }
            WireMessage::TxNack { session_id, detail } => {
                format!("{NACK_KEYWORD}|{session_id}|ERROR|{detail}")
            }
        }
    }

    /// Session id carried by the message, whatever its kind.
    pub fn session_id(&self) -> &SessionId {
        match self {
            WireMessage::Chunk(c) => &c.session_id,
            WireMessage::ChunkAck(a) => &a.session_id,
            WireMessage::TxAck { session_id, .. } => session_id,
            WireMessage::TxNack { session_id, .. } => session_id,
        }
    }
}

fn parse_session_id(field: &str) -> Result<SessionId> {
    SessionId::parse(field).map_err(|_| Error::Malformed(format!("bad session id: {field}")))
}

/// Decimal positive integer, no leading zeros, no sign.
fn parse_count(field: &str) -> Result<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) || field.starts_with('0') {
        return Err(Error::Malformed(format!("bad integer: {field}")));
    }
    field
        .parse::<u32>()
        .map_err(|_| Error::Malformed(format!("integer out of range: {field}")))
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn parse_chunk(text: &str) -> Result<WireMessage> {
    let parts: Vec<&str> = text.split('|').collect();
    if parts.len() != 4 {
        return Err(Error::Malformed("chunk needs 4 fields".into()));
    }
    let (sid, position, payload) = (parts[1], parts[2], parts[3]);
    let session_id = parse_session_id(sid)?;
    let (index, total) = position
        .split_once('/')
        .ok_or_else(|| Error::Malformed(format!("bad chunk position: {position}")))?;
    let index = parse_count(index)?;
    let total = parse_count(total)?;
    if index > total {
        return Err(Error::Malformed(format!("chunk {index} of {total}")));
    }
    if !is_lower_hex(payload) || payload.len() % 2 != 0 {
        return Err(Error::Malformed("chunk payload is not even-length hex".into()));
    }
    Ok(WireMessage::Chunk(ChunkMessage {
        session_id,
        index,
        total,
        payload: payload.to_string(),
    }))
}

fn parse_chunk_ack(text: &str) -> Result<WireMessage> {
    let parts: Vec<&str> = text.split('|').collect();
    if parts.len() != 6 {
        return Err(Error::Malformed("chunk ack needs 6 fields".into()));
    }
    if parts[3] != "OK" || parts[4] != "REQUEST_CHUNK" {
        return Err(Error::Malformed("bad chunk ack keywords".into()));
    }
    Ok(WireMessage::ChunkAck(ChunkAck {
        session_id: parse_session_id(parts[1])?,
        index: parse_count(parts[2])?,
        next: parse_count(parts[5])?,
    }))
}

fn parse_tx_ack(text: &str) -> Result<WireMessage> {
    let parts: Vec<&str> = text.split('|').collect();
    if parts.len() != 4 {
        return Err(Error::Malformed("ack needs 4 fields".into()));
    }
    if parts[2] != "SUCCESS" {
        return Err(Error::Malformed("ack without SUCCESS".into()));
    }
    let txid = parts[3]
        .strip_prefix("TXID:")
        .ok_or_else(|| Error::Malformed("ack without TXID field".into()))?;
    if !is_lower_hex(txid) {
        return Err(Error::Malformed("txid is not hex".into()));
    }
    Ok(WireMessage::TxAck {
        session_id: parse_session_id(parts[1])?,
        txid: txid.to_string(),
    })
}

fn parse_tx_nack(text: &str) -> Result<WireMessage> {
    // The detail is free text and may contain the delimiter; rejoin
    // everything after the third one.
    let mut parts = text.splitn(4, '|');
    let _keyword = parts.next();
    let (Some(sid), Some(status), Some(detail)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Malformed("nack needs 4 fields".into()));
    };
    if status != "ERROR" {
        return Err(Error::Malformed("nack without ERROR".into()));
    }
    if detail.is_empty() {
        return Err(Error::Malformed("nack without detail".into()));
    }
    Ok(WireMessage::TxNack {
        session_id: parse_session_id(sid)?,
        detail: detail.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("a1b2c").expect("valid sid")
    }

    #[test]
    fn test_chunk_roundtrip() {
        let msg = WireMessage::Chunk(ChunkMessage {
            session_id: sid(),
            index: 2,
            total: 3,
            payload: "deadbeef".into(),
        });
        let text = msg.encode();
        assert_eq!(text, "BTC_TX|a1b2c|2/3|deadbeef");
        assert_eq!(WireMessage::parse(&text).expect("parse"), msg);
    }

    #[test]
    fn test_chunk_ack_roundtrip() {
        let msg = WireMessage::ChunkAck(ChunkAck {
            session_id: sid(),
            index: 1,
            next: 2,
        });
        let text = msg.encode();
        assert_eq!(text, "BTC_CHUNK_ACK|a1b2c|1|OK|REQUEST_CHUNK|2");
        assert_eq!(WireMessage::parse(&text).expect("parse"), msg);
    }

    #[test]
    fn test_tx_ack_roundtrip() {
        let msg = WireMessage::TxAck {
            session_id: sid(),
            txid: "deadbeef00".into(),
        };
        let text = msg.encode();
        assert_eq!(text, "BTC_ACK|a1b2c|SUCCESS|TXID:deadbeef00");
        assert_eq!(WireMessage::parse(&text).expect("parse"), msg);
    }

    #[test]
    fn test_nack_detail_keeps_delimiters() {
        let text = "BTC_NACK|a1b2c|ERROR|bad-txns|inputs|missing";
        let msg = WireMessage::parse(text).expect("parse");
        match &msg {
            WireMessage::TxNack { detail, .. } => {
                assert_eq!(detail, "bad-txns|inputs|missing")
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        // format∘parse is the identity on emitted frames
        assert_eq!(msg.encode(), text);
    }

    #[test]
    fn test_rejects_leading_zero_integers() {
        assert!(WireMessage::parse("BTC_TX|a1b2c|01/3|aa").is_err());
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/03|aa").is_err());
        assert!(WireMessage::parse("BTC_CHUNK_ACK|a1b2c|0|OK|REQUEST_CHUNK|1").is_err());
    }

    #[test]
    fn test_rejects_index_above_total() {
        assert!(WireMessage::parse("BTC_TX|a1b2c|4/3|aa").is_err());
    }

    #[test]
    fn test_rejects_bad_payload() {
        // odd length
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/1|abc").is_err());
        // uppercase
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/1|AB").is_err());
        // empty
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/1|").is_err());
    }

    #[test]
    fn test_rejects_unknown_keyword_and_garbage() {
        assert!(WireMessage::parse("BTC_WAT|a1b2c|1/1|aa").is_err());
        assert!(WireMessage::parse("hello world").is_err());
        assert!(WireMessage::parse("").is_err());
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/1|aa|extra").is_err());
    }

    #[test]
    fn test_rejects_non_ascii() {
        assert!(WireMessage::parse("BTC_TX|a1b2c|1/1|aa\u{00e9}").is_err());
    }

    #[test]
    fn test_accepts_long_legacy_payloads() {
        // A legacy 200-char-chunk sender still parses; chunk size is not
        // negotiated on the wire.
        let payload = "ab".repeat(100);
        let text = format!("BTC_TX|a1b2c|1/1|{payload}");
        assert!(text.len() <= crate::protocol::MAX_TEXT_LEN);
        assert!(WireMessage::parse(&text).is_ok());
    }
}
