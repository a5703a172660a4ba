//! Wire protocol for the mesh relay.
//!
//! Four text message kinds, 7-bit ASCII, `|`-delimited, no escaping:
//!
//! ```text
//! BTC_TX|<sid>|<n>/<total>|<payload>              transaction chunk
//! BTC_CHUNK_ACK|<sid>|<n>|OK|REQUEST_CHUNK|<next> per-chunk ACK
//! BTC_ACK|<sid>|SUCCESS|TXID:<txid>               terminal success
//! BTC_NACK|<sid>|ERROR|<detail>                   terminal failure
//! ```
//!
//! Keywords are uppercase, integers are decimal without leading zeros,
//! payloads are lowercase hex. Only the NACK detail may itself contain `|`;
//! parsers rejoin everything after the third delimiter. Malformed frames
//! collapse into one error kind and are dropped silently by the receiver.

mod codec;

pub use codec::{ChunkAck, ChunkMessage, WireMessage};

/// Mesh text-payload ceiling; inbound frames up to this length are accepted.
pub const MAX_TEXT_LEN: usize = 237;

/// Ceiling for emitted NACK frames; longer details are truncated.
pub const MAX_REPLY_LEN: usize = 200;
