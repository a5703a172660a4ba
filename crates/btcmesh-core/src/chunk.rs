//! Transaction splitting.

use crate::error::{Error, Result};

/// Default payload characters per chunk.
///
/// Chunk size is a sender-side parameter and never appears on the wire; the
/// receiver accepts any payload length the mesh can carry.
pub const DEFAULT_CHUNK_SIZE: usize = 170;

/// Validate a raw transaction hex string and return it lowercased.
pub fn normalize_tx_hex(tx_hex: &str) -> Result<String> {
    if tx_hex.is_empty() {
        return Err(Error::EmptyTransaction);
    }
    if tx_hex.len() % 2 != 0 {
        return Err(Error::InvalidHex("odd number of characters".into()));
    }
    if !tx_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidHex("non-hex characters".into()));
    }
    Ok(tx_hex.to_ascii_lowercase())
}

/// Split a transaction hex string into wire-sized fragments.
///
/// Fragments are produced left to right, each `chunk_size` characters except
/// a possibly shorter final one; concatenating them in order reproduces the
/// (lowercased) input exactly.
pub fn split_transaction(tx_hex: &str, chunk_size: usize) -> Result<Vec<String>> {
    if chunk_size == 0 {
        return Err(Error::Config("chunk size must be positive".into()));
    }
    let hex = normalize_tx_hex(tx_hex)?;
    let fragments = hex
        .as_bytes()
        .chunks(chunk_size)
        .map(|piece| String::from_utf8_lossy(piece).into_owned())
        .collect();
    Ok(fragments)
}
