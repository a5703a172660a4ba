//! # BTC Mesh Relay Core
//!
//! Relays raw Bitcoin transactions across a low-bandwidth LoRa mesh. A
//! sender splits a transaction hex string into short text chunks addressed
//! to a relay node; the relay reassembles them, submits the transaction to a
//! Bitcoin Core RPC endpoint, and answers with a definitive terminal frame
//! (success with the txid, or failure with a diagnostic).
//!
//! The mesh offers ~200-character text frames with unordered, lossy, slow
//! delivery, so everything here is built around a receiver-driven
//! stop-and-wait protocol: each chunk is acknowledged with the chunk number
//! the relay wants next, and the sender never has more than one chunk in
//! flight.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┬────────────────────┐
//! │   sender (client)  │   relay (server)   │
//! ├────────────────────┼────────────────────┤
//! │ chunk · session    │ reassembly · relay │
//! ├────────────────────┴────────────────────┤
//! │           protocol (wire codec)         │
//! ├─────────────────────────────────────────┤
//! │    transport adapter │  rpc adapter     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The mesh radio and Bitcoin Core are external collaborators behind the
//! [`transport::MeshTransport`] and [`rpc::BroadcastRpc`] traits.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod chunk;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod protocol;
pub mod reassembly;
pub mod relay;
pub mod rpc;
pub mod sender;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
