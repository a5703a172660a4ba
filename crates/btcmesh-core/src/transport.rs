//! Mesh transport adapter.
//!
//! The radio itself lives outside this crate. Both engines depend only on
//! [`MeshTransport`] for the outbound direction and on an [`MeshEvent`]
//! channel for the inbound one; the protocol tolerates the mesh reordering,
//! duplicating, or dropping frames within its retry budget.
//!
//! Two implementations ship here: an in-memory hub used by the test suite,
//! and a TCP line-protocol client for the external radio bridge process.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Buffered inbound frames per endpoint before backpressure.
const INBOUND_QUEUE: usize = 64;

/// A mesh node identifier: `!` followed by hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Parse and validate a node id such as `!abcdef12`.
    pub fn parse(raw: &str) -> Result<Self> {
        let digits = raw
            .strip_prefix('!')
            .ok_or_else(|| Error::InvalidNodeId(format!("missing '!' prefix: {raw}")))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidNodeId(format!("not '!' + hex: {raw}")));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound text frame with its sender.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    /// Node that transmitted the frame.
    pub sender: NodeId,
    /// Raw frame text.
    pub text: String,
}

/// Outbound side of the mesh adapter.
///
/// No delivery or ordering guarantee is implied by a successful send; the
/// frame was only handed to the radio layer.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Transmit `text` addressed to `destination`.
    async fn send_text(&self, destination: &NodeId, text: &str) -> Result<()>;

    /// This endpoint's own node id. For logging only.
    fn local_node(&self) -> &NodeId;
}

/// In-memory mesh connecting any number of endpoints; frames addressed to an
/// unjoined node are reported as send failures.
#[derive(Clone, Default)]
pub struct InMemoryMesh {
    nodes: Arc<Mutex<HashMap<NodeId, mpsc::Sender<MeshEvent>>>>,
}

impl InMemoryMesh {
    /// Create an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the mesh as `id`, returning the endpoint handle and its inbound
    /// frame stream.
    pub async fn join(&self, id: NodeId) -> (MeshEndpoint, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.nodes.lock().await.insert(id.clone(), tx);
        (
            MeshEndpoint {
                mesh: self.clone(),
                local: id,
            },
            rx,
        )
    }
}

/// One endpoint of an [`InMemoryMesh`].
pub struct MeshEndpoint {
    mesh: InMemoryMesh,
    local: NodeId,
}

#[async_trait]
impl MeshTransport for MeshEndpoint {
    async fn send_text(&self, destination: &NodeId, text: &str) -> Result<()> {
        let target = {
            let nodes = self.mesh.nodes.lock().await;
            nodes.get(destination).cloned()
        };
        let Some(target) = target else {
            return Err(Error::TransportSend(format!("unknown node {destination}")));
        };
        target
            .send(MeshEvent {
                sender: self.local.clone(),
                text: text.to_string(),
            })
            .await
            .map_err(|_| Error::TransportSend(format!("node {destination} is gone")))
    }

    fn local_node(&self) -> &NodeId {
        &self.local
    }
}

/// Transport speaking the radio bridge's line protocol over TCP.
///
/// Outbound frames are written as `SEND <destination> <text>` lines; the
/// bridge delivers inbound frames as `RECV <sender> <text>` lines, which are
/// forwarded onto the returned channel. Unrecognized lines are logged and
/// skipped.
pub struct BridgeTransport {
    writer: Mutex<OwnedWriteHalf>,
    local: NodeId,
}

impl BridgeTransport {
    /// Connect to the bridge at `addr` (host:port).
    pub async fn connect(
        addr: &str,
        local: NodeId,
    ) -> Result<(Arc<Self>, mpsc::Receiver<MeshEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::TransportSend(format!("bridge {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_bridge_line(&line) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        } else {
                            debug!(line, "ignoring unrecognized bridge line");
                        }
                    }
                    Ok(None) => {
                        warn!("mesh bridge closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "mesh bridge read failed");
                        break;
                    }
                }
            }
        });

        Ok((
            Arc::new(Self {
                writer: Mutex::new(write_half),
                local,
            }),
            rx,
        ))
    }
}

fn parse_bridge_line(line: &str) -> Option<MeshEvent> {
    let rest = line.strip_prefix("RECV ")?;
    let (sender, text) = rest.split_once(' ')?;
    let sender = NodeId::parse(sender).ok()?;
    if text.is_empty() {
        return None;
    }
    Some(MeshEvent {
        sender,
        text: text.to_string(),
    })
}

#[async_trait]
impl MeshTransport for BridgeTransport {
    async fn send_text(&self, destination: &NodeId, text: &str) -> Result<()> {
        let line = format!("SEND {destination} {text}\n");
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::TransportSend(e.to_string()))
    }

    fn local_node(&self) -> &NodeId {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::parse("!abcdef12").is_ok());
        assert!(NodeId::parse("!1").is_ok());
        assert!(NodeId::parse("abcdef12").is_err());
        assert!(NodeId::parse("!").is_err());
        assert!(NodeId::parse("!xyz").is_err());
    }

    #[test]
    fn test_node_id_lowercases() {
        let id = NodeId::parse("!ABCDEF12").expect("node id");
        assert_eq!(id.as_str(), "!abcdef12");
    }

    #[test]
    fn test_parse_bridge_line() {
        let event = parse_bridge_line("RECV !aa11 BTC_TX|a1b2c|1/1|aa").expect("event");
        assert_eq!(event.sender.as_str(), "!aa11");
        assert_eq!(event.text, "BTC_TX|a1b2c|1/1|aa");

        assert!(parse_bridge_line("SEND !aa11 x").is_none());
        assert!(parse_bridge_line("RECV !aa11").is_none());
        assert!(parse_bridge_line("RECV notanode x").is_none());
    }

    #[tokio::test]
    async fn test_in_memory_mesh_delivery() {
        let mesh = InMemoryMesh::new();
        let alice = NodeId::parse("!a1").expect("id");
        let bob = NodeId::parse("!b2").expect("id");
        let (alice_ep, _alice_rx) = mesh.join(alice.clone()).await;
        let (_bob_ep, mut bob_rx) = mesh.join(bob.clone()).await;

        alice_ep.send_text(&bob, "hello").await.expect("send");
        let event = bob_rx.recv().await.expect("event");
        assert_eq!(event.sender, alice);
        assert_eq!(event.text, "hello");
    }

    #[tokio::test]
    async fn test_in_memory_mesh_unknown_destination() {
        let mesh = InMemoryMesh::new();
        let alice = NodeId::parse("!a1").expect("id");
        let nobody = NodeId::parse("!dead").expect("id");
        let (alice_ep, _rx) = mesh.join(alice).await;

        assert!(alice_ep.send_text(&nobody, "hello").await.is_err());
    }
}
