//! Server session engine.
//!
//! Consumes inbound mesh frames, buffers chunks per session, answers each
//! chunk with an ACK naming the next chunk it wants, and on completion hands
//! the reassembled transaction to the RPC adapter. Every terminal frame a
//! session can ever produce is emitted from exactly one place
//! ([`RelayEngine::finish_session`]), so one-terminal-per-session holds by
//! construction.

use crate::config::DEFAULT_REASSEMBLY_TIMEOUT_SECS;
use crate::error::Error;
use crate::history::{BroadcastHistory, HistoryEntry};
use crate::logging::{FramePreview, RedactedHex};
use crate::protocol::{ChunkAck, ChunkMessage, WireMessage, MAX_REPLY_LEN};
use crate::reassembly::{ReassemblyTable, SessionStatus};
use crate::rpc::BroadcastRpc;
use crate::session::SessionId;
use crate::transport::{MeshEvent, MeshTransport, NodeId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Tuning for the relay engine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Idle time after which a Collecting session is evicted.
    pub reassembly_timeout: Duration,
    /// Janitor sweep period.
    pub janitor_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: Duration::from_secs(DEFAULT_REASSEMBLY_TIMEOUT_SECS),
            janitor_interval: Duration::from_secs(1),
        }
    }
}

/// The relay's server-side engine.
pub struct RelayEngine<T, R> {
    transport: Arc<T>,
    rpc: Arc<R>,
    table: Arc<Mutex<ReassemblyTable>>,
    history: Option<Arc<BroadcastHistory>>,
    config: RelayConfig,
}

impl<T, R> Clone for RelayEngine<T, R> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            rpc: Arc::clone(&self.rpc),
            table: Arc::clone(&self.table),
            history: self.history.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T, R> RelayEngine<T, R>
where
    T: MeshTransport + 'static,
    R: BroadcastRpc + 'static,
{
    /// Engine over `transport` broadcasting through `rpc`.
    pub fn new(transport: Arc<T>, rpc: Arc<R>, config: RelayConfig) -> Self {
        Self {
            transport,
            rpc,
            table: Arc::new(Mutex::new(ReassemblyTable::new(config.reassembly_timeout))),
            history: None,
            config,
        }
    }

    /// Record every terminal outcome to `history`.
    pub fn with_history(mut self, history: Arc<BroadcastHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Number of sessions currently collecting or broadcasting.
    pub async fn active_sessions(&self) -> usize {
        self.table.lock().await.active_count()
    }

    /// Consume the inbound frame stream until it closes, sweeping stale
    /// sessions once per janitor interval.
    pub async fn run(self, mut inbound: mpsc::Receiver<MeshEvent>) {
        info!(
            node = %self.transport.local_node(),
            timeout_secs = self.config.reassembly_timeout.as_secs(),
            "relay engine started"
        );
        let mut janitor = tokio::time::interval(self.config.janitor_interval);
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.on_message(&event.sender, &event.text).await,
                    None => {
                        info!("inbound frame stream closed; relay engine stopping");
                        break;
                    }
                },
                _ = janitor.tick() => self.sweep().await,
            }
        }
    }

    /// Handle one inbound text frame.
    pub async fn on_message(&self, sender: &NodeId, text: &str) {
        let chunk = match WireMessage::parse(text) {
            Ok(WireMessage::Chunk(chunk)) => chunk,
            Ok(other) => {
                // ACK/NACK kinds are outputs of this engine, not inputs.
                debug!(sender = %sender, session = %other.session_id(), "ignoring non-chunk frame");
                return;
            }
            Err(e) if e.should_silent_drop() => {
                debug!(sender = %sender, frame = %FramePreview(text), "dropping malformed frame");
                return;
            }
            Err(e) => {
                debug!(sender = %sender, error = %e, "dropping unusable frame");
                return;
            }
        };

        if let Some(reply) = self.ingest_chunk(sender, &chunk).await {
            self.send_reply(sender, &chunk.session_id, &reply).await;
        }
    }

    /// Run the chunk through the session table; returns the frame to send
    /// back, if any. Completion spawns the broadcast task as a side effect.
    async fn ingest_chunk(&self, sender: &NodeId, chunk: &ChunkMessage) -> Option<String> {
        let sid = &chunk.session_id;
        let mut table = self.table.lock().await;

        // A finished session answers every late duplicate with the same
        // terminal frame instead of opening a ghost session.
        if let Some(frame) = table.replay_frame(sid, sender) {
            debug!(session = %sid, "replaying terminal frame for completed session");
            return Some(frame);
        }

        if table.get_mut(sid).is_none() {
            info!(
                session = %sid,
                sender = %sender,
                total = chunk.total,
                "new reassembly session"
            );
            table.create(sid.clone(), sender.clone(), chunk.total);
        }
        let session = table.get_mut(sid)?;

        if session.sender() != sender {
            // Someone else is using this id; say nothing about the session.
            debug!(session = %sid, sender = %sender, "sender does not match pinned sender");
            return None;
        }

        if session.status() != SessionStatus::Collecting {
            debug!(session = %sid, "chunk for a session already broadcasting");
            return None;
        }

        if session.total_chunks() != chunk.total {
            warn!(
                session = %sid,
                expected = session.total_chunks(),
                got = chunk.total,
                "total_chunks mismatch; discarding session"
            );
            drop(table);
            return Some(
                self.finish_with_failure(sid, sender, "inconsistent total_chunks")
                    .await,
            );
        }

        if let Err(e) = session.insert(chunk.index, &chunk.payload) {
            let detail = match e {
                Error::InconsistentSession(detail) => detail,
                other => other.to_string(),
            };
            warn!(session = %sid, detail = %detail, "rejecting chunk; discarding session");
            drop(table);
            return Some(self.finish_with_failure(sid, sender, &detail).await);
        }

        let next = session.next_missing();
        debug!(
            session = %sid,
            chunk = chunk.index,
            stored = session.stored_count(),
            next,
            "chunk accepted"
        );
        let ack = WireMessage::ChunkAck(ChunkAck {
            session_id: sid.clone(),
            index: chunk.index,
            next,
        })
        .encode();

        if session.is_complete() {
            session.begin_broadcast();
            let tx_hex = session.assemble();
            info!(
                session = %sid,
                sender = %sender,
                tx = %RedactedHex(&tx_hex),
                "reassembly complete; broadcasting"
            );
            let engine = self.clone();
            let sid = sid.clone();
            let sender = sender.clone();
            // The RPC call can block for seconds; other sessions keep moving.
            tokio::spawn(async move {
                engine.broadcast_and_finish(&sid, &sender, &tx_hex).await;
            });
        }

        Some(ack)
    }

    /// Broadcast the reassembled transaction and emit the session's terminal.
    async fn broadcast_and_finish(&self, sid: &SessionId, sender: &NodeId, tx_hex: &str) {
        match self.rpc.broadcast(tx_hex).await {
            Ok(txid) => {
                info!(session = %sid, txid = %txid, "transaction broadcast");
                let frame = WireMessage::TxAck {
                    session_id: sid.clone(),
                    txid: txid.clone(),
                }
                .encode();
                self.finish_session(sid, sender, frame, HistoryEntry::success(
                    sid.as_str(),
                    sender.as_str(),
                    &txid,
                ))
                .await;
            }
            Err(e) => {
                warn!(session = %sid, detail = %e.detail(), "broadcast rejected");
                let frame = nack_frame(sid, e.detail());
                self.finish_session(sid, sender, frame, HistoryEntry::failure(
                    sid.as_str(),
                    sender.as_str(),
                    e.detail(),
                ))
                .await;
            }
        }
    }

    /// Discard a session with a failure NACK, remembering the frame for
    /// replay. Returns the frame for the caller to send.
    async fn finish_with_failure(&self, sid: &SessionId, sender: &NodeId, detail: &str) -> String {
        let frame = nack_frame(sid, detail);
        let mut table = self.table.lock().await;
        table.retire(sid, sender.clone(), frame.clone());
        frame
    }

    /// Retire a session with its terminal frame, record history, and send
    /// the frame to the pinned sender.
    async fn finish_session(
        &self,
        sid: &SessionId,
        sender: &NodeId,
        frame: String,
        entry: HistoryEntry,
    ) {
        {
            let mut table = self.table.lock().await;
            table.retire(sid, sender.clone(), frame.clone());
        }
        if let Some(history) = &self.history {
            if let Err(e) = history.record(entry).await {
                error!(session = %sid, error = %e, "failed to record history entry");
            }
        }
        self.send_reply(sender, sid, &frame).await;
    }

    /// Best-effort transmit; the client's timers cover a lost reply.
    async fn send_reply(&self, destination: &NodeId, sid: &SessionId, frame: &str) {
        if let Err(e) = self.transport.send_text(destination, frame).await {
            warn!(
                session = %sid,
                destination = %destination,
                error = %e,
                "failed to send reply frame"
            );
        }
    }

    /// Evict Collecting sessions idle beyond the reassembly timeout and NACK
    /// their pinned senders.
    pub async fn sweep(&self) {
        let evicted = {
            let mut table = self.table.lock().await;
            let stale = table.evict_stale(Instant::now());
            let mut evicted = Vec::with_capacity(stale.len());
            for session in stale {
                let frame = nack_frame(&session.session_id, "reassembly timeout");
                // Remember the NACK so a sender that went quiet and comes
                // back gets the verdict, not a ghost session.
                table.retire(&session.session_id, session.sender.clone(), frame.clone());
                evicted.push((session, frame));
            }
            evicted
        };
        for (session, frame) in evicted {
            warn!(
                session = %session.session_id,
                sender = %session.sender,
                stored = session.stored,
                total = session.total,
                "reassembly timed out; evicting"
            );
            self.send_reply(&session.sender, &session.session_id, &frame).await;
        }
    }
}

/// Build a NACK frame: 7-bit ASCII only, truncated to the reply ceiling.
///
/// RPC details come from outside; anything the wire format cannot carry
/// becomes `?` so the sender can always parse the verdict.
fn nack_frame(sid: &SessionId, detail: &str) -> String {
    let mut detail: String = detail
        .chars()
        .map(|c| if c.is_ascii() && c != '\n' && c != '\r' { c } else { '?' })
        .collect();
    let prefix = format!("BTC_NACK|{sid}|ERROR|");
    if prefix.len() + detail.len() > MAX_REPLY_LEN {
        detail.truncate(MAX_REPLY_LEN.saturating_sub(prefix.len() + 3));
        detail.push_str("...");
    }
    format!("{prefix}{detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_frame_passthrough() {
        let sid = SessionId::parse("a1b2c").expect("sid");
        let frame = nack_frame(&sid, "reassembly timeout");
        assert_eq!(frame, "BTC_NACK|a1b2c|ERROR|reassembly timeout");
    }

    #[test]
    fn test_nack_frame_truncates_long_detail() {
        let sid = SessionId::parse("a1b2c").expect("sid");
        let detail = "x".repeat(400);
        let frame = nack_frame(&sid, &detail);
        assert!(frame.len() <= MAX_REPLY_LEN);
        assert!(frame.ends_with("..."));
        assert!(frame.starts_with("BTC_NACK|a1b2c|ERROR|x"));
    }

    #[test]
    fn test_nack_frame_stays_parseable_ascii() {
        let sid = SessionId::parse("a1b2c").expect("sid");
        let frame = nack_frame(&sid, "fehler: ungültig\n");
        assert!(frame.is_ascii());
        match WireMessage::parse(&frame).expect("parseable") {
            WireMessage::TxNack { detail, .. } => assert_eq!(detail, "fehler: ung?ltig?"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
