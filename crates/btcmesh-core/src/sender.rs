//! Client session engine.
//!
//! One send session pushes one chunk at a time and never advances until the
//! relay explicitly requests the next chunk number (receiver-driven
//! stop-and-wait). The decision logic lives in [`SendMachine`], a pure state
//! machine driven by events, so retransmit and timeout policy is testable
//! without a transport; [`TxSender`] wires it to the mesh.

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::logging::FramePreview;
use crate::protocol::{ChunkAck, ChunkMessage, WireMessage};
use crate::session::TxSession;
use crate::transport::{MeshEvent, MeshTransport, NodeId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tuning for one send session.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Payload characters per chunk.
    pub chunk_size: usize,
    /// How long to wait for each per-chunk ACK.
    pub ack_timeout: Duration,
    /// Retransmissions of one chunk before giving up.
    pub max_retries: u32,
    /// How long to wait for the terminal ACK/NACK after the last chunk.
    /// Must be at least the relay's reassembly timeout so the client
    /// outlasts the relay's broadcast deadline.
    pub terminal_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: Duration::from_secs(30),
            max_retries: 3,
            terminal_timeout: Duration::from_secs(300),
        }
    }
}

/// Terminal failure of a send session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The transaction or destination failed local validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The relay stopped answering after the last chunk was accepted.
    #[error("timed out waiting for the relay's terminal reply")]
    Timeout,

    /// A chunk went unacknowledged through every retransmission.
    #[error("retries exhausted without acknowledgement")]
    RetryExhausted,

    /// The send was cancelled.
    #[error("send aborted")]
    Aborted,

    /// The relay answered with a terminal NACK; detail is verbatim.
    #[error("relay rejected transaction: {0}")]
    PeerNack(String),

    /// The local transport could not transmit at all.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Result of one send session: the txid, or why it failed.
pub type SendResult = std::result::Result<String, SendError>;

/// What the driver must do after feeding an event to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    /// Transmit the 1-indexed chunk and re-arm the ACK timer.
    Transmit(u32),
    /// Stop transmitting and arm the terminal timer.
    AwaitTerminal,
    /// Event was irrelevant; keep waiting.
    Ignore,
    /// Session finished successfully.
    Succeed(String),
    /// Session finished with a failure.
    Fail(SendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Sending { current: u32, retries: u32 },
    AwaitingTerminal,
    Done,
}

/// Pure state machine for one send session.
///
/// Transitions mirror the relay's view: the requested `next` chunk number in
/// each per-chunk ACK decides whether the sender advances, retransmits, or
/// starts waiting for the terminal result. ACKs for other sessions or with
/// requests outside `[1, total + 1]` are ignored.
#[derive(Debug)]
pub struct SendMachine {
    total: u32,
    max_retries: u32,
    phase: SendPhase,
}

impl SendMachine {
    /// Machine for a session of `total` chunks.
    pub fn new(total: u32, max_retries: u32) -> Self {
        Self {
            total,
            max_retries,
            phase: SendPhase::Sending {
                current: 1,
                retries: 0,
            },
        }
    }

    /// The opening move: transmit chunk 1.
    pub fn start(&self) -> SendStep {
        SendStep::Transmit(1)
    }

    /// Feed a per-chunk ACK already matched to this session.
    pub fn on_chunk_ack(&mut self, ack: &ChunkAck) -> SendStep {
        match self.phase {
            SendPhase::Sending { .. } => {
                if ack.next >= 1 && ack.next <= self.total {
                    // The relay names the chunk it wants; follow it whether
                    // that advances, repeats, or backtracks.
                    self.phase = SendPhase::Sending {
                        current: ack.next,
                        retries: 0,
                    };
                    SendStep::Transmit(ack.next)
                } else if ack.next == self.total + 1 {
                    self.phase = SendPhase::AwaitingTerminal;
                    SendStep::AwaitTerminal
                } else {
                    SendStep::Ignore
                }
            }
            SendPhase::AwaitingTerminal | SendPhase::Done => SendStep::Ignore,
        }
    }

    /// Feed a terminal success frame for this session.
    pub fn on_terminal_ack(&mut self, txid: String) -> SendStep {
        match self.phase {
            SendPhase::Done => SendStep::Ignore,
            _ => {
                self.phase = SendPhase::Done;
                SendStep::Succeed(txid)
            }
        }
    }

    /// Feed a terminal failure frame for this session.
    pub fn on_terminal_nack(&mut self, detail: String) -> SendStep {
        match self.phase {
            SendPhase::Done => SendStep::Ignore,
            _ => {
                self.phase = SendPhase::Done;
                SendStep::Fail(SendError::PeerNack(detail))
            }
        }
    }

    /// The armed timer fired.
    pub fn on_timeout(&mut self) -> SendStep {
        match self.phase {
            SendPhase::Sending { current, retries } => {
                if retries < self.max_retries {
                    self.phase = SendPhase::Sending {
                        current,
                        retries: retries + 1,
                    };
                    SendStep::Transmit(current)
                } else {
                    self.phase = SendPhase::Done;
                    SendStep::Fail(SendError::RetryExhausted)
                }
            }
            SendPhase::AwaitingTerminal => {
                self.phase = SendPhase::Done;
                SendStep::Fail(SendError::Timeout)
            }
            SendPhase::Done => SendStep::Ignore,
        }
    }

    /// The caller cancelled the session.
    pub fn on_cancel(&mut self) -> SendStep {
        match self.phase {
            SendPhase::Done => SendStep::Ignore,
            _ => {
                self.phase = SendPhase::Done;
                SendStep::Fail(SendError::Aborted)
            }
        }
    }
}

/// Async driver binding a [`SendMachine`] to a mesh transport.
pub struct TxSender<T> {
    transport: Arc<T>,
    config: SenderConfig,
}

impl<T: MeshTransport> TxSender<T> {
    /// Sender over `transport` with `config`.
    pub fn new(transport: Arc<T>, config: SenderConfig) -> Self {
        Self { transport, config }
    }

    /// Run one complete send session.
    ///
    /// `inbound` must carry this endpoint's received mesh frames; frames for
    /// other sessions are ignored. Dropping `cancel`'s sender half leaves the
    /// session uncancellable, which is fine.
    pub async fn send(
        &self,
        tx_hex: &str,
        destination: &NodeId,
        inbound: &mut mpsc::Receiver<MeshEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> SendResult {
        let session = TxSession::new(tx_hex, destination.clone(), self.config.chunk_size)
            .map_err(|e| SendError::Validation(e.to_string()))?;
        info!(
            session = %session.id(),
            destination = %destination,
            chunks = session.total_chunks(),
            "starting transaction send"
        );

        let mut machine = SendMachine::new(session.total_chunks(), self.config.max_retries);
        let mut deadline = Instant::now() + self.config.ack_timeout;
        let mut cancel_open = true;
        let mut transmit_attempts: u32 = 0;
        let mut transmit_failures: u32 = 0;
        let mut last_transport_error: Option<String> = None;

        let mut pending = machine.start();
        loop {
            // Apply whatever the machine asked for before waiting again.
            match pending {
                SendStep::Transmit(index) => {
                    transmit_attempts += 1;
                    match self.transmit(&session, index).await {
                        Ok(()) => {}
                        Err(detail) => {
                            transmit_failures += 1;
                            warn!(
                                session = %session.id(),
                                chunk = index,
                                error = %detail,
                                "chunk transmit failed; the ACK timer will retry"
                            );
                            last_transport_error = Some(detail);
                        }
                    }
                    deadline = Instant::now() + self.config.ack_timeout;
                }
                SendStep::AwaitTerminal => {
                    debug!(session = %session.id(), "all chunks accepted; awaiting terminal");
                    deadline = Instant::now() + self.config.terminal_timeout;
                }
                SendStep::Ignore => {}
                SendStep::Succeed(txid) => {
                    info!(session = %session.id(), txid = %txid, "relay broadcast confirmed");
                    return Ok(txid);
                }
                SendStep::Fail(SendError::RetryExhausted)
                    if transmit_failures == transmit_attempts =>
                {
                    // Every single transmit attempt failed locally; the mesh
                    // never saw this session.
                    let detail = last_transport_error
                        .unwrap_or_else(|| "transport never accepted a frame".into());
                    return Err(SendError::Transport(detail));
                }
                SendStep::Fail(reason) => return Err(reason),
            }

            pending = tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.dispatch(&session, &mut machine, event),
                    None => SendStep::Fail(SendError::Transport("inbound channel closed".into())),
                },
                _ = tokio::time::sleep_until(deadline) => machine.on_timeout(),
                result = &mut cancel, if cancel_open => {
                    cancel_open = false;
                    if result.is_ok() {
                        machine.on_cancel()
                    } else {
                        SendStep::Ignore
                    }
                }
            };
        }
    }

    fn dispatch(
        &self,
        session: &TxSession,
        machine: &mut SendMachine,
        event: MeshEvent,
    ) -> SendStep {
        let message = match WireMessage::parse(&event.text) {
            Ok(message) => message,
            Err(_) => {
                debug!(
                    sender = %event.sender,
                    frame = %FramePreview(&event.text),
                    "ignoring unparseable frame"
                );
                return SendStep::Ignore;
            }
        };
        if message.session_id() != session.id() {
            debug!(session = %message.session_id(), "frame for another session");
            return SendStep::Ignore;
        }
        match message {
            WireMessage::ChunkAck(ack) => machine.on_chunk_ack(&ack),
            WireMessage::TxAck { txid, .. } => machine.on_terminal_ack(txid),
            WireMessage::TxNack { detail, .. } => machine.on_terminal_nack(detail),
            // Chunks are our output, not our input.
            WireMessage::Chunk(_) => SendStep::Ignore,
        }
    }

    async fn transmit(
        &self,
        session: &TxSession,
        index: u32,
    ) -> std::result::Result<(), String> {
        let Some(payload) = session.fragment(index) else {
            return Err(format!("no fragment {index}"));
        };
        let frame = WireMessage::Chunk(ChunkMessage {
            session_id: session.id().clone(),
            index,
            total: session.total_chunks(),
            payload: payload.to_string(),
        })
        .encode();
        debug!(session = %session.id(), chunk = index, "transmitting chunk");
        self.transport
            .send_text(session.destination(), &frame)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn ack(next: u32) -> ChunkAck {
        ChunkAck {
            session_id: SessionId::parse("t35t1").expect("sid"),
            index: 1,
            next,
        }
    }

    #[test]
    fn test_happy_path_three_chunks() {
        let mut machine = SendMachine::new(3, 3);
        assert_eq!(machine.start(), SendStep::Transmit(1));
        assert_eq!(machine.on_chunk_ack(&ack(2)), SendStep::Transmit(2));
        assert_eq!(machine.on_chunk_ack(&ack(3)), SendStep::Transmit(3));
        assert_eq!(machine.on_chunk_ack(&ack(4)), SendStep::AwaitTerminal);
        assert_eq!(
            machine.on_terminal_ack("beef".into()),
            SendStep::Succeed("beef".into())
        );
        // Nothing after terminal.
        assert_eq!(machine.on_chunk_ack(&ack(2)), SendStep::Ignore);
        assert_eq!(machine.on_timeout(), SendStep::Ignore);
    }

    #[test]
    fn test_same_chunk_rerequest_retransmits() {
        let mut machine = SendMachine::new(2, 3);
        machine.start();
        assert_eq!(machine.on_chunk_ack(&ack(1)), SendStep::Transmit(1));
        assert_eq!(machine.on_chunk_ack(&ack(2)), SendStep::Transmit(2));
    }

    #[test]
    fn test_timeout_retries_then_exhausts() {
        let mut machine = SendMachine::new(2, 3);
        machine.start();
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
        assert_eq!(machine.on_timeout(), SendStep::Fail(SendError::RetryExhausted));
    }

    #[test]
    fn test_ack_resets_retry_budget() {
        let mut machine = SendMachine::new(2, 3);
        machine.start();
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
        // An ACK arrives; the budget applies per chunk, not per session.
        assert_eq!(machine.on_chunk_ack(&ack(2)), SendStep::Transmit(2));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(2));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(2));
        assert_eq!(machine.on_timeout(), SendStep::Transmit(2));
        assert_eq!(machine.on_timeout(), SendStep::Fail(SendError::RetryExhausted));
    }

    #[test]
    fn test_terminal_timeout_fails_with_timeout() {
        let mut machine = SendMachine::new(1, 3);
        machine.start();
        assert_eq!(machine.on_chunk_ack(&ack(2)), SendStep::AwaitTerminal);
        assert_eq!(machine.on_timeout(), SendStep::Fail(SendError::Timeout));
    }

    #[test]
    fn test_nack_ends_session() {
        let mut machine = SendMachine::new(2, 3);
        machine.start();
        assert_eq!(
            machine.on_terminal_nack("reassembly timeout".into()),
            SendStep::Fail(SendError::PeerNack("reassembly timeout".into()))
        );
    }

    #[test]
    fn test_out_of_window_requests_ignored() {
        let mut machine = SendMachine::new(3, 3);
        machine.start();
        assert_eq!(machine.on_chunk_ack(&ack(5)), SendStep::Ignore);
        // Still sending chunk 1.
        assert_eq!(machine.on_timeout(), SendStep::Transmit(1));
    }

    #[test]
    fn test_cancel_aborts() {
        let mut machine = SendMachine::new(3, 3);
        machine.start();
        assert_eq!(machine.on_cancel(), SendStep::Fail(SendError::Aborted));
        assert_eq!(machine.on_cancel(), SendStep::Ignore);
    }
}
