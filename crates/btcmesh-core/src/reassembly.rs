//! Server-side reassembly state.
//!
//! A [`ReassemblySession`] holds the fragments of one in-flight transaction;
//! the [`ReassemblyTable`] owns every active session plus a bounded ring of
//! recently finished ones whose terminal frames can be replayed to late
//! duplicates. Invariants are enforced at insertion, not by convention.

use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::transport::NodeId;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Capacity of the recently-completed replay ring.
const RECENT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Lifecycle of a reassembly session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting fragments.
    Collecting,
    /// All fragments present; broadcast in flight. No new fragments.
    Broadcasting,
    /// Finished; only the replay ring remembers it.
    Terminal,
}

/// Outcome of storing one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Fragment stored.
    Stored,
    /// Byte-identical duplicate; nothing changed except activity time.
    Duplicate,
}

/// All fragments and metadata for one session id.
#[derive(Debug)]
pub struct ReassemblySession {
    id: SessionId,
    sender: NodeId,
    total_chunks: u32,
    fragments: HashMap<u32, String>,
    first_seen: Instant,
    last_activity: Instant,
    status: SessionStatus,
}

impl ReassemblySession {
    fn new(id: SessionId, sender: NodeId, total_chunks: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            total_chunks,
            fragments: HashMap::new(),
            first_seen: now,
            last_activity: now,
            status: SessionStatus::Collecting,
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Sender this session is pinned to; fixed at first observation.
    pub fn sender(&self) -> &NodeId {
        &self.sender
    }

    /// Declared chunk count; fixed at first observation.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Number of distinct fragments stored so far.
    pub fn stored_count(&self) -> u32 {
        self.fragments.len() as u32
    }

    /// Store a fragment, enforcing the session invariants.
    ///
    /// Rejects fragments once the session left Collecting, chunk numbers
    /// outside `[1, total_chunks]`, and duplicates whose payload differs from
    /// what is already stored.
    pub fn insert(&mut self, chunk_num: u32, payload: &str) -> Result<InsertOutcome> {
        if self.status != SessionStatus::Collecting {
            return Err(Error::InconsistentSession(
                "session no longer accepts chunks".into(),
            ));
        }
        if chunk_num == 0 || chunk_num > self.total_chunks {
            return Err(Error::InconsistentSession(format!(
                "chunk {chunk_num} outside 1..={}",
                self.total_chunks
            )));
        }
        self.last_activity = Instant::now();
        if let Some(existing) = self.fragments.get(&chunk_num) {
            if existing == payload {
                return Ok(InsertOutcome::Duplicate);
            }
            return Err(Error::InconsistentSession("duplicate chunk mismatch".into()));
        }
        self.fragments.insert(chunk_num, payload.to_string());
        Ok(InsertOutcome::Stored)
    }

    /// Smallest chunk number not yet stored, or `total_chunks + 1` when the
    /// session is complete. This value drives the sender.
    pub fn next_missing(&self) -> u32 {
        (1..=self.total_chunks)
            .find(|n| !self.fragments.contains_key(n))
            .unwrap_or(self.total_chunks + 1)
    }

    /// Whether every fragment is present.
    pub fn is_complete(&self) -> bool {
        self.next_missing() > self.total_chunks
    }

    /// Concatenate the fragments in ascending chunk order.
    ///
    /// Only meaningful once [`Self::is_complete`] holds; missing fragments
    /// are skipped.
    pub fn assemble(&self) -> String {
        let mut hex = String::new();
        for n in 1..=self.total_chunks {
            if let Some(fragment) = self.fragments.get(&n) {
                hex.push_str(fragment);
            }
        }
        hex
    }

    /// Mark the session as broadcasting; it accepts no further fragments.
    pub fn begin_broadcast(&mut self) {
        self.status = SessionStatus::Broadcasting;
    }

    /// Time since the last accepted or duplicate fragment.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// When the first fragment arrived.
    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }
}

/// A stale session the janitor evicted, with what the NACK needs.
#[derive(Debug)]
pub struct EvictedSession {
    /// Session id for the NACK frame.
    pub session_id: SessionId,
    /// Pinned sender the NACK goes to.
    pub sender: NodeId,
    /// Fragments collected before the deadline, for logging.
    pub stored: u32,
    /// Declared total, for logging.
    pub total: u32,
}

/// Owner of every server-side session.
pub struct ReassemblyTable {
    timeout: Duration,
    active: HashMap<SessionId, ReassemblySession>,
    /// Pinned sender and terminal frame text by session id, replayed at
    /// late duplicates.
    completed: LruCache<SessionId, (NodeId, String)>,
}

impl ReassemblyTable {
    /// Create a table evicting Collecting sessions idle beyond `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: HashMap::new(),
            completed: LruCache::new(RECENT_CAPACITY),
        }
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Look up an active session.
    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut ReassemblySession> {
        self.active.get_mut(id)
    }

    /// Create a session pinned to `sender`, keyed by `id`.
    pub fn create(
        &mut self,
        id: SessionId,
        sender: NodeId,
        total_chunks: u32,
    ) -> &mut ReassemblySession {
        self.active
            .entry(id.clone())
            .or_insert_with(|| ReassemblySession::new(id, sender, total_chunks))
    }

    /// Drop an active session without recording a terminal frame.
    pub fn remove(&mut self, id: &SessionId) -> Option<ReassemblySession> {
        self.active.remove(id)
    }

    /// Retire a session: remove it from the active table and remember its
    /// terminal frame for replay to its pinned sender.
    pub fn retire(&mut self, id: &SessionId, sender: NodeId, terminal_frame: String) {
        self.active.remove(id);
        self.completed.put(id.clone(), (sender, terminal_frame));
    }

    /// Terminal frame previously emitted for `id`, if still remembered and
    /// `sender` matches the pinned one. A mismatched sender learns nothing.
    pub fn replay_frame(&mut self, id: &SessionId, sender: &NodeId) -> Option<String> {
        match self.completed.get(id) {
            Some((pinned, frame)) if pinned == sender => Some(frame.clone()),
            _ => None,
        }
    }

    /// Evict every Collecting session idle beyond the timeout.
    ///
    /// Broadcasting sessions are never touched; their fate is decided by the
    /// in-flight RPC call.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<EvictedSession> {
        let stale: Vec<SessionId> = self
            .active
            .iter()
            .filter(|(_, s)| {
                s.status() == SessionStatus::Collecting && s.idle_for(now) > self.timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.active.remove(&id).map(|session| EvictedSession {
                    session_id: id,
                    sender: session.sender().clone(),
                    stored: session.stored_count(),
                    total: session.total_chunks(),
                })
            })
            .collect()
    }

    /// Configured eviction timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).expect("sid")
    }

    fn node(raw: &str) -> NodeId {
        NodeId::parse(raw).expect("node")
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut session = ReassemblySession::new(sid("s1"), node("!aa"), 3);
        assert_eq!(session.insert(2, "bb").expect("insert"), InsertOutcome::Stored);
        assert_eq!(session.next_missing(), 1);
        session.insert(3, "cc").expect("insert");
        assert_eq!(session.next_missing(), 1);
        session.insert(1, "aa").expect("insert");
        assert!(session.is_complete());
        assert_eq!(session.next_missing(), 4);
        assert_eq!(session.assemble(), "aabbcc");
    }

    #[test]
    fn test_identical_duplicate_is_noop() {
        let mut session = ReassemblySession::new(sid("s1"), node("!aa"), 2);
        session.insert(1, "aa").expect("insert");
        assert_eq!(session.insert(1, "aa").expect("dup"), InsertOutcome::Duplicate);
        assert_eq!(session.stored_count(), 1);
    }

    #[test]
    fn test_conflicting_duplicate_is_rejected() {
        let mut session = ReassemblySession::new(sid("s1"), node("!aa"), 2);
        session.insert(1, "aa").expect("insert");
        assert!(session.insert(1, "ff").is_err());
    }

    #[test]
    fn test_out_of_range_chunk_rejected() {
        let mut session = ReassemblySession::new(sid("s1"), node("!aa"), 2);
        assert!(session.insert(0, "aa").is_err());
        assert!(session.insert(3, "aa").is_err());
    }

    #[test]
    fn test_no_inserts_after_broadcast_begins() {
        let mut session = ReassemblySession::new(sid("s1"), node("!aa"), 1);
        session.insert(1, "aa").expect("insert");
        session.begin_broadcast();
        assert!(session.insert(1, "aa").is_err());
    }

    #[test]
    fn test_eviction_frees_only_stale_collecting() {
        let mut table = ReassemblyTable::new(Duration::from_secs(300));
        table.create(sid("old"), node("!aa"), 3).insert(1, "aa").expect("insert");
        table.create(sid("busy"), node("!bb"), 3).insert(1, "aa").expect("insert");
        if let Some(s) = table.get_mut(&sid("busy")) {
            s.begin_broadcast();
        }

        // Nothing is stale yet.
        assert!(table.evict_stale(Instant::now()).is_empty());

        // Far in the future both are idle, but only Collecting is evicted.
        let later = Instant::now() + Duration::from_secs(301);
        let evicted = table.evict_stale(later);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, sid("old"));
        assert_eq!(evicted[0].stored, 1);
        assert_eq!(evicted[0].total, 3);
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_retire_and_replay() {
        let mut table = ReassemblyTable::new(Duration::from_secs(300));
        table.create(sid("s1"), node("!aa"), 1);
        table.retire(&sid("s1"), node("!aa"), "BTC_ACK|s1|SUCCESS|TXID:beef".into());
        assert_eq!(table.active_count(), 0);
        assert_eq!(
            table.replay_frame(&sid("s1"), &node("!aa")).as_deref(),
            Some("BTC_ACK|s1|SUCCESS|TXID:beef")
        );
        // Unknown session: nothing to replay.
        assert!(table.replay_frame(&sid("s2"), &node("!aa")).is_none());
        // Wrong sender: the session's existence is not disclosed.
        assert!(table.replay_frame(&sid("s1"), &node("!bb")).is_none());
    }
}
