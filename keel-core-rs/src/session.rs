//! Server-side client sessions.
//!
//! Sessions live inside the committed-entry applier: every transition is
//! driven by an applied log entry and timed by that entry's leader-assigned
//! timestamp, so all replicas reach identical session state. A session
//! tracks:
//! - the last applied command sequence plus a cache of responses, giving
//!   commands exactly-once semantics across network retries
//! - a queue of events published by the state machine, retained until the
//!   client acknowledges them through a keep-alive
//! - the heartbeat clock used for deterministic expiration
//!
//! The registry is the sole owner of session state; other components refer
//! to sessions by id only.

use crate::error::ErrorKind;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    /// Lease lapsed: no keep-alive within the timeout, as measured by log
    /// entry timestamps
    Expired,
    /// Explicitly closed by the client
    Closed,
}

/// Result of a command application, cached byte-for-byte for duplicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Ok(Vec<u8>),
    Error { kind: ErrorKind, message: String },
}

/// Cached reply for one command sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Log index the command committed at
    pub index: u64,
    /// Session event index at response time
    pub event_index: u64,
    pub outcome: CommandOutcome,
}

/// One event published to a session, pending acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Verdict for an arriving command
#[derive(Debug, Clone)]
pub enum CommandCheck {
    /// New sequence; apply to the state machine
    Apply,
    /// Already applied; reply with the cached response
    Duplicate(CachedResponse),
    /// Session missing, expired or closed
    Rejected(ErrorKind),
}

/// One client session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub client: String,
    pub timeout_ms: u64,
    pub state: SessionState,
    /// Log-time of the last keep-alive or open
    last_heartbeat: u64,
    /// Highest applied command sequence
    command_sequence: u64,
    /// Responses retained until acknowledged
    responses: BTreeMap<u64, CachedResponse>,
    /// Events retained until acknowledged
    events: VecDeque<PublishedEvent>,
    /// Last assigned event index
    event_index: u64,
}

impl Session {
    fn new(id: SessionId, client: String, timeout_ms: u64, now: u64) -> Self {
        Self {
            id,
            client,
            timeout_ms,
            state: SessionState::Open,
            last_heartbeat: now,
            command_sequence: 0,
            responses: BTreeMap::new(),
            events: VecDeque::new(),
            event_index: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    fn expired_at(&self, now: u64) -> bool {
        self.last_heartbeat + self.timeout_ms < now
    }

    /// Assign the next event index and queue the payload
    fn publish(&mut self, payload: Vec<u8>) -> u64 {
        self.event_index += 1;
        self.events.push_back(PublishedEvent {
            index: self.event_index,
            payload,
        });
        self.event_index
    }

    /// Events newer than `after`, for best-effort delivery and replay
    pub fn events_after(&self, after: u64) -> Vec<PublishedEvent> {
        self.events
            .iter()
            .filter(|e| e.index > after)
            .cloned()
            .collect()
    }

    fn acknowledge(&mut self, command_sequence: u64, event_index: u64) {
        self.responses.retain(|seq, _| *seq > command_sequence);
        while let Some(front) = self.events.front() {
            if front.index <= event_index {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Registry owning all session state; transitions are entry-driven
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    on_close: Vec<Box<dyn Fn(SessionId) + Send + Sync>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            on_close: Vec::new(),
        }
    }

    /// Register an observer fired exactly once when a session closes or
    /// expires
    pub fn on_close<F>(&mut self, listener: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.on_close.push(Box::new(listener));
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Create a session from an applied open-session entry; the session id
    /// is the entry index
    pub fn open_session(&mut self, index: u64, client: String, timeout_ms: u64, now: u64) -> SessionId {
        let session = Session::new(index, client.clone(), timeout_ms, now);
        info!(
            "Session: Opened session {} for client {} (timeout {}ms)",
            index, client, timeout_ms
        );
        self.sessions.insert(index, session);
        index
    }

    /// Renew a lease and evict acknowledged responses and events
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        command_sequence: u64,
        event_index: u64,
        now: u64,
    ) -> Result<(), ErrorKind> {
        let session = self.sessions.get_mut(&id).ok_or(ErrorKind::UnknownSession)?;
        match session.state {
            SessionState::Open => {
                session.last_heartbeat = now;
                session.acknowledge(command_sequence, event_index);
                Ok(())
            }
            SessionState::Expired => Err(ErrorKind::UnknownSession),
            SessionState::Closed => Err(ErrorKind::ClosedSession),
        }
    }

    /// Close a session from an applied close-session entry
    pub fn close_session(&mut self, id: SessionId) -> Result<(), ErrorKind> {
        let session = self.sessions.get_mut(&id).ok_or(ErrorKind::UnknownSession)?;
        match session.state {
            SessionState::Open => {
                session.state = SessionState::Closed;
                info!("Session: Closed session {}", id);
                self.fire_close(id);
                Ok(())
            }
            SessionState::Expired => Err(ErrorKind::UnknownSession),
            SessionState::Closed => Ok(()),
        }
    }

    /// Deterministic expiration sweep; `now` is the applied entry timestamp
    pub fn expire_stale(&mut self, now: u64) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_open() && s.expired_at(now))
            .map(|s| s.id)
            .collect();

        for id in &expired {
            if let Some(session) = self.sessions.get_mut(id) {
                session.state = SessionState::Expired;
                info!("Session: Expired session {} at log time {}", id, now);
            }
            self.fire_close(*id);
        }
        expired
    }

    fn fire_close(&self, id: SessionId) {
        for listener in &self.on_close {
            listener(id);
        }
    }

    /// Exactly-once gate for an arriving command
    pub fn check_command(&self, id: SessionId, sequence: u64) -> CommandCheck {
        let session = match self.sessions.get(&id) {
            Some(s) => s,
            None => return CommandCheck::Rejected(ErrorKind::UnknownSession),
        };
        match session.state {
            SessionState::Open => {}
            SessionState::Expired => return CommandCheck::Rejected(ErrorKind::UnknownSession),
            SessionState::Closed => return CommandCheck::Rejected(ErrorKind::ClosedSession),
        }

        if sequence <= session.command_sequence {
            match session.responses.get(&sequence) {
                Some(cached) => CommandCheck::Duplicate(cached.clone()),
                // Acknowledged and evicted: the client has already seen the
                // reply, so any retry is a protocol violation
                None => CommandCheck::Rejected(ErrorKind::Protocol),
            }
        } else {
            CommandCheck::Apply
        }
    }

    /// Record an applied command's response and advance the sequence
    pub fn record_response(
        &mut self,
        id: SessionId,
        sequence: u64,
        response: CachedResponse,
    ) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.command_sequence = session.command_sequence.max(sequence);
            session.responses.insert(sequence, response);
            debug!(
                "Session: Cached response for session {} sequence {}",
                id, sequence
            );
        }
    }

    /// Queue an event published by the state machine; returns the assigned
    /// event index if the session is open
    pub fn publish(&mut self, id: SessionId, payload: Vec<u8>) -> Option<u64> {
        let session = self.sessions.get_mut(&id)?;
        if !session.is_open() {
            return None;
        }
        Some(session.publish(payload))
    }

    /// Serialize all sessions for inclusion in a snapshot
    pub fn to_snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Replace all session state from a snapshot
    pub fn load_snapshot(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions.into_iter().map(|s| (s.id, s)).collect();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cached(index: u64, result: &str) -> CachedResponse {
        CachedResponse {
            index,
            event_index: 0,
            outcome: CommandOutcome::Ok(result.as_bytes().to_vec()),
        }
    }

    #[test]
    fn test_open_and_keep_alive() {
        let mut mgr = SessionManager::new();
        let id = mgr.open_session(5, "client-a".to_string(), 1000, 100);
        assert_eq!(id, 5);
        assert!(mgr.get(5).unwrap().is_open());

        mgr.keep_alive(5, 0, 0, 600).unwrap();
        assert_eq!(mgr.keep_alive(99, 0, 0, 600), Err(ErrorKind::UnknownSession));
    }

    #[test]
    fn test_duplicate_command_returns_cached() {
        let mut mgr = SessionManager::new();
        mgr.open_session(1, "c".to_string(), 1000, 0);

        assert!(matches!(mgr.check_command(1, 1), CommandCheck::Apply));
        mgr.record_response(1, 1, cached(7, "result"));

        match mgr.check_command(1, 1) {
            CommandCheck::Duplicate(resp) => {
                assert_eq!(resp.outcome, CommandOutcome::Ok(b"result".to_vec()));
                assert_eq!(resp.index, 7);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        // The next sequence applies normally
        assert!(matches!(mgr.check_command(1, 2), CommandCheck::Apply));
    }

    #[test]
    fn test_keep_alive_evicts_acknowledged_responses() {
        let mut mgr = SessionManager::new();
        mgr.open_session(1, "c".to_string(), 1000, 0);
        mgr.record_response(1, 1, cached(2, "a"));
        mgr.record_response(1, 2, cached(3, "b"));

        mgr.keep_alive(1, 1, 0, 10).unwrap();

        // Sequence 1 was acknowledged; a retry is now a protocol error
        assert!(matches!(
            mgr.check_command(1, 1),
            CommandCheck::Rejected(ErrorKind::Protocol)
        ));
        assert!(matches!(mgr.check_command(1, 2), CommandCheck::Duplicate(_)));
    }

    #[test]
    fn test_deterministic_expiration_fires_close_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut mgr = SessionManager::new();
        let observed = counter.clone();
        mgr.on_close(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        mgr.open_session(1, "c".to_string(), 1000, 0);

        // Not yet expired at exactly the timeout boundary
        assert!(mgr.expire_stale(1000).is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let expired = mgr.expire_stale(1001);
        assert_eq!(expired, vec![1]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Second sweep does not fire again
        assert!(mgr.expire_stale(2000).is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(matches!(
            mgr.check_command(1, 1),
            CommandCheck::Rejected(ErrorKind::UnknownSession)
        ));
    }

    #[test]
    fn test_event_publication_and_acknowledgement() {
        let mut mgr = SessionManager::new();
        mgr.open_session(1, "c".to_string(), 1000, 0);

        assert_eq!(mgr.publish(1, b"e1".to_vec()), Some(1));
        assert_eq!(mgr.publish(1, b"e2".to_vec()), Some(2));
        assert_eq!(mgr.publish(1, b"e3".to_vec()), Some(3));

        let pending = mgr.get(1).unwrap().events_after(0);
        assert_eq!(pending.len(), 3);

        // Acknowledging event 2 retains only event 3 for replay
        mgr.keep_alive(1, 0, 2, 10).unwrap();
        let pending = mgr.get(1).unwrap().events_after(0);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 3);

        // A reconnecting client presenting index 0 still sees event 3
        let replay = mgr.get(1).unwrap().events_after(0);
        assert_eq!(replay[0].payload, b"e3");
    }

    #[test]
    fn test_session_snapshot_round_trip() {
        let mut mgr = SessionManager::new();
        mgr.open_session(1, "a".to_string(), 1000, 0);
        mgr.open_session(4, "b".to_string(), 2000, 0);
        mgr.record_response(1, 1, cached(2, "x"));
        mgr.publish(4, b"evt".to_vec());

        let image = mgr.to_snapshot();

        let mut restored = SessionManager::new();
        restored.load_snapshot(image);
        assert!(matches!(
            restored.check_command(1, 1),
            CommandCheck::Duplicate(_)
        ));
        assert_eq!(restored.get(4).unwrap().events_after(0).len(), 1);
    }
}
