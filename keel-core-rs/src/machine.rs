//! State machine application.
//!
//! The [`Applier`] delivers committed entries to the user-supplied
//! [`StateMachine`] exactly once per replica, in index order. Everything a
//! replica needs to agree on lives here: session transitions, exactly-once
//! command deduplication, deterministic expiration and event publication.
//! Snapshots capture both the machine image and the session registry so an
//! installed follower reaches the same state as the leader.

use crate::cluster::Configuration;
use crate::entry::{EntryKind, LogEntry};
use crate::error::ErrorKind;
use crate::session::{
    CachedResponse, CommandCheck, CommandOutcome, Session, SessionManager,
};
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// User-supplied replicated state machine.
///
/// Operations are opaque bytes; the machine decides their meaning. `apply`
/// runs for committed commands only and must be deterministic. Errors are
/// returned to the submitting client and do not affect log state.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command; the returned bytes become the response
    fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, String>;

    /// Execute a read-only query against applied state
    fn query(&self, operation: &[u8]) -> Result<Vec<u8>, String>;

    /// Capture applied state as bytes
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace state from a snapshot image
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Context handed to the state machine for one committed command
pub struct Commit<'a> {
    pub index: u64,
    pub timestamp: u64,
    pub session: SessionId,
    pub operation: &'a [u8],
    published: Vec<(SessionId, Vec<u8>)>,
}

impl Commit<'_> {
    /// Publish an event to any session; delivery is best-effort by the
    /// leader, retention is driven by keep-alive acknowledgements
    pub fn publish(&mut self, session: SessionId, payload: Vec<u8>) {
        self.published.push((session, payload));
    }
}

/// Everything captured by a snapshot at one applied index
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotImage {
    /// Term of the last entry covered, needed at the log's compaction edge
    pub last_term: u64,
    /// Committed configuration at capture time, so an installed follower
    /// learns the membership along with the state
    pub configuration: Configuration,
    pub sessions: Vec<Session>,
    pub machine: Vec<u8>,
}

/// Fields handed back when a snapshot image is restored
#[derive(Debug)]
pub struct RestoredImage {
    pub last_term: u64,
    pub configuration: Configuration,
}

/// Event published during application, to be pushed by the leader
#[derive(Debug, Clone)]
pub struct EventPush {
    pub session: SessionId,
    pub event_index: u64,
    pub payload: Vec<u8>,
}

/// What one applied entry produced
#[derive(Debug)]
pub enum Applied {
    None,
    SessionOpened {
        session: SessionId,
        timeout_ms: u64,
    },
    SessionClosed {
        session: SessionId,
        error: Option<ErrorKind>,
    },
    KeepAlive {
        session: SessionId,
        error: Option<ErrorKind>,
    },
    Command {
        session: SessionId,
        sequence: u64,
        response: CachedResponse,
    },
    Query {
        session: SessionId,
        result: Result<Vec<u8>, (ErrorKind, String)>,
    },
    Configuration,
}

/// Result of applying one entry
pub struct ApplyResult {
    pub index: u64,
    pub outcome: Applied,
    /// Sessions expired by this entry's timestamp
    pub expired: Vec<SessionId>,
    /// Events published during application
    pub events: Vec<EventPush>,
}

/// Serialized delivery of committed entries to the state machine
pub struct Applier {
    machine: Box<dyn StateMachine>,
    sessions: SessionManager,
    applied_index: u64,
}

impl Applier {
    pub fn new(machine: Box<dyn StateMachine>) -> Self {
        Self {
            machine,
            sessions: SessionManager::new(),
            applied_index: 0,
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    /// Run a read-only query against applied state
    pub fn query(&self, operation: &[u8]) -> Result<Vec<u8>, (ErrorKind, String)> {
        self.machine
            .query(operation)
            .map_err(|msg| (ErrorKind::Application, msg))
    }

    /// Apply one committed entry in index order
    pub fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        // The entry's timestamp is the cluster clock: sweep leases first so
        // expiration is identical on every replica
        let expired = self.sessions.expire_stale(entry.timestamp);
        let mut events = Vec::new();

        let outcome = match &entry.kind {
            EntryKind::Initialize => Applied::None,

            EntryKind::OpenSession { client, timeout_ms } => {
                let session = self.sessions.open_session(
                    entry.index,
                    client.clone(),
                    *timeout_ms,
                    entry.timestamp,
                );
                Applied::SessionOpened {
                    session,
                    timeout_ms: *timeout_ms,
                }
            }

            EntryKind::CloseSession { session } => Applied::SessionClosed {
                session: *session,
                error: self.sessions.close_session(*session).err(),
            },

            EntryKind::KeepAlive {
                session,
                command_sequence,
                event_index,
            } => Applied::KeepAlive {
                session: *session,
                error: self
                    .sessions
                    .keep_alive(*session, *command_sequence, *event_index, entry.timestamp)
                    .err(),
            },

            EntryKind::Command {
                session,
                sequence,
                operation,
            } => match self.sessions.check_command(*session, *sequence) {
                CommandCheck::Duplicate(cached) => {
                    debug!(
                        "Applier: Duplicate command session={} sequence={}, replying from cache",
                        session, sequence
                    );
                    Applied::Command {
                        session: *session,
                        sequence: *sequence,
                        response: cached,
                    }
                }
                CommandCheck::Rejected(kind) => Applied::Command {
                    session: *session,
                    sequence: *sequence,
                    response: CachedResponse {
                        index: entry.index,
                        event_index: 0,
                        outcome: CommandOutcome::Error {
                            kind,
                            message: format!("session {session} cannot accept commands"),
                        },
                    },
                },
                CommandCheck::Apply => {
                    let mut commit = Commit {
                        index: entry.index,
                        timestamp: entry.timestamp,
                        session: *session,
                        operation,
                        published: Vec::new(),
                    };
                    let result = self.machine.apply(&mut commit);

                    for (target, payload) in commit.published {
                        if let Some(event_index) = self.sessions.publish(target, payload.clone()) {
                            events.push(EventPush {
                                session: target,
                                event_index,
                                payload,
                            });
                        }
                    }

                    let event_index = self
                        .sessions
                        .get(*session)
                        .map(|s| s.event_index())
                        .unwrap_or(0);
                    let response = CachedResponse {
                        index: entry.index,
                        event_index,
                        outcome: match result {
                            Ok(bytes) => CommandOutcome::Ok(bytes),
                            Err(message) => CommandOutcome::Error {
                                kind: ErrorKind::Application,
                                message,
                            },
                        },
                    };
                    self.sessions
                        .record_response(*session, *sequence, response.clone());
                    Applied::Command {
                        session: *session,
                        sequence: *sequence,
                        response,
                    }
                }
            },

            EntryKind::Query { session, operation } => Applied::Query {
                session: *session,
                result: self.query(operation),
            },

            EntryKind::Configuration { .. } => Applied::Configuration,
        };

        self.applied_index = entry.index;
        ApplyResult {
            index: entry.index,
            outcome,
            expired,
            events,
        }
    }

    /// Capture applied state plus session registry as a snapshot payload
    pub fn snapshot_image(
        &self,
        last_term: u64,
        configuration: Configuration,
    ) -> Result<Vec<u8>, String> {
        let machine = self.machine.snapshot()?;
        let image = SnapshotImage {
            last_term,
            configuration,
            sessions: self.sessions.to_snapshot(),
            machine,
        };
        serde_json::to_vec(&image).map_err(|e| e.to_string())
    }

    /// Replace applied state from a snapshot payload
    pub fn restore_image(&mut self, index: u64, data: &[u8]) -> Result<RestoredImage, String> {
        let image: SnapshotImage = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        self.machine.restore(&image.machine)?;
        self.sessions.load_snapshot(image.sessions);
        self.applied_index = index;
        Ok(RestoredImage {
            last_term: image.last_term,
            configuration: image.configuration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Counter machine: "incr" adds one and publishes the new value to every
    /// session named in `watchers`
    struct Counter {
        value: u64,
        watchers: Vec<SessionId>,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                value: 0,
                watchers: Vec::new(),
            }
        }
    }

    impl StateMachine for Counter {
        fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, String> {
            match commit.operation {
                b"incr" => {
                    self.value += 1;
                    for watcher in &self.watchers {
                        commit.publish(*watcher, self.value.to_string().into_bytes());
                    }
                    Ok(self.value.to_string().into_bytes())
                }
                b"watch" => {
                    self.watchers.push(commit.session);
                    Ok(Vec::new())
                }
                b"fail" => Err("boom".to_string()),
                other => Err(format!("unknown operation {:?}", other)),
            }
        }

        fn query(&self, operation: &[u8]) -> Result<Vec<u8>, String> {
            match operation {
                b"get" => Ok(self.value.to_string().into_bytes()),
                _ => Err("unknown query".to_string()),
            }
        }

        fn snapshot(&self) -> Result<Vec<u8>, String> {
            let mut state = HashMap::new();
            state.insert("value".to_string(), self.value);
            serde_json::to_vec(&state).map_err(|e| e.to_string())
        }

        fn restore(&mut self, data: &[u8]) -> Result<(), String> {
            let state: HashMap<String, u64> =
                serde_json::from_slice(data).map_err(|e| e.to_string())?;
            self.value = *state.get("value").unwrap_or(&0);
            Ok(())
        }
    }

    fn entry(index: u64, kind: EntryKind) -> LogEntry {
        LogEntry::new(index, 1, index * 100, kind)
    }

    fn command(index: u64, session: u64, sequence: u64, op: &str) -> LogEntry {
        entry(
            index,
            EntryKind::Command {
                session,
                sequence,
                operation: op.as_bytes().to_vec(),
            },
        )
    }

    fn open_session(index: u64) -> LogEntry {
        entry(
            index,
            EntryKind::OpenSession {
                client: format!("client-{index}"),
                timeout_ms: 10_000,
            },
        )
    }

    #[test]
    fn test_command_applies_once() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        applier.apply(&open_session(1));

        let first = applier.apply(&command(2, 1, 1, "incr"));
        let retry = applier.apply(&command(3, 1, 1, "incr"));

        let (a, b) = match (first.outcome, retry.outcome) {
            (
                Applied::Command { response: a, .. },
                Applied::Command { response: b, .. },
            ) => (a, b),
            other => panic!("expected command outcomes, got {other:?}"),
        };

        // The counter incremented exactly once and both replies match
        assert_eq!(a.outcome, CommandOutcome::Ok(b"1".to_vec()));
        assert_eq!(a, b);
        assert_eq!(applier.query(b"get").unwrap(), b"1".to_vec());
    }

    #[test]
    fn test_application_error_is_cached_and_isolated() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        applier.apply(&open_session(1));

        let failed = applier.apply(&command(2, 1, 1, "fail"));
        match failed.outcome {
            Applied::Command { response, .. } => match response.outcome {
                CommandOutcome::Error { kind, message } => {
                    assert_eq!(kind, ErrorKind::Application);
                    assert_eq!(message, "boom");
                }
                other => panic!("expected error outcome, got {other:?}"),
            },
            other => panic!("expected command outcome, got {other:?}"),
        }

        // The failure consumed the sequence number but not the machine state
        let next = applier.apply(&command(3, 1, 2, "incr"));
        match next.outcome {
            Applied::Command { response, .. } => {
                assert_eq!(response.outcome, CommandOutcome::Ok(b"1".to_vec()));
            }
            other => panic!("expected command outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_session_rejected() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        let result = applier.apply(&command(1, 42, 1, "incr"));
        match result.outcome {
            Applied::Command { response, .. } => match response.outcome {
                CommandOutcome::Error { kind, .. } => {
                    assert_eq!(kind, ErrorKind::UnknownSession)
                }
                other => panic!("expected error, got {other:?}"),
            },
            other => panic!("expected command outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_events_route_to_watching_sessions() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        applier.apply(&open_session(1));
        applier.apply(&open_session(2));
        applier.apply(&command(3, 2, 1, "watch"));

        let result = applier.apply(&command(4, 1, 1, "incr"));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].session, 2);
        assert_eq!(result.events[0].event_index, 1);
        assert_eq!(result.events[0].payload, b"1".to_vec());
    }

    #[test]
    fn test_expiry_follows_entry_timestamps() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        // Session with a 10s lease opened at log time 100
        applier.apply(&open_session(1));

        // An entry far in log time expires the session deterministically
        let late = LogEntry::new(2, 1, 100 + 10_001, EntryKind::Initialize);
        let result = applier.apply(&late);
        assert_eq!(result.expired, vec![1]);
    }

    #[test]
    fn test_snapshot_image_round_trip() {
        let mut applier = Applier::new(Box::new(Counter::new()));
        applier.apply(&open_session(1));
        applier.apply(&command(2, 1, 1, "incr"));
        applier.apply(&command(3, 1, 2, "incr"));

        let image = applier
            .snapshot_image(1, Configuration { index: 0, members: vec![] })
            .unwrap();

        let mut restored = Applier::new(Box::new(Counter::new()));
        let result = restored.restore_image(3, &image).unwrap();
        assert_eq!(result.last_term, 1);
        assert_eq!(restored.applied_index(), 3);
        assert_eq!(restored.query(b"get").unwrap(), b"2".to_vec());

        // Session state travelled with the image: duplicates still dedupe
        let retry = restored.apply(&command(4, 1, 2, "incr"));
        match retry.outcome {
            Applied::Command { response, .. } => {
                assert_eq!(response.outcome, CommandOutcome::Ok(b"2".to_vec()));
            }
            other => panic!("expected command outcome, got {other:?}"),
        }
        assert_eq!(restored.query(b"get").unwrap(), b"2".to_vec());
    }
}
