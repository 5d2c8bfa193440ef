//! Replicated log entries.
//!
//! Every state transition in the cluster is an entry: user commands, session
//! lifecycle, membership changes and the no-op a new leader appends to commit
//! entries from prior terms. Timestamps are chosen by the leader and recorded
//! in the entry so that every replica observes the same clock.

use crate::types::{Member, SessionId};
use serde::{Deserialize, Serialize};

/// Single replicated log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Index in the log (1-based, dense, no gaps)
    pub index: u64,
    /// Term the entry was proposed in
    pub term: u64,
    /// Leader-assigned epoch milliseconds; the cluster-wide session clock
    pub timestamp: u64,
    /// What the entry does when applied
    pub kind: EntryKind,
}

/// Entry payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryKind {
    /// No-op appended by a newly elected leader
    #[serde(rename = "INITIALIZE")]
    Initialize,

    /// User command routed through a session for exactly-once application
    #[serde(rename = "COMMAND")]
    Command {
        session: SessionId,
        sequence: u64,
        operation: Vec<u8>,
    },

    /// Linearizable read routed through the log; never advances the
    /// session's command sequence
    #[serde(rename = "QUERY")]
    Query {
        session: SessionId,
        operation: Vec<u8>,
    },

    /// Open a client session; the session id is this entry's index
    #[serde(rename = "OPEN_SESSION")]
    OpenSession { client: String, timeout_ms: u64 },

    /// Close a client session
    #[serde(rename = "CLOSE_SESSION")]
    CloseSession { session: SessionId },

    /// Renew a session lease and acknowledge received responses and events
    #[serde(rename = "KEEP_ALIVE")]
    KeepAlive {
        session: SessionId,
        command_sequence: u64,
        event_index: u64,
    },

    /// Membership change; effective upon append, not commit
    #[serde(rename = "CONFIGURATION")]
    Configuration { members: Vec<Member> },
}

impl LogEntry {
    pub fn new(index: u64, term: u64, timestamp: u64, kind: EntryKind) -> Self {
        Self {
            index,
            term,
            timestamp,
            kind,
        }
    }

    /// Create the no-op entry appended on leader election
    pub fn initialize(index: u64, term: u64, timestamp: u64) -> Self {
        Self::new(index, term, timestamp, EntryKind::Initialize)
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.kind, EntryKind::Configuration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let entry = LogEntry::new(
            7,
            2,
            1_700_000_000_000,
            EntryKind::Command {
                session: 2,
                sequence: 4,
                operation: b"put k v".to_vec(),
            },
        );

        let bytes = serde_json::to_vec(&entry).unwrap();
        let parsed: LogEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_configuration_tag() {
        let entry = LogEntry::new(1, 1, 0, EntryKind::Configuration { members: vec![] });
        assert!(entry.is_configuration());
        assert!(!LogEntry::initialize(2, 1, 0).is_configuration());
    }
}
