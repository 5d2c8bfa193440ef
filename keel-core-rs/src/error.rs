//! Error types for the keel consensus core.
//!
//! Each subsystem returns its own error enum; client-visible failures are
//! flattened into a wire-level [`ErrorKind`] that tells the proxy whether a
//! request may be retried elsewhere or must surface to the caller.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories carried inside client responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No leader is currently known; retry after the next election
    NoLeader,
    /// The contacted server is not the leader; retry at the hinted leader
    NotLeader,
    /// The node is not part of the committed configuration
    IllegalMember,
    /// The session was never opened or has expired
    UnknownSession,
    /// The session was explicitly closed
    ClosedSession,
    /// The state machine does not understand the operation
    UnknownCommand,
    /// Malformed or inconsistent request; never retried
    Protocol,
    /// The user state machine rejected the command
    Application,
    /// Transient failure; retry with backoff
    Unavailable,
}

impl ErrorKind {
    /// Whether the proxy may transparently retry the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoLeader | ErrorKind::NotLeader | ErrorKind::Unavailable
        )
    }
}

/// Error payload carried in wire responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    /// Leader hint accompanying `NotLeader` rejections
    pub leader: Option<NodeId>,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            leader: None,
        }
    }

    pub fn with_leader(mut self, leader: Option<NodeId>) -> Self {
        self.leader = leader;
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Log store failures
#[derive(Debug, Error)]
pub enum LogError {
    #[error("entry index {index} does not match next index {expected}")]
    IndexMismatch { index: u64, expected: u64 },
    #[error("index {0} is not in the log")]
    OutOfRange(u64),
    #[error("corrupt segment: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Snapshot store failures
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot at index {0} already exists")]
    AlreadyExists(u64),
    #[error("no snapshot at index {0}")]
    Unknown(u64),
    #[error("snapshot at index {0} is not complete")]
    Incomplete(u64),
    #[error("snapshot at index {0} is sealed")]
    Sealed(u64),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata store failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Top-level consensus failures
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("no leader is currently known")]
    NoLeader,
    #[error("this server is not the leader")]
    NotLeader { leader: Option<NodeId> },
    #[error("node is not a member of the cluster configuration")]
    IllegalMember,
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("session {0} is closed")]
    ClosedSession(u64),
    #[error("a configuration change is already in progress")]
    ConfigurationInProgress,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("state machine error: {0}")]
    Application(String),
    #[error("server temporarily unavailable")]
    Unavailable,
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RaftError {
    /// Map an internal failure to its wire-level category
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::NoLeader => ErrorKind::NoLeader,
            RaftError::NotLeader { .. } => ErrorKind::NotLeader,
            RaftError::IllegalMember => ErrorKind::IllegalMember,
            RaftError::UnknownSession(_) => ErrorKind::UnknownSession,
            RaftError::ClosedSession(_) => ErrorKind::ClosedSession,
            RaftError::ConfigurationInProgress => ErrorKind::Unavailable,
            RaftError::Protocol(_) => ErrorKind::Protocol,
            RaftError::Application(_) => ErrorKind::Application,
            RaftError::Unavailable => ErrorKind::Unavailable,
            RaftError::Log(_) | RaftError::Snapshot(_) | RaftError::Storage(_) => {
                ErrorKind::Unavailable
            }
        }
    }

    /// Render this failure as a wire error payload
    pub fn to_wire(&self) -> WireError {
        let leader = match self {
            RaftError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        WireError::new(self.kind(), self.to_string()).with_leader(leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::NoLeader.is_retryable());
        assert!(ErrorKind::NotLeader.is_retryable());
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::UnknownSession.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
    }

    #[test]
    fn test_not_leader_carries_hint() {
        let err = RaftError::NotLeader {
            leader: Some("n2".to_string()),
        };
        let wire = err.to_wire();
        assert_eq!(wire.kind, ErrorKind::NotLeader);
        assert_eq!(wire.leader, Some("n2".to_string()));
    }
}
