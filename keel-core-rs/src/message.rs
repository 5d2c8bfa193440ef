//! Wire messages for the keel protocol.
//!
//! Two channels share one transport:
//! - `RaftMessage`: server-to-server consensus RPCs (append, poll, vote,
//!   snapshot install) and their responses
//! - `ClientRequest` / `ClientResponse`: session-oriented client traffic,
//!   correlated by a request id
//!
//! All integers are 64-bit unless the protocol says otherwise (the install
//! offset is 32-bit).

use crate::entry::LogEntry;
use crate::error::WireError;
use crate::types::{Member, MemberType, NodeId, SessionId};
use serde::{Deserialize, Serialize};

/// Server-to-server consensus RPCs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RaftMessage {
    /// Leader replicates entries; empty `entries` is a heartbeat
    #[serde(rename = "APPEND")]
    Append {
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    },

    /// Follower response; `log_index` is the last matching index and doubles
    /// as the backoff hint on rejection
    #[serde(rename = "APPEND_RESPONSE")]
    AppendResponse {
        term: u64,
        from: NodeId,
        succeeded: bool,
        log_index: u64,
    },

    /// Pre-vote probe; does not change any receiver state
    #[serde(rename = "POLL")]
    Poll {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },

    #[serde(rename = "POLL_RESPONSE")]
    PollResponse {
        term: u64,
        from: NodeId,
        accepted: bool,
    },

    /// Request a vote for the given term
    #[serde(rename = "VOTE")]
    Vote {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },

    #[serde(rename = "VOTE_RESPONSE")]
    VoteResponse { term: u64, from: NodeId, voted: bool },

    /// One chunk of a snapshot shipped to a lagging follower
    #[serde(rename = "INSTALL")]
    Install {
        term: u64,
        leader: NodeId,
        snapshot_id: u64,
        snapshot_index: u64,
        offset: u32,
        data: Vec<u8>,
        complete: bool,
    },

    /// `next_offset` tells the leader where to resume on rejection
    #[serde(rename = "INSTALL_RESPONSE")]
    InstallResponse {
        term: u64,
        from: NodeId,
        succeeded: bool,
        next_offset: u32,
    },
}

impl RaftMessage {
    /// Get the term from any consensus message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::Append { term, .. } => *term,
            RaftMessage::AppendResponse { term, .. } => *term,
            RaftMessage::Poll { term, .. } => *term,
            RaftMessage::PollResponse { term, .. } => *term,
            RaftMessage::Vote { term, .. } => *term,
            RaftMessage::VoteResponse { term, .. } => *term,
            RaftMessage::Install { term, .. } => *term,
            RaftMessage::InstallResponse { term, .. } => *term,
        }
    }
}

/// Query consistency levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Executed at the leader through the replicated log
    Linearizable,
    /// Executed at the leader against applied state
    Sequential,
    /// Executed at any server; may observe stale state
    Eventual,
}

/// Session-oriented client requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    #[serde(rename = "OPEN_SESSION")]
    OpenSession { client: String, timeout_ms: u64 },

    #[serde(rename = "CLOSE_SESSION")]
    CloseSession { session: SessionId },

    #[serde(rename = "KEEP_ALIVE")]
    KeepAlive {
        session: SessionId,
        command_sequence: u64,
        event_index: u64,
    },

    #[serde(rename = "COMMAND")]
    Command {
        session: SessionId,
        sequence: u64,
        operation: Vec<u8>,
    },

    #[serde(rename = "QUERY")]
    Query {
        session: SessionId,
        sequence: u64,
        last_index: u64,
        operation: Vec<u8>,
        consistency: Consistency,
    },

    /// Leader, term and membership introspection; served by any node
    #[serde(rename = "METADATA")]
    Metadata,

    #[serde(rename = "JOIN")]
    Join { member: Member },

    #[serde(rename = "LEAVE")]
    Leave { node: NodeId },

    #[serde(rename = "RECONFIGURE")]
    Reconfigure { node: NodeId, member_type: MemberType },
}

/// Responses and server-initiated pushes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientResponse {
    #[serde(rename = "SESSION_OPENED")]
    SessionOpened {
        session: SessionId,
        timeout_ms: u64,
        leader: NodeId,
        members: Vec<Member>,
    },

    #[serde(rename = "SESSION_CLOSED")]
    SessionClosed { session: SessionId },

    #[serde(rename = "KEEP_ALIVE_ACK")]
    KeepAliveAck {
        leader: Option<NodeId>,
        members: Vec<Member>,
    },

    #[serde(rename = "COMMAND_RESULT")]
    CommandResult {
        index: u64,
        event_index: u64,
        result: Vec<u8>,
    },

    #[serde(rename = "QUERY_RESULT")]
    QueryResult { index: u64, result: Vec<u8> },

    #[serde(rename = "METADATA_RESULT")]
    MetadataResult {
        leader: Option<NodeId>,
        term: u64,
        commit_index: u64,
        applied_index: u64,
        members: Vec<Member>,
    },

    #[serde(rename = "CONFIGURATION_RESULT")]
    ConfigurationResult { index: u64, members: Vec<Member> },

    /// Unsolicited event published by the state machine to a session;
    /// acknowledged through the next keep-alive
    #[serde(rename = "EVENT")]
    Event {
        session: SessionId,
        event_index: u64,
        payload: Vec<u8>,
    },

    #[serde(rename = "ERROR")]
    Error { error: WireError },
}

/// Datagram envelope shared by consensus and client traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel")]
pub enum Message {
    #[serde(rename = "RAFT")]
    Raft { message: RaftMessage },

    #[serde(rename = "REQUEST")]
    Request { id: String, request: ClientRequest },

    #[serde(rename = "RESPONSE")]
    Response {
        id: String,
        response: ClientResponse,
    },
}

impl Message {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_message_round_trip() {
        let msg = Message::Raft {
            message: RaftMessage::Vote {
                term: 3,
                candidate: "n1".to_string(),
                last_log_index: 9,
                last_log_term: 2,
            },
        };

        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();

        if let Message::Raft {
            message: RaftMessage::Vote {
                term, candidate, ..
            },
        } = parsed
        {
            assert_eq!(term, 3);
            assert_eq!(candidate, "n1");
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_client_request_round_trip() {
        let msg = Message::Request {
            id: "req-1".to_string(),
            request: ClientRequest::Command {
                session: 2,
                sequence: 7,
                operation: b"incr".to_vec(),
            },
        };

        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();

        if let Message::Request { id, request } = parsed {
            assert_eq!(id, "req-1");
            if let ClientRequest::Command { sequence, .. } = request {
                assert_eq!(sequence, 7);
            } else {
                panic!("Wrong request type");
            }
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_message_term_accessor() {
        let msg = RaftMessage::Install {
            term: 5,
            leader: "n1".to_string(),
            snapshot_id: 10,
            snapshot_index: 10,
            offset: 0,
            data: vec![1, 2, 3],
            complete: false,
        };
        assert_eq!(msg.term(), 5);
    }
}
