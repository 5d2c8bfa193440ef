//! Keel Core Library
//!
//! Raft-based replicated state machine framework: term-ordered leader
//! election, a segmented durable log, snapshot-driven compaction and
//! follower catch-up, and a session layer giving clients exactly-once
//! commands and ordered event publication.

pub mod cluster;
pub mod context;
pub mod election;
pub mod entry;
pub mod error;
pub mod log;
pub mod machine;
pub mod message;
pub mod meta;
pub mod replication;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod types;

pub use cluster::{ClusterState, Configuration};
pub use context::{Scheduled, ThreadContext};
pub use election::{Election, Role};
pub use entry::{EntryKind, LogEntry};
pub use error::{ErrorKind, RaftError, WireError};
pub use log::{Log, LogConfig, ReadMode};
pub use machine::{Applier, Commit, StateMachine};
pub use message::{ClientRequest, ClientResponse, Consistency, Message, RaftMessage};
pub use server::{RaftServer, ServerConfig};
pub use session::{SessionManager, SessionState};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use transport::Transport;
pub use types::{Member, MemberType, NodeId, SessionId};
