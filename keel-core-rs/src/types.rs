//! Core identifiers and shared types for the keel protocol.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a keel server
pub type NodeId = String;

/// Session identifiers are the log index of the entry that opened the session,
/// which makes them unique across the cluster.
pub type SessionId = u64;

/// Participation level of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// Votes in elections, replicates the log, may lead
    Active,
    /// Replicates the log but never votes or leads
    Passive,
    /// Does not replicate until promoted via reconfiguration
    Reserve,
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberType::Active => write!(f, "active"),
            MemberType::Passive => write!(f, "passive"),
            MemberType::Reserve => write!(f, "reserve"),
        }
    }
}

/// A member of the cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: SocketAddr,
    pub member_type: MemberType,
}

impl Member {
    pub fn new(id: impl Into<NodeId>, address: SocketAddr, member_type: MemberType) -> Self {
        Self {
            id: id.into(),
            address,
            member_type,
        }
    }

    /// Whether this member counts toward election and commit quorums
    pub fn is_voting(&self) -> bool {
        self.member_type == MemberType::Active
    }

    /// Whether the leader replicates the log to this member
    pub fn is_replicating(&self) -> bool {
        matches!(self.member_type, MemberType::Active | MemberType::Passive)
    }
}

/// Current Unix timestamp in milliseconds
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roles() {
        let addr: SocketAddr = "127.0.0.1:9990".parse().unwrap();

        let active = Member::new("n1", addr, MemberType::Active);
        assert!(active.is_voting());
        assert!(active.is_replicating());

        let passive = Member::new("n2", addr, MemberType::Passive);
        assert!(!passive.is_voting());
        assert!(passive.is_replicating());

        let reserve = Member::new("n3", addr, MemberType::Reserve);
        assert!(!reserve.is_voting());
        assert!(!reserve.is_replicating());
    }

    #[test]
    fn test_member_serialization() {
        let addr: SocketAddr = "127.0.0.1:9990".parse().unwrap();
        let member = Member::new("n1", addr, MemberType::Active);

        let bytes = serde_json::to_vec(&member).unwrap();
        let parsed: Member = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, member);
    }
}
