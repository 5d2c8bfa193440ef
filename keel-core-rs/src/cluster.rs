//! Cluster membership and configuration tracking.
//!
//! Membership changes travel through the log as configuration entries and
//! are applied one member at a time. A new configuration takes effect as
//! soon as it is appended, so at most one change may be outstanding; if the
//! entry is truncated before commit the state reverts to the committed
//! configuration. Quorums are always computed over the voting members of
//! the effective configuration.

use crate::error::RaftError;
use crate::types::{Member, MemberType, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A member set tagged with the log index that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: u64,
    pub members: Vec<Member>,
}

/// Per-server view of the cluster configuration
pub struct ClusterState {
    local: NodeId,
    committed: Configuration,
    /// Appended but not yet committed change, already in effect
    pending: Option<Configuration>,
}

impl ClusterState {
    pub fn new(local: impl Into<NodeId>, members: Vec<Member>) -> Self {
        Self {
            local: local.into(),
            committed: Configuration { index: 0, members },
            pending: None,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// The effective configuration: the pending change if one is in flight
    pub fn configuration(&self) -> &Configuration {
        self.pending.as_ref().unwrap_or(&self.committed)
    }

    pub fn committed_configuration(&self) -> &Configuration {
        &self.committed
    }

    pub fn members(&self) -> &[Member] {
        &self.configuration().members
    }

    pub fn member(&self, id: &NodeId) -> Option<&Member> {
        self.members().iter().find(|m| &m.id == id)
    }

    pub fn local_member(&self) -> Option<&Member> {
        self.members().iter().find(|m| m.id == self.local)
    }

    pub fn local_type(&self) -> Option<MemberType> {
        self.local_member().map(|m| m.member_type)
    }

    pub fn voting_members(&self) -> Vec<&Member> {
        self.members().iter().filter(|m| m.is_voting()).collect()
    }

    /// Members the leader replicates to, excluding itself
    pub fn replication_targets(&self) -> Vec<&Member> {
        self.members()
            .iter()
            .filter(|m| m.id != self.local && m.is_replicating())
            .collect()
    }

    pub fn is_voting(&self, id: &NodeId) -> bool {
        self.member(id).map(|m| m.is_voting()).unwrap_or(false)
    }

    /// Majority of the effective voting membership
    pub fn quorum_size(&self) -> usize {
        self.voting_members().len() / 2 + 1
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Record an appended configuration entry; effective immediately
    pub fn record_appended(&mut self, index: u64, members: Vec<Member>) {
        info!(
            "Cluster: Configuration at index {} now in effect ({} members)",
            index,
            members.len()
        );
        self.pending = Some(Configuration { index, members });
    }

    /// Finalize the pending configuration once its entry commits
    pub fn commit_to(&mut self, index: u64) -> bool {
        match &self.pending {
            Some(p) if p.index <= index => {
                self.committed = self.pending.take().expect("pending checked above");
                info!(
                    "Cluster: Committed configuration at index {}",
                    self.committed.index
                );
                true
            }
            _ => false,
        }
    }

    /// Adopt a configuration recovered from a snapshot image
    pub fn install(&mut self, configuration: Configuration) {
        if configuration.index >= self.committed.index {
            info!(
                "Cluster: Installed configuration at index {} ({} members)",
                configuration.index,
                configuration.members.len()
            );
            self.committed = configuration;
            self.pending = None;
        }
    }

    /// Drop an uncommitted configuration removed by log truncation
    pub fn revert_above(&mut self, index: u64) -> bool {
        match &self.pending {
            Some(p) if p.index > index => {
                warn!(
                    "Cluster: Reverting uncommitted configuration at index {}",
                    p.index
                );
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Member list for a join; idempotent when the member is already present
    pub fn propose_join(&self, member: &Member) -> Result<Vec<Member>, RaftError> {
        if self.has_pending() {
            return Err(RaftError::ConfigurationInProgress);
        }
        match self.member(&member.id) {
            Some(existing) if existing == member => Ok(self.members().to_vec()),
            Some(_) => Err(RaftError::IllegalMember),
            None => {
                let mut members = self.members().to_vec();
                members.push(member.clone());
                Ok(members)
            }
        }
    }

    /// Member list for a leave; idempotent when the node is already gone
    pub fn propose_leave(&self, node: &NodeId) -> Result<Vec<Member>, RaftError> {
        if self.has_pending() {
            return Err(RaftError::ConfigurationInProgress);
        }
        Ok(self
            .members()
            .iter()
            .filter(|m| &m.id != node)
            .cloned()
            .collect())
    }

    /// Member list for a promotion or demotion
    pub fn propose_reconfigure(
        &self,
        node: &NodeId,
        member_type: MemberType,
    ) -> Result<Vec<Member>, RaftError> {
        if self.has_pending() {
            return Err(RaftError::ConfigurationInProgress);
        }
        if self.member(node).is_none() {
            return Err(RaftError::IllegalMember);
        }
        Ok(self
            .members()
            .iter()
            .map(|m| {
                if &m.id == node {
                    Member {
                        member_type,
                        ..m.clone()
                    }
                } else {
                    m.clone()
                }
            })
            .collect())
    }
}
