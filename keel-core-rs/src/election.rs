//! Leader election state machine.
//!
//! Implements term-ordered election with:
//! - Roles: inactive, reserve, passive, follower, candidate, leader
//! - Pre-vote polling before incrementing the term, to avoid term churn
//!   under partitions
//! - Randomized election timeouts (150-300ms) with 50ms heartbeats
//! - At most one vote per term, persisted by the caller before replies
//!   leave the server
//!
//! Only active members campaign; passive and reserve members hold their
//! role until a configuration change promotes them. All transitions are
//! event-driven: election timeout, higher term seen, quorum of votes,
//! leader contact.

use crate::message::RaftMessage;
use crate::types::{MemberType, NodeId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Election timeout range in milliseconds
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 150;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 300;

/// Heartbeat interval (well below the election timeout)
pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

/// Server role; exactly one at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not part of the configuration
    Inactive,
    /// Member that does not replicate until promoted
    Reserve,
    /// Replicates the log but never votes or leads
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl Role {
    fn for_membership(member_type: Option<MemberType>) -> Self {
        match member_type {
            None => Role::Inactive,
            Some(MemberType::Reserve) => Role::Reserve,
            Some(MemberType::Passive) => Role::Passive,
            Some(MemberType::Active) => Role::Follower,
        }
    }
}

/// Election state machine for one server
pub struct Election {
    node_id: NodeId,
    role: Role,
    /// Highest term seen; persisted by the caller on change
    current_term: u64,
    /// Vote cast in `current_term`; persisted by the caller on change
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    /// Pre-vote acceptances this round (candidate only)
    polls: HashMap<NodeId, bool>,
    /// Votes granted this term (candidate only)
    votes: HashMap<NodeId, bool>,
    election_deadline: Instant,
    last_log_index: u64,
    last_log_term: u64,
    /// Set by a quorum of votes; consumed by the server to initialize
    /// leader state
    became_leader: bool,
}

impl Election {
    pub fn new(node_id: impl Into<NodeId>, member_type: Option<MemberType>) -> Self {
        Self {
            node_id: node_id.into(),
            role: Role::for_membership(member_type),
            current_term: 0,
            voted_for: None,
            leader: None,
            polls: HashMap::new(),
            votes: HashMap::new(),
            election_deadline: Instant::now() + random_election_timeout(),
            last_log_index: 0,
            last_log_term: 0,
            became_leader: false,
        }
    }

    /// Restore persisted term and vote on startup
    pub fn load(&mut self, term: u64, voted_for: Option<NodeId>) {
        self.current_term = term;
        self.voted_for = voted_for;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Track log position for vote comparisons
    pub fn update_log_state(&mut self, last_index: u64, last_term: u64) {
        self.last_log_index = last_index;
        self.last_log_term = last_term;
    }

    /// Re-derive the role after a configuration change
    pub fn apply_membership(&mut self, member_type: Option<MemberType>) {
        let target = Role::for_membership(member_type);
        let keep = matches!(
            (target, self.role),
            (Role::Follower, Role::Follower)
                | (Role::Follower, Role::Candidate)
                | (Role::Follower, Role::Leader)
        );
        if !keep && self.role != target {
            info!(
                "Election: Role {:?} -> {:?} after membership change",
                self.role, target
            );
            self.role = target;
            self.votes.clear();
            self.polls.clear();
            self.election_deadline = Instant::now() + random_election_timeout();
        }
    }

    /// Check the election timer; may start a pre-vote round or, with a
    /// quorum of one, win outright
    pub fn tick(&mut self, now: Instant, quorum: usize) -> Option<RaftMessage> {
        if !matches!(self.role, Role::Follower | Role::Candidate) {
            return None;
        }
        if now < self.election_deadline {
            return None;
        }
        self.start_poll(quorum)
    }

    fn start_poll(&mut self, quorum: usize) -> Option<RaftMessage> {
        let was = self.role;
        self.role = Role::Candidate;
        self.leader = None;
        self.polls.clear();
        self.polls.insert(self.node_id.clone(), true);
        self.election_deadline = Instant::now() + random_election_timeout();

        info!(
            "Election: Timeout as {:?}, polling for term {}",
            was,
            self.current_term + 1
        );

        if self.polls.len() >= quorum {
            return self.start_vote(quorum);
        }
        Some(RaftMessage::Poll {
            term: self.current_term + 1,
            candidate: self.node_id.clone(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        })
    }

    fn start_vote(&mut self, quorum: usize) -> Option<RaftMessage> {
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        self.votes.clear();
        self.votes.insert(self.node_id.clone(), true);
        self.election_deadline = Instant::now() + random_election_timeout();

        info!("Election: Requesting votes for term {}", self.current_term);

        if self.votes.len() >= quorum {
            self.become_leader();
            return None;
        }
        Some(RaftMessage::Vote {
            term: self.current_term,
            candidate: self.node_id.clone(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        })
    }

    fn log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_log_term
            || (last_log_term == self.last_log_term && last_log_index >= self.last_log_index)
    }

    /// Pre-vote probe: answer without changing any state
    pub fn handle_poll(
        &mut self,
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        let accepted =
            term >= self.current_term && self.log_up_to_date(last_log_index, last_log_term);
        debug!(
            "Election: Poll from {} for term {} -> {}",
            candidate, term, accepted
        );
        RaftMessage::PollResponse {
            term: self.current_term,
            from: self.node_id.clone(),
            accepted,
        }
    }

    /// Count a pre-vote acceptance; a quorum starts the real election
    pub fn handle_poll_response(
        &mut self,
        from: NodeId,
        accepted: bool,
        quorum: usize,
    ) -> Option<RaftMessage> {
        if self.role != Role::Candidate {
            return None;
        }
        if accepted {
            self.polls.insert(from, true);
            if self.polls.values().filter(|a| **a).count() >= quorum {
                return self.start_vote(quorum);
            }
        }
        None
    }

    /// Vote request: grant at most one vote per term, and only to
    /// candidates whose log is at least as up-to-date
    pub fn handle_vote(
        &mut self,
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        if term < self.current_term {
            debug!(
                "Election: Rejecting vote for {} (stale term {})",
                candidate, term
            );
            return RaftMessage::VoteResponse {
                term: self.current_term,
                from: self.node_id.clone(),
                voted: false,
            };
        }
        if term > self.current_term {
            self.step_down(term);
        }

        let can_vote =
            self.voted_for.is_none() || self.voted_for.as_ref() == Some(&candidate);
        let log_ok = self.log_up_to_date(last_log_index, last_log_term);
        let voted = can_vote && log_ok;

        if voted {
            self.voted_for = Some(candidate.clone());
            self.election_deadline = Instant::now() + random_election_timeout();
            info!("Election: Granted vote to {} for term {}", candidate, term);
        } else {
            debug!(
                "Election: Rejected vote for {} (can_vote={}, log_ok={})",
                candidate, can_vote, log_ok
            );
        }

        RaftMessage::VoteResponse {
            term: self.current_term,
            from: self.node_id.clone(),
            voted,
        }
    }

    /// Count a granted vote; a quorum wins the election
    pub fn handle_vote_response(&mut self, term: u64, from: NodeId, voted: bool, quorum: usize) {
        if term > self.current_term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Candidate || term != self.current_term {
            return;
        }
        if voted {
            self.votes.insert(from.clone(), true);
            info!(
                "Election: Vote from {} ({}/{} needed)",
                from,
                self.votes.len(),
                quorum
            );
            if self.votes.len() >= quorum {
                self.become_leader();
            }
        }
    }

    /// Note a valid append or install from the current leader
    pub fn record_leader_contact(&mut self, term: u64, leader: NodeId) {
        if term < self.current_term {
            return;
        }
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.leader.as_ref() != Some(&leader) {
            info!("Election: Recognized {} as leader for term {}", leader, term);
        }
        self.leader = Some(leader);
        self.election_deadline = Instant::now() + random_election_timeout();
        if matches!(self.role, Role::Candidate | Role::Leader) {
            self.step_down(term);
        }
    }

    /// Adopt a higher term and drop any candidacy or leadership
    pub fn step_down(&mut self, new_term: u64) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
        }
        let was = self.role;
        if matches!(self.role, Role::Candidate | Role::Leader) {
            self.role = Role::Follower;
        }
        self.votes.clear();
        self.polls.clear();
        self.election_deadline = Instant::now() + random_election_timeout();

        if was != self.role {
            info!(
                "Election: Stepped down from {:?} to {:?} (term {})",
                was, self.role, self.current_term
            );
        }
    }

    fn become_leader(&mut self) {
        info!(
            "Election: Won election for term {} with {} votes",
            self.current_term,
            self.votes.len()
        );
        self.role = Role::Leader;
        self.leader = Some(self.node_id.clone());
        self.became_leader = true;
    }

    /// Consume the election-won signal so the server can initialize leader
    /// state exactly once
    pub fn take_became_leader(&mut self) -> bool {
        std::mem::take(&mut self.became_leader)
    }
}

/// Random timeout within the configured window, to avoid split votes
fn random_election_timeout() -> Duration {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let ms = rng.gen_range(ELECTION_TIMEOUT_MIN_MS..=ELECTION_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(node: &str) -> Election {
        Election::new(node, Some(MemberType::Active))
    }

    fn expired(election: &Election) -> Instant {
        election.election_deadline + Duration::from_millis(1)
    }

    #[test]
    fn test_starts_as_follower() {
        let election = active("n1");
        assert_eq!(election.role(), Role::Follower);
        assert_eq!(election.term(), 0);
    }

    #[test]
    fn test_passive_member_never_campaigns() {
        let mut election = Election::new("n1", Some(MemberType::Passive));
        assert_eq!(election.role(), Role::Passive);
        let deadline = expired(&election);
        assert!(election.tick(deadline, 1).is_none());
        assert_eq!(election.role(), Role::Passive);
    }

    #[test]
    fn test_single_node_wins_immediately() {
        let mut election = active("n1");
        let deadline = expired(&election);
        let msg = election.tick(deadline, 1);
        assert!(msg.is_none());
        assert_eq!(election.role(), Role::Leader);
        assert_eq!(election.term(), 1);
        assert!(election.take_became_leader());
        assert!(!election.take_became_leader());
    }

    #[test]
    fn test_poll_then_vote_then_leader() {
        let mut election = active("n1");
        let deadline = expired(&election);

        let poll = election.tick(deadline, 2);
        match poll {
            Some(RaftMessage::Poll { term, .. }) => assert_eq!(term, 1),
            other => panic!("expected poll, got {other:?}"),
        }
        assert_eq!(election.role(), Role::Candidate);
        // The term is not consumed until the pre-vote succeeds
        assert_eq!(election.term(), 0);

        let vote = election.handle_poll_response("n2".to_string(), true, 2);
        match vote {
            Some(RaftMessage::Vote { term, .. }) => assert_eq!(term, 1),
            other => panic!("expected vote, got {other:?}"),
        }

        election.handle_vote_response(1, "n2".to_string(), true, 2);
        assert_eq!(election.role(), Role::Leader);
        assert!(election.take_became_leader());
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut election = active("n1");

        let first = election.handle_vote(1, "n2".to_string(), 0, 0);
        match first {
            RaftMessage::VoteResponse { voted, .. } => assert!(voted),
            other => panic!("expected vote response, got {other:?}"),
        }

        // A competing candidate in the same term is rejected
        let second = election.handle_vote(1, "n3".to_string(), 0, 0);
        match second {
            RaftMessage::VoteResponse { voted, .. } => assert!(!voted),
            other => panic!("expected vote response, got {other:?}"),
        }

        // The same candidate may be re-granted (lost response)
        let again = election.handle_vote(1, "n2".to_string(), 0, 0);
        match again {
            RaftMessage::VoteResponse { voted, .. } => assert!(voted),
            other => panic!("expected vote response, got {other:?}"),
        }
    }

    #[test]
    fn test_vote_requires_up_to_date_log() {
        let mut election = active("n1");
        election.update_log_state(5, 2);

        // Lower last term loses
        let resp = election.handle_vote(3, "n2".to_string(), 9, 1);
        assert!(matches!(
            resp,
            RaftMessage::VoteResponse { voted: false, .. }
        ));

        // Equal term but shorter log loses
        let resp = election.handle_vote(3, "n3".to_string(), 4, 2);
        assert!(matches!(
            resp,
            RaftMessage::VoteResponse { voted: false, .. }
        ));

        // Equal term and at least as long wins
        let resp = election.handle_vote(3, "n4".to_string(), 5, 2);
        assert!(matches!(resp, RaftMessage::VoteResponse { voted: true, .. }));
    }

    #[test]
    fn test_stale_term_vote_rejected() {
        let mut election = active("n1");
        election.step_down(5);

        let resp = election.handle_vote(3, "n2".to_string(), 0, 0);
        match resp {
            RaftMessage::VoteResponse { term, voted, .. } => {
                assert_eq!(term, 5);
                assert!(!voted);
            }
            other => panic!("expected vote response, got {other:?}"),
        }
    }

    #[test]
    fn test_leader_contact_cancels_candidacy() {
        let mut election = active("n1");
        let deadline = expired(&election);
        election.tick(deadline, 3);
        assert_eq!(election.role(), Role::Candidate);

        election.record_leader_contact(1, "n2".to_string());
        assert_eq!(election.role(), Role::Follower);
        assert_eq!(election.leader(), Some(&"n2".to_string()));
    }

    #[test]
    fn test_step_down_adopts_higher_term_and_clears_vote() {
        let mut election = active("n1");
        election.handle_vote(2, "n2".to_string(), 0, 0);
        assert_eq!(election.voted_for(), Some(&"n2".to_string()));

        election.step_down(7);
        assert_eq!(election.term(), 7);
        assert_eq!(election.voted_for(), None);
    }

    #[test]
    fn test_membership_change_demotes_leader() {
        let mut election = active("n1");
        let deadline = expired(&election);
        election.tick(deadline, 1);
        assert_eq!(election.role(), Role::Leader);

        election.apply_membership(Some(MemberType::Passive));
        assert_eq!(election.role(), Role::Passive);

        election.apply_membership(Some(MemberType::Active));
        assert_eq!(election.role(), Role::Follower);
    }
}
