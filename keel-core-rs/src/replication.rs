//! Leader-side replication state.
//!
//! Tracks per-follower progress (`next_index` / `match_index`), builds
//! batched append requests, backs off using the follower's hint on
//! rejection, and switches to the chunked snapshot install protocol when the
//! prefix a follower needs has been compacted away. Commit advancement uses
//! the quorum of voting-member match indexes, restricted to entries of the
//! current term.

use crate::log::Log;
use crate::message::RaftMessage;
use crate::snapshot::SnapshotStore;
use crate::types::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum entries per append batch
pub const MAX_BATCH_ENTRIES: usize = 64;

/// Soft cap on append batch payload bytes, to stay within a datagram
pub const MAX_BATCH_BYTES: usize = 32 * 1024;

/// Snapshot install chunk size
pub const INSTALL_CHUNK_SIZE: usize = 16 * 1024;

/// In-flight snapshot transfer to one follower
#[derive(Debug, Clone)]
pub struct InstallProgress {
    pub snapshot_index: u64,
    /// Next byte offset to send
    pub offset: u32,
    /// Total snapshot size, learned when the transfer starts
    pub size: u64,
}

/// Replication state for a single follower
#[derive(Debug, Clone)]
pub struct FollowerProgress {
    /// Next index to send
    pub next_index: u64,
    /// Highest index known replicated
    pub match_index: u64,
    /// Last time this follower answered
    pub last_contact: Instant,
    pub installing: Option<InstallProgress>,
}

impl FollowerProgress {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            last_contact: Instant::now(),
            installing: None,
        }
    }
}

/// Leader bookkeeping for all replicating members
pub struct LeaderReplication {
    leader: NodeId,
    followers: HashMap<NodeId, FollowerProgress>,
}

impl LeaderReplication {
    /// Initialize on election: `next_index` starts just past the leader's
    /// last entry
    pub fn new(leader: impl Into<NodeId>, peers: &[NodeId], last_index: u64) -> Self {
        let leader = leader.into();
        let followers = peers
            .iter()
            .filter(|p| **p != leader)
            .map(|p| (p.clone(), FollowerProgress::new(last_index + 1)))
            .collect();
        Self { leader, followers }
    }

    /// Reconcile tracked followers after a configuration change
    pub fn sync_membership(&mut self, peers: &[NodeId], last_index: u64) {
        self.followers
            .retain(|id, _| peers.contains(id));
        for peer in peers {
            if *peer != self.leader {
                self.followers
                    .entry(peer.clone())
                    .or_insert_with(|| FollowerProgress::new(last_index + 1));
            }
        }
    }

    pub fn progress(&self, id: &NodeId) -> Option<&FollowerProgress> {
        self.followers.get(id)
    }

    /// Build the next message for a follower: a batched append, or an
    /// install chunk when the needed prefix is gone
    pub fn build_message(
        &mut self,
        follower: &NodeId,
        log: &Log,
        snapshots: &SnapshotStore,
        term: u64,
    ) -> Option<RaftMessage> {
        let (installing, next_index) = {
            let progress = self.followers.get(follower)?;
            (progress.installing.is_some(), progress.next_index)
        };

        if installing || next_index <= log.compacted_index() {
            return self.build_install(follower, snapshots, term);
        }

        let prev_log_index = next_index - 1;
        // Real terms are always nonzero; a zero at a nonzero index means the
        // boundary term did not survive a restart, so ship the snapshot
        // instead of an unverifiable prefix
        let prev_log_term = match log.term(prev_log_index) {
            Some(t) if t > 0 || prev_log_index == 0 => t,
            _ => return self.build_install(follower, snapshots, term),
        };

        let mut entries = Vec::new();
        let mut bytes = 0usize;
        let mut index = next_index;
        while index <= log.last_index() && entries.len() < MAX_BATCH_ENTRIES {
            match log.get(index) {
                Some(entry) => {
                    bytes += entry_weight(entry);
                    if !entries.is_empty() && bytes > MAX_BATCH_BYTES {
                        break;
                    }
                    entries.push(entry.clone());
                }
                None => break,
            }
            index += 1;
        }

        Some(RaftMessage::Append {
            term,
            leader: self.leader.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: log.commit_index(),
        })
    }

    fn build_install(
        &mut self,
        follower: &NodeId,
        snapshots: &SnapshotStore,
        term: u64,
    ) -> Option<RaftMessage> {
        let current = snapshots.current()?;
        let data = match snapshots.read(current.index) {
            Ok(data) => data,
            Err(e) => {
                warn!("Replication: Cannot read snapshot for install: {}", e);
                return None;
            }
        };

        let progress = self.followers.get_mut(follower)?;
        let installing = progress.installing.get_or_insert_with(|| {
            info!(
                "Replication: Starting snapshot install to {} at index {}",
                follower, current.index
            );
            InstallProgress {
                snapshot_index: current.index,
                offset: 0,
                size: data.len() as u64,
            }
        });

        // A newer snapshot replaced the one mid-transfer; restart
        if installing.snapshot_index != current.index {
            *installing = InstallProgress {
                snapshot_index: current.index,
                offset: 0,
                size: data.len() as u64,
            };
        }

        let start = installing.offset as usize;
        if start > data.len() {
            progress.installing = None;
            return None;
        }
        let end = (start + INSTALL_CHUNK_SIZE).min(data.len());

        Some(RaftMessage::Install {
            term,
            leader: self.leader.clone(),
            snapshot_id: current.id,
            snapshot_index: current.index,
            offset: start as u32,
            data: data[start..end].to_vec(),
            complete: end == data.len(),
        })
    }

    /// Record an append response; on rejection, back off to the follower's
    /// hinted last index
    pub fn record_append_response(&mut self, follower: &NodeId, succeeded: bool, log_index: u64) {
        let progress = match self.followers.get_mut(follower) {
            Some(p) => p,
            None => return,
        };
        progress.last_contact = Instant::now();

        if succeeded {
            // Stale UDP responses may arrive out of order; only advance
            progress.match_index = progress.match_index.max(log_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            debug!(
                "Replication: {} match={} next={}",
                follower, progress.match_index, progress.next_index
            );
        } else {
            progress.next_index = progress.next_index.min(log_index + 1).max(1);
            debug!(
                "Replication: {} rejected, next backed off to {}",
                follower, progress.next_index
            );
        }
    }

    /// Record an install response; a completed transfer resumes appends just
    /// past the snapshot
    pub fn record_install_response(&mut self, follower: &NodeId, succeeded: bool, next_offset: u32) {
        let progress = match self.followers.get_mut(follower) {
            Some(p) => p,
            None => return,
        };
        progress.last_contact = Instant::now();

        let installing = match progress.installing.as_mut() {
            Some(i) => i,
            None => return,
        };

        if !succeeded {
            // The follower told us where to resume
            installing.offset = next_offset;
            return;
        }

        if next_offset as u64 >= installing.size {
            info!(
                "Replication: Snapshot install to {} complete at index {}",
                follower, installing.snapshot_index
            );
            let snapshot_index = installing.snapshot_index;
            progress.installing = None;
            progress.match_index = progress.match_index.max(snapshot_index);
            progress.next_index = snapshot_index + 1;
        } else {
            installing.offset = next_offset;
        }
    }

    /// Highest index replicated to a quorum of the given voting members;
    /// the leader's own log counts
    pub fn quorum_match_index(&self, voting: &[NodeId], leader_last: u64, quorum: usize) -> u64 {
        let mut matches: Vec<u64> = voting
            .iter()
            .map(|id| {
                if *id == self.leader {
                    leader_last
                } else {
                    self.followers.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        if quorum == 0 || matches.len() < quorum {
            return 0;
        }
        matches[quorum - 1]
    }

    /// Whether a quorum of voting members answered within `window`; leaders
    /// step down when they lose contact with a majority
    pub fn quorum_contact_ok(&self, voting: &[NodeId], window: Duration, now: Instant) -> bool {
        let mut contacted = 0usize;
        for id in voting {
            if *id == self.leader {
                contacted += 1;
            } else if let Some(p) = self.followers.get(id) {
                if now.duration_since(p.last_contact) <= window {
                    contacted += 1;
                }
            }
        }
        let quorum = voting.len() / 2 + 1;
        contacted >= quorum
    }
}

/// Rough wire weight of one entry, for batch sizing
fn entry_weight(entry: &crate::entry::LogEntry) -> usize {
    64 + match &entry.kind {
        crate::entry::EntryKind::Command { operation, .. } => operation.len() * 4,
        crate::entry::EntryKind::Query { operation, .. } => operation.len() * 4,
        crate::entry::EntryKind::Configuration { members } => members.len() * 128,
        _ => 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use crate::log::LogConfig;
    use tempfile::tempdir;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn open_log(dir: &std::path::Path, entries: u64) -> Log {
        let mut log = Log::open(LogConfig {
            dir: dir.to_path_buf(),
            max_segment_size: 1024 * 1024,
            max_segment_entries: 4,
            fsync_on_write: false,
        })
        .unwrap();
        for i in 0..entries {
            log.append(
                1,
                i,
                EntryKind::Command {
                    session: 1,
                    sequence: i + 1,
                    operation: b"op".to_vec(),
                },
            )
            .unwrap();
        }
        log
    }

    #[test]
    fn test_append_batches_from_next_index() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 5);
        let snapshots = SnapshotStore::memory();
        let peers = nodes(&["n1", "n2"]);
        let mut repl = LeaderReplication::new("n1", &peers, log.last_index());

        // Fresh follower: heartbeat with no entries
        let msg = repl
            .build_message(&"n2".to_string(), &log, &snapshots, 1)
            .unwrap();
        match msg {
            RaftMessage::Append {
                prev_log_index,
                entries,
                ..
            } => {
                assert_eq!(prev_log_index, 5);
                assert!(entries.is_empty());
            }
            other => panic!("expected append, got {other:?}"),
        }

        // A rejection hints the follower only has up to index 2
        repl.record_append_response(&"n2".to_string(), false, 2);
        let msg = repl
            .build_message(&"n2".to_string(), &log, &snapshots, 1)
            .unwrap();
        match msg {
            RaftMessage::Append {
                prev_log_index,
                entries,
                ..
            } => {
                assert_eq!(prev_log_index, 2);
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0].index, 3);
            }
            other => panic!("expected append, got {other:?}"),
        }

        repl.record_append_response(&"n2".to_string(), true, 5);
        let progress = repl.progress(&"n2".to_string()).unwrap();
        assert_eq!(progress.match_index, 5);
        assert_eq!(progress.next_index, 6);
    }

    #[test]
    fn test_stale_success_does_not_regress() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), 5);
        let peers = nodes(&["n1", "n2"]);
        let mut repl = LeaderReplication::new("n1", &peers, log.last_index());

        repl.record_append_response(&"n2".to_string(), true, 5);
        repl.record_append_response(&"n2".to_string(), true, 3); // late packet
        let progress = repl.progress(&"n2".to_string()).unwrap();
        assert_eq!(progress.match_index, 5);
    }

    #[test]
    fn test_quorum_match_index_is_median() {
        let peers = nodes(&["n1", "n2", "n3", "n4", "n5"]);
        let mut repl = LeaderReplication::new("n1", &peers, 10);
        repl.record_append_response(&"n2".to_string(), true, 10);
        repl.record_append_response(&"n3".to_string(), true, 7);
        repl.record_append_response(&"n4".to_string(), true, 3);
        // n5 has not replicated anything

        // matches: leader 10, n2 10, n3 7, n4 3, n5 0 -> third highest is 7
        assert_eq!(repl.quorum_match_index(&peers, 10, 3), 7);
    }

    #[test]
    fn test_compacted_prefix_switches_to_install() {
        let dir = tempdir().unwrap();
        let mut log = open_log(dir.path(), 10);
        let mut snapshots = SnapshotStore::memory();

        // Snapshot at index 8, then compact; segments [1,4] and [5,8] drop
        snapshots.create(8, 0).unwrap();
        snapshots.append(8, &vec![7u8; 40 * 1024]).unwrap();
        snapshots.complete(8).unwrap();
        log.compact(8).unwrap();
        assert_eq!(log.compacted_index(), 8);

        let peers = nodes(&["n1", "n2"]);
        let mut repl = LeaderReplication::new("n1", &peers, log.last_index());
        // Follower is far behind the compaction boundary
        repl.record_append_response(&"n2".to_string(), false, 1);

        let msg = repl
            .build_message(&"n2".to_string(), &log, &snapshots, 1)
            .unwrap();
        match msg {
            RaftMessage::Install {
                snapshot_index,
                offset,
                complete,
                ref data,
                ..
            } => {
                assert_eq!(snapshot_index, 8);
                assert_eq!(offset, 0);
                assert!(!complete);
                assert_eq!(data.len(), INSTALL_CHUNK_SIZE);
            }
            other => panic!("expected install, got {other:?}"),
        }

        // Follower acknowledges the first chunk
        repl.record_install_response(&"n2".to_string(), true, INSTALL_CHUNK_SIZE as u32);
        let msg = repl
            .build_message(&"n2".to_string(), &log, &snapshots, 1)
            .unwrap();
        match msg {
            RaftMessage::Install {
                offset, complete, ..
            } => {
                assert_eq!(offset, INSTALL_CHUNK_SIZE as u32);
                assert!(!complete);
            }
            other => panic!("expected install, got {other:?}"),
        }

        // Final chunk completes the transfer and resumes appends
        repl.record_install_response(&"n2".to_string(), true, 2 * INSTALL_CHUNK_SIZE as u32);
        let msg = repl
            .build_message(&"n2".to_string(), &log, &snapshots, 1)
            .unwrap();
        match msg {
            RaftMessage::Install {
                offset, complete, ..
            } => {
                assert_eq!(offset, 2 * INSTALL_CHUNK_SIZE as u32);
                assert!(complete);
            }
            other => panic!("expected install, got {other:?}"),
        }
        repl.record_install_response(&"n2".to_string(), true, 40 * 1024);

        let progress = repl.progress(&"n2".to_string()).unwrap();
        assert!(progress.installing.is_none());
        assert_eq!(progress.match_index, 8);
        assert_eq!(progress.next_index, 9);
    }

    #[test]
    fn test_quorum_contact_window() {
        let peers = nodes(&["n1", "n2", "n3"]);
        let mut repl = LeaderReplication::new("n1", &peers, 0);
        let now = Instant::now();

        // Both followers silent beyond the window: only self counts
        let later = now + Duration::from_millis(500);
        assert!(!repl.quorum_contact_ok(&peers, Duration::from_millis(300), later));

        repl.record_append_response(&"n2".to_string(), true, 0);
        assert!(repl.quorum_contact_ok(&peers, Duration::from_millis(300), Instant::now()));
    }
}
