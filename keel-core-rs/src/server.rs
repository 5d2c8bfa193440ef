//! Raft server runtime.
//!
//! Ties the subsystems together around a single event loop:
//! - consensus RPCs (append, poll, vote, install) from peers
//! - session-oriented client requests, answered when their entry commits
//!   and applies
//! - a 50ms tick driving election timeouts, heartbeats and leader lease
//!   checks through the server's [`ThreadContext`]
//!
//! All server state is owned by the loop task; nothing here is shared across
//! threads. Failures inside a subsystem complete the pending client reply
//! with a typed error; fatal storage errors mark the server failed and
//! refuse further appends.

use crate::cluster::ClusterState;
use crate::context::ThreadContext;
use crate::election::{Election, HEARTBEAT_INTERVAL_MS, ELECTION_TIMEOUT_MAX_MS};
use crate::entry::{EntryKind, LogEntry};
use crate::error::{ErrorKind, RaftError, WireError};
use crate::log::{Log, LogConfig, ReadMode};
use crate::machine::{Applied, ApplyResult, Applier, StateMachine};
use crate::message::{ClientRequest, ClientResponse, Consistency, Message, RaftMessage};
use crate::meta::{MetaStore, ServerMeta};
use crate::replication::LeaderReplication;
use crate::snapshot::SnapshotStore;
use crate::transport::Transport;
use crate::types::{unix_timestamp_ms, Member, MemberType, NodeId, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub data_dir: PathBuf,
    /// Bootstrap membership; superseded by any configuration recovered from
    /// the log or a snapshot
    pub members: Vec<Member>,
    pub max_segment_size: u64,
    pub max_segment_entries: u64,
    pub fsync_on_write: bool,
    /// Applied entries between snapshots
    pub compaction_threshold: u64,
    /// Session timeout applied when a client does not request one
    pub default_session_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(
        node_id: impl Into<NodeId>,
        address: SocketAddr,
        data_dir: impl Into<PathBuf>,
        members: Vec<Member>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address,
            data_dir: data_dir.into(),
            members,
            max_segment_size: 32 * 1024 * 1024,
            max_segment_entries: 8192,
            fsync_on_write: true,
            compaction_threshold: 1024,
            default_session_timeout_ms: 5000,
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_segment_entries(mut self, entries: u64) -> Self {
        self.max_segment_entries = entries;
        self
    }

    pub fn without_fsync(mut self) -> Self {
        self.fsync_on_write = false;
        self
    }

    pub fn with_session_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_session_timeout_ms = timeout_ms;
        self
    }
}

/// Events delivered through the server's context
#[derive(Debug, Clone)]
enum ServerEvent {
    Tick,
}

/// Client reply parked until its log index applies
struct PendingReply {
    addr: SocketAddr,
    id: String,
}

/// Query parked until the applied index catches up
struct PendingQuery {
    wait_index: u64,
    addr: SocketAddr,
    id: String,
    operation: Vec<u8>,
}

/// Follower-side snapshot transfer state
struct PendingInstall {
    snapshot_index: u64,
    next_offset: u32,
}

/// One keel server
pub struct RaftServer {
    config: ServerConfig,
    transport: Transport,
    incoming: Option<mpsc::Receiver<(Message, SocketAddr)>>,
    context: ThreadContext<ServerEvent>,
    events: Option<mpsc::Receiver<ServerEvent>>,
    log: Log,
    snapshots: SnapshotStore,
    meta: MetaStore,
    cluster: ClusterState,
    election: Election,
    /// Present while this server leads
    replication: Option<LeaderReplication>,
    applier: Applier,
    pending_replies: HashMap<u64, PendingReply>,
    pending_queries: Vec<PendingQuery>,
    /// Last known client address per session, for best-effort event pushes
    session_addrs: HashMap<SessionId, SocketAddr>,
    pending_install: Option<PendingInstall>,
    last_snapshot_index: u64,
    /// Set on unrecoverable storage failure; refuses further work
    failed: bool,
}

impl RaftServer {
    /// Open storage, recover state and bind the transport
    pub async fn new(
        config: ServerConfig,
        machine: Box<dyn StateMachine>,
    ) -> Result<Self, RaftError> {
        let (transport, incoming) = Transport::bind(config.address)
            .await
            .map_err(|e| RaftError::Storage(e.into()))?;

        let mut log = Log::open(LogConfig {
            dir: config.data_dir.join("log"),
            max_segment_size: config.max_segment_size,
            max_segment_entries: config.max_segment_entries,
            fsync_on_write: config.fsync_on_write,
        })?;
        let snapshots = SnapshotStore::file(config.data_dir.join("snapshots"))?;
        let meta = MetaStore::open(&config.data_dir)?;

        let mut applier = Applier::new(machine);
        let mut cluster = ClusterState::new(config.node_id.clone(), config.members.clone());
        let mut last_snapshot_index = 0;

        if let Some(snap) = snapshots.current() {
            let image = snapshots.read(snap.index)?;
            let restored = applier
                .restore_image(snap.index, &image)
                .map_err(RaftError::Application)?;
            log.note_boundary_term(snap.index, restored.last_term);
            cluster.install(restored.configuration);
            last_snapshot_index = snap.index;
            info!(
                "Server {}: Restored snapshot at index {}",
                config.node_id, snap.index
            );
        }

        // Configurations stored after the snapshot boundary re-apply here
        let committed_config = meta.load().last_config_index;
        let mut recovered_configs = Vec::new();
        {
            let mut reader = log.reader(log.first_index(), ReadMode::All);
            while let Some(entry) = reader.next() {
                if let EntryKind::Configuration { members } = &entry.kind {
                    recovered_configs.push((entry.index, members.clone()));
                }
            }
        }
        for (index, members) in recovered_configs {
            cluster.record_appended(index, members);
            if index <= committed_config {
                cluster.commit_to(index);
            }
        }

        let mut election = Election::new(config.node_id.clone(), cluster.local_type());
        election.load(meta.load().current_term, meta.load().voted_for.clone());
        election.update_log_state(log.last_index(), log.last_term());

        let (context, events) = ThreadContext::new(format!("server-{}", config.node_id), 64);

        Ok(Self {
            config,
            transport,
            incoming: Some(incoming),
            context,
            events: Some(events),
            log,
            snapshots,
            meta,
            cluster,
            election,
            replication: None,
            applier,
            pending_replies: HashMap::new(),
            pending_queries: Vec::new(),
            session_addrs: HashMap::new(),
            pending_install: None,
            last_snapshot_index,
            failed: false,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Drive the server until the transport closes
    pub async fn run(mut self) {
        let mut incoming = self.incoming.take().expect("run() consumes the server");
        let mut events = self.events.take().expect("run() consumes the server");
        let _ticker = self.context.schedule_repeating(
            Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            ServerEvent::Tick,
        );

        info!(
            "Server {}: Running at {} with {} members",
            self.config.node_id,
            self.config.address,
            self.cluster.members().len()
        );

        loop {
            tokio::select! {
                Some(event) = events.recv() => match event {
                    ServerEvent::Tick => self.tick().await,
                },
                maybe = incoming.recv() => match maybe {
                    Some((msg, src)) => self.handle_message(msg, src).await,
                    None => break,
                },
            }
        }
    }

    async fn tick(&mut self) {
        if self.failed {
            return;
        }
        let now = Instant::now();

        if self.election.is_leader() {
            self.leader_tick(now).await;
            return;
        }

        if self.cluster.local_type() != Some(MemberType::Active) {
            return;
        }
        let quorum = self.cluster.quorum_size();
        if let Some(msg) = self.election.tick(now, quorum) {
            self.persist_meta();
            self.broadcast_to_voters(msg).await;
        } else {
            self.persist_meta();
        }
        if self.election.take_became_leader() {
            self.on_elected().await;
        }
    }

    async fn leader_tick(&mut self, now: Instant) {
        let voting: Vec<NodeId> = self
            .cluster
            .voting_members()
            .iter()
            .map(|m| m.id.clone())
            .collect();

        if voting.len() > 1 {
            let window = Duration::from_millis(ELECTION_TIMEOUT_MAX_MS * 2);
            let reachable = self
                .replication
                .as_ref()
                .map(|r| r.quorum_contact_ok(&voting, window, now))
                .unwrap_or(false);
            if !reachable {
                warn!(
                    "Server {}: Lost contact with a quorum, stepping down",
                    self.config.node_id
                );
                self.election.step_down(self.election.term());
                self.on_step_down().await;
                return;
            }
        }

        self.replicate_round().await;
    }

    async fn handle_message(&mut self, msg: Message, src: SocketAddr) {
        match msg {
            Message::Raft { message } => self.handle_raft(message, src).await,
            Message::Request { id, request } => self.handle_request(id, request, src).await,
            // Servers never originate client requests
            Message::Response { .. } => {}
        }
    }

    async fn handle_raft(&mut self, msg: RaftMessage, src: SocketAddr) {
        if self.failed {
            return;
        }

        // A higher term demotes whatever we are doing
        if msg.term() > self.election.term() {
            let was_leader = self.election.is_leader();
            self.election.step_down(msg.term());
            self.persist_meta();
            if was_leader {
                self.on_step_down().await;
            }
        }

        match msg {
            RaftMessage::Append {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => {
                let resp = self
                    .handle_append(term, leader, prev_log_index, prev_log_term, entries, commit_index)
                    .await;
                self.send_raft(resp, src).await;
            }

            RaftMessage::Poll {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                let resp = self
                    .election
                    .handle_poll(term, candidate, last_log_index, last_log_term);
                self.send_raft(resp, src).await;
            }

            RaftMessage::PollResponse { from, accepted, .. } => {
                let quorum = self.cluster.quorum_size();
                if let Some(vote) = self.election.handle_poll_response(from, accepted, quorum) {
                    self.persist_meta();
                    self.broadcast_to_voters(vote).await;
                }
                self.persist_meta();
                if self.election.take_became_leader() {
                    self.on_elected().await;
                }
            }

            RaftMessage::Vote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                // Passive and reserve members never vote; servers outside
                // the configuration still do, which keeps elections live
                // while a join is only partially propagated
                let resp = if matches!(
                    self.cluster.local_type(),
                    Some(MemberType::Passive) | Some(MemberType::Reserve)
                ) {
                    RaftMessage::VoteResponse {
                        term: self.election.term(),
                        from: self.config.node_id.clone(),
                        voted: false,
                    }
                } else {
                    self.election
                        .handle_vote(term, candidate, last_log_index, last_log_term)
                };
                self.persist_meta();
                self.send_raft(resp, src).await;
            }

            RaftMessage::VoteResponse { term, from, voted } => {
                let quorum = self.cluster.quorum_size();
                self.election.handle_vote_response(term, from, voted, quorum);
                self.persist_meta();
                if self.election.take_became_leader() {
                    self.on_elected().await;
                }
            }

            RaftMessage::Install {
                term,
                leader,
                snapshot_id,
                snapshot_index,
                offset,
                data,
                complete,
            } => {
                let resp = self
                    .handle_install(term, leader, snapshot_id, snapshot_index, offset, data, complete)
                    .await;
                self.send_raft(resp, src).await;
            }

            RaftMessage::AppendResponse {
                term,
                from,
                succeeded,
                log_index,
            } => {
                if self.election.is_leader() && term == self.election.term() {
                    // A follower may report a longer (stale) suffix; only the
                    // prefix up to our own last index is verified to match
                    let log_index = log_index.min(self.log.last_index());
                    if let Some(repl) = self.replication.as_mut() {
                        repl.record_append_response(&from, succeeded, log_index);
                    }
                    self.advance_commit().await;
                    if !succeeded {
                        // Retry immediately with the hinted prefix
                        self.replicate_to(&from).await;
                    }
                }
            }

            RaftMessage::InstallResponse {
                term,
                from,
                succeeded,
                next_offset,
            } => {
                if self.election.is_leader() && term == self.election.term() {
                    if let Some(repl) = self.replication.as_mut() {
                        repl.record_install_response(&from, succeeded, next_offset);
                    }
                    self.replicate_to(&from).await;
                }
            }
        }
    }

    fn append_response(&self, succeeded: bool) -> RaftMessage {
        RaftMessage::AppendResponse {
            term: self.election.term(),
            from: self.config.node_id.clone(),
            succeeded,
            log_index: self.log.last_index(),
        }
    }

    async fn handle_append(
        &mut self,
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) -> RaftMessage {
        if term < self.election.term() {
            return self.append_response(false);
        }

        self.election.record_leader_contact(term, leader);
        self.persist_meta();

        // Consistency check at the previous index. Anything at or below the
        // compaction boundary is snapshot-covered and cannot diverge.
        if prev_log_index > self.log.compacted_index() {
            match self.log.term(prev_log_index) {
                None => {
                    debug!(
                        "Server {}: Append missing prefix at {} (last {})",
                        self.config.node_id,
                        prev_log_index,
                        self.log.last_index()
                    );
                    return self.append_response(false);
                }
                Some(t) if t != prev_log_term => {
                    debug!(
                        "Server {}: Conflicting entry at {} (have term {}, leader says {})",
                        self.config.node_id, prev_log_index, t, prev_log_term
                    );
                    if self.truncate_to(prev_log_index - 1).await.is_err() {
                        return self.append_response(false);
                    }
                    return self.append_response(false);
                }
                Some(_) => {}
            }
        }

        for entry in entries {
            if entry.index <= self.log.compacted_index() {
                continue;
            }
            if entry.index <= self.log.last_index() {
                match self.log.term(entry.index) {
                    Some(t) if t == entry.term => continue,
                    _ => {
                        if self.truncate_to(entry.index - 1).await.is_err() {
                            return self.append_response(false);
                        }
                    }
                }
            }

            let configuration = match &entry.kind {
                EntryKind::Configuration { members } => Some(members.clone()),
                _ => None,
            };
            let index = entry.index;
            if let Err(e) = self.log.append_entry(entry) {
                self.note_storage_failure(e);
                return self.append_response(false);
            }
            if let Some(members) = configuration {
                self.cluster.record_appended(index, members);
                self.election.apply_membership(self.cluster.local_type());
            }
        }

        self.election
            .update_log_state(self.log.last_index(), self.log.last_term());
        self.log.commit(commit_index);
        self.apply_committed().await;

        self.append_response(true)
    }

    /// Truncate the log and revert any uncommitted configuration above the
    /// cut
    async fn truncate_to(&mut self, index: u64) -> Result<(), ()> {
        if let Err(e) = self.log.truncate(index) {
            self.note_storage_failure(e);
            return Err(());
        }
        if self.cluster.revert_above(index) {
            self.election.apply_membership(self.cluster.local_type());
        }
        self.election
            .update_log_state(self.log.last_index(), self.log.last_term());
        Ok(())
    }

    async fn handle_install(
        &mut self,
        term: u64,
        leader: NodeId,
        snapshot_id: u64,
        snapshot_index: u64,
        offset: u32,
        data: Vec<u8>,
        complete: bool,
    ) -> RaftMessage {
        let install_response = |t: u64, from: NodeId, succeeded: bool, next_offset: u32| {
            RaftMessage::InstallResponse {
                term: t,
                from,
                succeeded,
                next_offset,
            }
        };
        let me = self.config.node_id.clone();

        if term < self.election.term() {
            return install_response(self.election.term(), me, false, 0);
        }

        self.election.record_leader_contact(term, leader);
        self.persist_meta();

        // Already holding this state or newer: report completion so the
        // leader resumes appends
        if self.applier.applied_index() >= snapshot_index {
            return install_response(self.election.term(), me, true, u32::MAX);
        }

        // First chunk of a new transfer
        if self
            .pending_install
            .as_ref()
            .map(|p| p.snapshot_index)
            != Some(snapshot_index)
        {
            if let Err(e) = self.snapshots.delete(snapshot_index) {
                warn!("Server {}: Cannot clear stale snapshot: {}", me, e);
            }
            if let Err(e) =
                self.snapshots
                    .create_with_id(snapshot_id, snapshot_index, unix_timestamp_ms())
            {
                warn!("Server {}: Cannot start snapshot install: {}", me, e);
                return install_response(self.election.term(), me, false, 0);
            }
            self.pending_install = Some(PendingInstall {
                snapshot_index,
                next_offset: 0,
            });
            info!(
                "Server {}: Receiving snapshot install at index {}",
                me, snapshot_index
            );
        }

        let expected = self
            .pending_install
            .as_ref()
            .map(|p| p.next_offset)
            .unwrap_or(0);
        if offset != expected {
            return install_response(self.election.term(), me, false, expected);
        }

        if let Err(e) = self.snapshots.append(snapshot_index, &data) {
            self.note_storage_failure(e);
            return install_response(self.election.term(), me, false, expected);
        }
        let next_offset = expected + data.len() as u32;
        if let Some(pending) = self.pending_install.as_mut() {
            pending.next_offset = next_offset;
        }

        if complete {
            self.pending_install = None;
            if let Err(e) = self.snapshots.complete(snapshot_index) {
                self.note_storage_failure(e);
                return install_response(self.election.term(), me, false, next_offset);
            }
            let image = match self.snapshots.read(snapshot_index) {
                Ok(image) => image,
                Err(e) => {
                    self.note_storage_failure(e);
                    return install_response(self.election.term(), me, false, next_offset);
                }
            };
            match self.applier.restore_image(snapshot_index, &image) {
                Ok(restored) => {
                    if let Err(e) = self.log.reset(snapshot_index, restored.last_term) {
                        self.note_storage_failure(e);
                        return install_response(self.election.term(), me, false, next_offset);
                    }
                    self.cluster.install(restored.configuration);
                    self.election.apply_membership(self.cluster.local_type());
                    self.election
                        .update_log_state(self.log.last_index(), self.log.last_term());
                    self.last_snapshot_index = snapshot_index;
                    self.persist_meta();
                    info!(
                        "Server {}: Installed snapshot at index {}",
                        me, snapshot_index
                    );
                }
                Err(e) => {
                    error!("Server {}: Snapshot restore failed: {}", me, e);
                    self.failed = true;
                    return install_response(self.election.term(), me, false, next_offset);
                }
            }
        }

        install_response(self.election.term(), me, true, next_offset)
    }

    async fn handle_request(&mut self, id: String, request: ClientRequest, src: SocketAddr) {
        if self.failed {
            self.reply_error(id, src, &RaftError::Unavailable).await;
            return;
        }

        match request {
            ClientRequest::Metadata => {
                let response = ClientResponse::MetadataResult {
                    leader: self.election.leader().cloned(),
                    term: self.election.term(),
                    commit_index: self.log.commit_index(),
                    applied_index: self.applier.applied_index(),
                    members: self.cluster.members().to_vec(),
                };
                self.send_response(id, response, src).await;
            }

            ClientRequest::Query {
                session,
                sequence: _,
                last_index,
                operation,
                consistency,
            } => {
                self.session_addrs.insert(session, src);
                self.handle_query(id, last_index, operation, consistency, src)
                    .await;
            }

            ClientRequest::OpenSession { client, timeout_ms } => {
                let timeout_ms = if timeout_ms == 0 {
                    self.config.default_session_timeout_ms
                } else {
                    timeout_ms
                };
                self.leader_append(EntryKind::OpenSession { client, timeout_ms }, id, src)
                    .await;
            }

            ClientRequest::CloseSession { session } => {
                self.leader_append(EntryKind::CloseSession { session }, id, src)
                    .await;
            }

            ClientRequest::KeepAlive {
                session,
                command_sequence,
                event_index,
            } => {
                self.session_addrs.insert(session, src);
                self.leader_append(
                    EntryKind::KeepAlive {
                        session,
                        command_sequence,
                        event_index,
                    },
                    id,
                    src,
                )
                .await;
            }

            ClientRequest::Command {
                session,
                sequence,
                operation,
            } => {
                if !self.election.is_leader() {
                    self.reply_error(
                        id,
                        src,
                        &RaftError::NotLeader {
                            leader: self.election.leader().cloned(),
                        },
                    )
                    .await;
                    return;
                }
                self.session_addrs.insert(session, src);

                // Network retries of an applied command answer from the cache
                // without touching the log
                use crate::session::CommandCheck;
                match self.applier.sessions().check_command(session, sequence) {
                    CommandCheck::Duplicate(cached) => {
                        let response = command_response(&cached);
                        self.send_response(id, response, src).await;
                    }
                    CommandCheck::Rejected(kind) => {
                        let response = ClientResponse::Error {
                            error: WireError::new(
                                kind,
                                format!("session {session} cannot accept commands"),
                            ),
                        };
                        self.send_response(id, response, src).await;
                    }
                    CommandCheck::Apply => {
                        self.leader_append(
                            EntryKind::Command {
                                session,
                                sequence,
                                operation,
                            },
                            id,
                            src,
                        )
                        .await;
                    }
                }
            }

            ClientRequest::Join { member } => {
                let proposal = self.cluster.propose_join(&member);
                self.handle_configuration_change(id, proposal, src).await;
            }

            ClientRequest::Leave { node } => {
                let proposal = self.cluster.propose_leave(&node);
                self.handle_configuration_change(id, proposal, src).await;
            }

            ClientRequest::Reconfigure { node, member_type } => {
                let proposal = self.cluster.propose_reconfigure(&node, member_type);
                self.handle_configuration_change(id, proposal, src).await;
            }
        }
    }

    async fn handle_query(
        &mut self,
        id: String,
        last_index: u64,
        operation: Vec<u8>,
        consistency: Consistency,
        src: SocketAddr,
    ) {
        match consistency {
            // Any server, possibly stale
            Consistency::Eventual => {
                let response = query_response(self.applier.applied_index(), self.applier.query(&operation));
                self.send_response(id, response, src).await;
            }

            // Leader-only, against applied state, no earlier than the
            // client's last observed index
            Consistency::Sequential => {
                if !self.election.is_leader() {
                    self.reply_error(
                        id,
                        src,
                        &RaftError::NotLeader {
                            leader: self.election.leader().cloned(),
                        },
                    )
                    .await;
                    return;
                }
                if self.applier.applied_index() >= last_index {
                    let response =
                        query_response(self.applier.applied_index(), self.applier.query(&operation));
                    self.send_response(id, response, src).await;
                } else {
                    self.pending_queries.push(PendingQuery {
                        wait_index: last_index,
                        addr: src,
                        id,
                        operation,
                    });
                }
            }

            // Leader-only, sequenced through the log
            Consistency::Linearizable => {
                self.leader_append(
                    EntryKind::Query {
                        session: 0,
                        operation,
                    },
                    id,
                    src,
                )
                .await;
            }
        }
    }

    async fn handle_configuration_change(
        &mut self,
        id: String,
        proposal: Result<Vec<Member>, RaftError>,
        src: SocketAddr,
    ) {
        if !self.election.is_leader() {
            self.reply_error(
                id,
                src,
                &RaftError::NotLeader {
                    leader: self.election.leader().cloned(),
                },
            )
            .await;
            return;
        }

        let members = match proposal {
            Ok(members) => members,
            Err(e) => {
                self.reply_error(id, src, &e).await;
                return;
            }
        };

        // No change needed: answer from the current configuration
        if members == self.cluster.members() {
            let response = ClientResponse::ConfigurationResult {
                index: self.cluster.configuration().index,
                members,
            };
            self.send_response(id, response, src).await;
            return;
        }

        let term = self.election.term();
        let entry = match self.log.append(
            term,
            unix_timestamp_ms(),
            EntryKind::Configuration {
                members: members.clone(),
            },
        ) {
            Ok(entry) => entry,
            Err(e) => {
                self.note_storage_failure(e);
                self.reply_error(id, src, &RaftError::Unavailable).await;
                return;
            }
        };
        self.election.update_log_state(entry.index, term);

        // Effective immediately on append
        self.cluster.record_appended(entry.index, members);
        self.election.apply_membership(self.cluster.local_type());
        let peer_ids: Vec<NodeId> = self.cluster.members().iter().map(|m| m.id.clone()).collect();
        if let Some(repl) = self.replication.as_mut() {
            repl.sync_membership(&peer_ids, entry.index);
        }

        self.pending_replies
            .insert(entry.index, PendingReply { addr: src, id });
        self.advance_commit().await;
        self.replicate_round().await;
    }

    /// Append an entry as leader and park the client reply on its index
    async fn leader_append(&mut self, kind: EntryKind, id: String, src: SocketAddr) {
        if !self.election.is_leader() {
            self.reply_error(
                id,
                src,
                &RaftError::NotLeader {
                    leader: self.election.leader().cloned(),
                },
            )
            .await;
            return;
        }

        let term = self.election.term();
        match self.log.append(term, unix_timestamp_ms(), kind) {
            Ok(entry) => {
                self.election.update_log_state(entry.index, term);
                self.pending_replies
                    .insert(entry.index, PendingReply { addr: src, id });
                self.advance_commit().await;
                self.replicate_round().await;
            }
            Err(e) => {
                self.note_storage_failure(e);
                self.reply_error(id, src, &RaftError::Unavailable).await;
            }
        }
    }

    async fn on_elected(&mut self) {
        self.persist_meta();
        let term = self.election.term();
        let peers: Vec<NodeId> = self.cluster.members().iter().map(|m| m.id.clone()).collect();
        self.replication = Some(LeaderReplication::new(
            self.config.node_id.clone(),
            &peers,
            self.log.last_index(),
        ));

        // The no-op lets entries from prior terms commit under this term
        match self.log.append(term, unix_timestamp_ms(), EntryKind::Initialize) {
            Ok(entry) => {
                self.election.update_log_state(entry.index, term);
                info!(
                    "Server {}: Leading term {} from index {}",
                    self.config.node_id, term, entry.index
                );
            }
            Err(e) => {
                self.note_storage_failure(e);
                return;
            }
        }

        self.advance_commit().await;
        self.replicate_round().await;
    }

    /// Fail every parked client reply so proxies retry elsewhere
    async fn on_step_down(&mut self) {
        self.replication = None;

        let replies: Vec<PendingReply> = self.pending_replies.drain().map(|(_, v)| v).collect();
        for reply in replies {
            self.reply_error(reply.id, reply.addr, &RaftError::Unavailable)
                .await;
        }
        let queries = std::mem::take(&mut self.pending_queries);
        for query in queries {
            self.reply_error(query.id, query.addr, &RaftError::Unavailable)
                .await;
        }
    }

    /// Send one replication round to every replicating member
    async fn replicate_round(&mut self) {
        let term = self.election.term();
        let targets: Vec<Member> = self
            .cluster
            .replication_targets()
            .into_iter()
            .cloned()
            .collect();

        let mut outbound = Vec::new();
        if let Some(repl) = self.replication.as_mut() {
            for member in &targets {
                if let Some(msg) = repl.build_message(&member.id, &self.log, &self.snapshots, term) {
                    outbound.push((msg, member.address));
                }
            }
        }
        for (msg, addr) in outbound {
            let _ = self
                .transport
                .send(&Message::Raft { message: msg }, addr)
                .await;
        }
    }

    async fn replicate_to(&mut self, follower: &NodeId) {
        let term = self.election.term();
        let addr = match self.cluster.member(follower) {
            Some(m) => m.address,
            None => return,
        };
        let msg = match self.replication.as_mut() {
            Some(repl) => repl.build_message(follower, &self.log, &self.snapshots, term),
            None => return,
        };
        if let Some(msg) = msg {
            let _ = self
                .transport
                .send(&Message::Raft { message: msg }, addr)
                .await;
        }
    }

    /// Advance the commit index through quorum-replicated current-term
    /// entries, then apply
    async fn advance_commit(&mut self) {
        if !self.election.is_leader() {
            return;
        }
        let voting: Vec<NodeId> = self
            .cluster
            .voting_members()
            .iter()
            .map(|m| m.id.clone())
            .collect();
        let quorum = self.cluster.quorum_size();
        let candidate = match self.replication.as_ref() {
            Some(repl) => repl.quorum_match_index(&voting, self.log.last_index(), quorum),
            None => return,
        };

        let term = self.election.term();
        let mut target = self.log.commit_index();
        let mut n = self.log.commit_index() + 1;
        while n <= candidate {
            if self.log.term(n) == Some(term) {
                // Entries from prior terms commit implicitly below this one
                target = n;
            }
            n += 1;
        }

        if target > self.log.commit_index() {
            self.log.commit(target);
            self.apply_committed().await;
        }
    }

    /// Apply committed entries in index order
    async fn apply_committed(&mut self) {
        while self.applier.applied_index() < self.log.commit_index() {
            let next = self.applier.applied_index() + 1;
            let entry = match self.log.get(next) {
                Some(e) => e.clone(),
                None => break,
            };
            let result = self.applier.apply(&entry);
            self.post_apply(entry, result).await;
        }
        self.drain_pending_queries().await;
        self.maybe_snapshot().await;
    }

    async fn post_apply(&mut self, entry: LogEntry, result: ApplyResult) {
        // Configuration entries finalize on commit
        if entry.is_configuration() && self.cluster.commit_to(entry.index) {
            self.persist_meta();
            let was_leader = self.election.is_leader();
            self.election.apply_membership(self.cluster.local_type());
            if was_leader && !self.election.is_leader() {
                // Removed from the voting set by the change we just committed
                info!(
                    "Server {}: Configuration removed local vote, stepping down",
                    self.config.node_id
                );
                self.on_step_down().await;
            } else if let Some(repl) = self.replication.as_mut() {
                let peer_ids: Vec<NodeId> =
                    self.cluster.members().iter().map(|m| m.id.clone()).collect();
                repl.sync_membership(&peer_ids, entry.index);
            }
        }

        // Leader pushes freshly published events to connected clients
        if self.election.is_leader() {
            for push in &result.events {
                if let Some(addr) = self.session_addrs.get(&push.session).copied() {
                    let msg = Message::Response {
                        id: Uuid::new_v4().to_string(),
                        response: ClientResponse::Event {
                            session: push.session,
                            event_index: push.event_index,
                            payload: push.payload.clone(),
                        },
                    };
                    let _ = self.transport.send(&msg, addr).await;
                }
            }
        }

        for expired in &result.expired {
            self.session_addrs.remove(expired);
        }

        // A keep-alive replays whatever the session still has pending, so a
        // reconnecting client recovers events lost to a leader change
        if let Applied::KeepAlive {
            session,
            error: None,
        } = &result.outcome
        {
            if self.election.is_leader() {
                let pending: Vec<crate::session::PublishedEvent> = self
                    .applier
                    .sessions()
                    .get(*session)
                    .map(|s| s.events_after(0))
                    .unwrap_or_default();
                if let Some(addr) = self.session_addrs.get(session).copied() {
                    for event in pending {
                        let msg = Message::Response {
                            id: Uuid::new_v4().to_string(),
                            response: ClientResponse::Event {
                                session: *session,
                                event_index: event.index,
                                payload: event.payload,
                            },
                        };
                        let _ = self.transport.send(&msg, addr).await;
                    }
                }
            }
        }

        if let Some(reply) = self.pending_replies.remove(&entry.index) {
            let response = self.response_for(&result);
            self.send_response(reply.id, response, reply.addr).await;
        }
    }

    /// Build the client reply for an applied entry
    fn response_for(&self, result: &ApplyResult) -> ClientResponse {
        match &result.outcome {
            Applied::SessionOpened {
                session,
                timeout_ms,
            } => ClientResponse::SessionOpened {
                session: *session,
                timeout_ms: *timeout_ms,
                leader: self.config.node_id.clone(),
                members: self.cluster.members().to_vec(),
            },

            Applied::SessionClosed { session, error } => match error {
                None => ClientResponse::SessionClosed { session: *session },
                Some(kind) => ClientResponse::Error {
                    error: WireError::new(*kind, format!("session {session} not open")),
                },
            },

            Applied::KeepAlive { session, error } => match error {
                None => ClientResponse::KeepAliveAck {
                    leader: self.election.leader().cloned(),
                    members: self.cluster.members().to_vec(),
                },
                Some(kind) => ClientResponse::Error {
                    error: WireError::new(*kind, format!("session {session} not open")),
                },
            },

            Applied::Command { response, .. } => command_response(response),

            Applied::Query { result, .. } => match result {
                Ok(bytes) => ClientResponse::QueryResult {
                    index: self.applier.applied_index(),
                    result: bytes.clone(),
                },
                Err((kind, message)) => ClientResponse::Error {
                    error: WireError::new(*kind, message.clone()),
                },
            },

            Applied::Configuration => ClientResponse::ConfigurationResult {
                index: self.cluster.committed_configuration().index,
                members: self.cluster.committed_configuration().members.clone(),
            },

            Applied::None => ClientResponse::Error {
                error: WireError::new(ErrorKind::Protocol, "entry produced no response"),
            },
        }
    }

    async fn drain_pending_queries(&mut self) {
        let applied = self.applier.applied_index();
        let (ready, waiting): (Vec<PendingQuery>, Vec<PendingQuery>) =
            std::mem::take(&mut self.pending_queries)
                .into_iter()
                .partition(|q| q.wait_index <= applied);
        self.pending_queries = waiting;

        for query in ready {
            let response = query_response(applied, self.applier.query(&query.operation));
            self.send_response(query.id, response, query.addr).await;
        }
    }

    /// Checkpoint applied state and discard covered log segments
    async fn maybe_snapshot(&mut self) {
        let applied = self.applier.applied_index();
        if applied < self.last_snapshot_index + self.config.compaction_threshold {
            return;
        }
        if applied <= self.log.compacted_index() {
            return;
        }
        let last_term = match self.log.term(applied) {
            Some(t) => t,
            None => return,
        };

        let configuration = self.cluster.committed_configuration().clone();
        let image = match self.applier.snapshot_image(last_term, configuration) {
            Ok(image) => image,
            Err(e) => {
                warn!("Server {}: Snapshot capture failed: {}", self.config.node_id, e);
                return;
            }
        };

        let stored = (|| {
            self.snapshots.create(applied, unix_timestamp_ms())?;
            self.snapshots.append(applied, &image)?;
            self.snapshots.complete(applied)
        })();
        if let Err(e) = stored {
            warn!("Server {}: Snapshot store failed: {}", self.config.node_id, e);
            let _ = self.snapshots.delete(applied);
            return;
        }

        self.last_snapshot_index = applied;
        info!(
            "Server {}: Snapshot taken at index {} ({} bytes)",
            self.config.node_id,
            applied,
            image.len()
        );

        if let Err(e) = self.log.compact(applied) {
            self.note_storage_failure(e);
        }
    }

    fn persist_meta(&mut self) {
        let meta = ServerMeta {
            current_term: self.election.term(),
            voted_for: self.election.voted_for().cloned(),
            last_config_index: self.cluster.committed_configuration().index,
        };
        if let Err(e) = self.meta.save(meta) {
            self.note_storage_failure(e);
        }
    }

    fn note_storage_failure(&mut self, e: impl std::fmt::Display) {
        error!(
            "Server {}: Fatal storage failure: {}",
            self.config.node_id, e
        );
        self.failed = true;
    }

    async fn send_raft(&self, msg: RaftMessage, addr: SocketAddr) {
        let _ = self
            .transport
            .send(&Message::Raft { message: msg }, addr)
            .await;
    }

    async fn send_response(&self, id: String, response: ClientResponse, addr: SocketAddr) {
        let _ = self
            .transport
            .send(&Message::Response { id, response }, addr)
            .await;
    }

    async fn reply_error(&self, id: String, addr: SocketAddr, err: &RaftError) {
        self.send_response(
            id,
            ClientResponse::Error {
                error: err.to_wire(),
            },
            addr,
        )
        .await;
    }

    async fn broadcast_to_voters(&self, msg: RaftMessage) {
        let addrs: Vec<SocketAddr> = self
            .cluster
            .voting_members()
            .iter()
            .filter(|m| m.id != self.config.node_id)
            .map(|m| m.address)
            .collect();
        self.transport
            .broadcast(&Message::Raft { message: msg }, &addrs)
            .await;
    }
}

/// Render a cached command response as a wire reply
fn command_response(cached: &crate::session::CachedResponse) -> ClientResponse {
    use crate::session::CommandOutcome;
    match &cached.outcome {
        CommandOutcome::Ok(result) => ClientResponse::CommandResult {
            index: cached.index,
            event_index: cached.event_index,
            result: result.clone(),
        },
        CommandOutcome::Error { kind, message } => ClientResponse::Error {
            error: WireError::new(*kind, message.clone()),
        },
    }
}

fn query_response(index: u64, result: Result<Vec<u8>, (ErrorKind, String)>) -> ClientResponse {
    match result {
        Ok(bytes) => ClientResponse::QueryResult {
            index,
            result: bytes,
        },
        Err((kind, message)) => ClientResponse::Error {
            error: WireError::new(kind, message),
        },
    }
}
