//! Session client and its driver task.
//!
//! The public [`KeelClient`] hands requests to a driver task that owns the
//! transport, correlates responses by request id, tracks the leader hint and
//! membership, renews the session lease, and dispatches pushed events to
//! listeners in event-index order. Retries live on the caller's side:
//! each attempt is one correlated request; routable failures back off
//! exponentially until the session timeout budget runs out.

use crate::config::{ClientConfig, Strategy};
use keel_core::context::{Scheduled, ThreadContext};
use keel_core::error::ErrorKind;
use keel_core::message::{ClientRequest, ClientResponse, Consistency, Message};
use keel_core::transport::Transport;
use keel_core::types::{Member, NodeId, SessionId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-visible failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no leader could be reached")]
    NoLeader,
    #[error("request timed out")]
    Timeout,
    #[error("session is unknown or expired")]
    UnknownSession,
    #[error("session is closed")]
    ClosedSession,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("state machine error: {0}")]
    Application(String),
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    #[error("client is closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cluster introspection snapshot
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub leader: Option<NodeId>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub members: Vec<Member>,
}

/// Event listener: (event index, payload)
pub type EventListener = Box<dyn Fn(u64, Vec<u8>) + Send>;

enum Waiter {
    Caller(oneshot::Sender<Result<ClientResponse, ClientError>>),
    /// Driver-internal request (keep-alive); handled silently
    Internal,
}

enum DriverCall {
    Send {
        id: String,
        request: ClientRequest,
        reply: oneshot::Sender<Result<ClientResponse, ClientError>>,
    },
    Forget {
        id: String,
    },
    SessionOpened {
        session: SessionId,
        timeout_ms: u64,
    },
    Subscribe(EventListener),
}

/// Keep-alive trigger delivered through the proxy's context
#[derive(Debug, Clone)]
enum ProxyEvent {
    KeepAliveDue,
}

/// Session-oriented client for a keel cluster
pub struct KeelClient {
    config: ClientConfig,
    calls: mpsc::Sender<DriverCall>,
    session: SessionId,
    session_timeout_ms: u64,
    sequence: AtomicU64,
}

impl KeelClient {
    /// Connect and open a session; retries across the configured servers
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let bind: SocketAddr = "0.0.0.0:0".parse().expect("static address parses");
        let (transport, incoming) = Transport::bind(bind).await?;
        let (calls_tx, calls_rx) = mpsc::channel(64);
        let (context, events_rx) = ThreadContext::new("client-proxy", 16);

        let driver = Driver::new(config.clone(), transport, context);
        tokio::spawn(driver.run(calls_rx, incoming, events_rx));

        let mut client = Self {
            config: config.clone(),
            calls: calls_tx,
            session: 0,
            session_timeout_ms: config.session_timeout_ms,
            sequence: AtomicU64::new(0),
        };

        let response = client
            .request_with_retry(ClientRequest::OpenSession {
                client: config.client_id.clone(),
                timeout_ms: config.session_timeout_ms,
            })
            .await?;

        match response {
            ClientResponse::SessionOpened {
                session,
                timeout_ms,
                leader,
                ..
            } => {
                info!(
                    "Client {}: Session {} opened via {} (timeout {}ms)",
                    config.client_id, session, leader, timeout_ms
                );
                client.session = session;
                client.session_timeout_ms = timeout_ms;
                let _ = client
                    .calls
                    .send(DriverCall::SessionOpened {
                        session,
                        timeout_ms,
                    })
                    .await;
                Ok(client)
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected open-session response: {other:?}"
            ))),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Submit a command for linearizable, exactly-once application
    pub async fn submit(&self, operation: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let request = ClientRequest::Command {
            session: self.session,
            sequence,
            operation,
        };
        match self.request_with_retry(request).await? {
            ClientResponse::CommandResult { result, .. } => Ok(result),
            other => Err(ClientError::Protocol(format!(
                "unexpected command response: {other:?}"
            ))),
        }
    }

    /// Run a read-only query at the requested consistency level
    pub async fn query(
        &self,
        operation: Vec<u8>,
        consistency: Consistency,
    ) -> Result<Vec<u8>, ClientError> {
        let request = ClientRequest::Query {
            session: self.session,
            sequence: self.sequence.load(Ordering::SeqCst),
            last_index: 0, // patched by the driver from observed indexes
            operation,
            consistency,
        };
        match self.request_with_retry(request).await? {
            ClientResponse::QueryResult { result, .. } => Ok(result),
            other => Err(ClientError::Protocol(format!(
                "unexpected query response: {other:?}"
            ))),
        }
    }

    /// Register a listener for events published to this session
    pub async fn on_event<F>(&self, listener: F) -> Result<(), ClientError>
    where
        F: Fn(u64, Vec<u8>) + Send + 'static,
    {
        self.calls
            .send(DriverCall::Subscribe(Box::new(listener)))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Leader, term and membership as seen by whichever server answers
    pub async fn metadata(&self) -> Result<ClusterInfo, ClientError> {
        match self.request_with_retry(ClientRequest::Metadata).await? {
            ClientResponse::MetadataResult {
                leader,
                term,
                commit_index,
                applied_index,
                members,
            } => Ok(ClusterInfo {
                leader,
                term,
                commit_index,
                applied_index,
                members,
            }),
            other => Err(ClientError::Protocol(format!(
                "unexpected metadata response: {other:?}"
            ))),
        }
    }

    /// Add a member; resolves once the configuration commits
    pub async fn join(&self, member: Member) -> Result<Vec<Member>, ClientError> {
        self.configuration_change(ClientRequest::Join { member })
            .await
    }

    /// Remove a member; resolves once the configuration commits
    pub async fn leave(&self, node: NodeId) -> Result<Vec<Member>, ClientError> {
        self.configuration_change(ClientRequest::Leave { node })
            .await
    }

    /// Change a member's participation level
    pub async fn reconfigure(
        &self,
        node: NodeId,
        member_type: keel_core::types::MemberType,
    ) -> Result<Vec<Member>, ClientError> {
        self.configuration_change(ClientRequest::Reconfigure { node, member_type })
            .await
    }

    async fn configuration_change(
        &self,
        request: ClientRequest,
    ) -> Result<Vec<Member>, ClientError> {
        match self.request_with_retry(request).await? {
            ClientResponse::ConfigurationResult { members, .. } => Ok(members),
            other => Err(ClientError::Protocol(format!(
                "unexpected configuration response: {other:?}"
            ))),
        }
    }

    /// Close the session; the server releases its resources on commit
    pub async fn close(self) -> Result<(), ClientError> {
        let request = ClientRequest::CloseSession {
            session: self.session,
        };
        match self.request_with_retry(request).await? {
            ClientResponse::SessionClosed { .. } => Ok(()),
            other => Err(ClientError::Protocol(format!(
                "unexpected close response: {other:?}"
            ))),
        }
    }

    /// One-shot metadata probe of a single server, without a session
    pub async fn metadata_at(addr: SocketAddr) -> Result<ClusterInfo, ClientError> {
        let bind: SocketAddr = "0.0.0.0:0".parse().expect("static address parses");
        let (transport, mut incoming) = Transport::bind(bind).await?;
        let id = Uuid::new_v4().to_string();
        transport
            .send(
                &Message::Request {
                    id: id.clone(),
                    request: ClientRequest::Metadata,
                },
                addr,
            )
            .await?;

        let deadline = Duration::from_millis(500);
        loop {
            let (msg, _src) = tokio::time::timeout(deadline, incoming.recv())
                .await
                .map_err(|_| ClientError::Timeout)?
                .ok_or(ClientError::Closed)?;
            if let Message::Response {
                id: got,
                response:
                    ClientResponse::MetadataResult {
                        leader,
                        term,
                        commit_index,
                        applied_index,
                        members,
                    },
            } = msg
            {
                if got == id {
                    return Ok(ClusterInfo {
                        leader,
                        term,
                        commit_index,
                        applied_index,
                        members,
                    });
                }
            }
        }
    }

    /// Issue one correlated attempt through the driver
    async fn request_once(&self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls
            .send(DriverCall::Send {
                id: id.clone(),
                request,
                reply: tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                let _ = self.calls.send(DriverCall::Forget { id }).await;
                Err(ClientError::Timeout)
            }
        }
    }

    /// Retry routable failures with exponential backoff capped at the
    /// session timeout
    async fn request_with_retry(
        &self,
        request: ClientRequest,
    ) -> Result<ClientResponse, ClientError> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.session_timeout_ms);
        let mut backoff = self.config.backoff_initial;

        loop {
            match self.request_once(request.clone()).await {
                Ok(ClientResponse::Error { error }) => {
                    if !error.kind.is_retryable() {
                        return Err(terminal_error(error.kind, error.message));
                    }
                    debug!("Client: Retryable failure: {}", error);
                }
                Ok(response) => return Ok(response),
                Err(ClientError::Timeout) => {
                    debug!("Client: Attempt timed out, retrying");
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() + backoff >= budget {
                return Err(ClientError::NoLeader);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.backoff_max);
        }
    }
}

fn terminal_error(kind: ErrorKind, message: String) -> ClientError {
    match kind {
        ErrorKind::UnknownSession => ClientError::UnknownSession,
        ErrorKind::ClosedSession => ClientError::ClosedSession,
        ErrorKind::Application | ErrorKind::UnknownCommand => ClientError::Application(message),
        ErrorKind::Protocol | ErrorKind::IllegalMember => ClientError::Protocol(message),
        // Retryable kinds reach here only when the budget ran out
        _ => ClientError::Unavailable(message),
    }
}

/// Driver task owning the transport and all session bookkeeping
struct Driver {
    config: ClientConfig,
    transport: Transport,
    context: ThreadContext<ProxyEvent>,
    pending: HashMap<String, Waiter>,
    /// Outstanding command sequences by request id, for acknowledgement
    command_sequences: HashMap<String, u64>,
    leader: Option<NodeId>,
    members: Vec<Member>,
    server_cursor: usize,
    session: Option<SessionId>,
    keep_alive: Option<Scheduled>,
    /// Highest command sequence whose response arrived
    acked_sequence: u64,
    /// Last event index delivered in order
    event_index: u64,
    event_buffer: BTreeMap<u64, Vec<u8>>,
    listeners: Vec<EventListener>,
    /// Highest log index observed in responses
    last_index: u64,
    session_lost: bool,
}

impl Driver {
    fn new(config: ClientConfig, transport: Transport, context: ThreadContext<ProxyEvent>) -> Self {
        Self {
            config,
            transport,
            context,
            pending: HashMap::new(),
            command_sequences: HashMap::new(),
            leader: None,
            members: Vec::new(),
            server_cursor: 0,
            session: None,
            keep_alive: None,
            acked_sequence: 0,
            event_index: 0,
            event_buffer: BTreeMap::new(),
            listeners: Vec::new(),
            last_index: 0,
            session_lost: false,
        }
    }

    async fn run(
        mut self,
        mut calls: mpsc::Receiver<DriverCall>,
        mut incoming: mpsc::Receiver<(Message, SocketAddr)>,
        mut events: mpsc::Receiver<ProxyEvent>,
    ) {
        loop {
            tokio::select! {
                call = calls.recv() => match call {
                    Some(call) => self.handle_call(call).await,
                    None => break,
                },
                Some((msg, _src)) = incoming.recv() => self.handle_incoming(msg).await,
                Some(event) = events.recv() => match event {
                    ProxyEvent::KeepAliveDue => self.send_keep_alive().await,
                },
            }
        }
        debug!("Client driver: Shutting down");
    }

    async fn handle_call(&mut self, call: DriverCall) {
        match call {
            DriverCall::Send { id, request, reply } => {
                let request = self.prepare(request);
                let addr = match self.route(&request) {
                    Some(addr) => addr,
                    None => {
                        let _ = reply.send(Err(ClientError::NoLeader));
                        return;
                    }
                };
                if let ClientRequest::Command { sequence, .. } = &request {
                    self.command_sequences.insert(id.clone(), *sequence);
                }
                self.pending.insert(id.clone(), Waiter::Caller(reply));
                let _ = self
                    .transport
                    .send(&Message::Request { id, request }, addr)
                    .await;
            }

            DriverCall::Forget { id } => {
                self.pending.remove(&id);
                self.command_sequences.remove(&id);
            }

            DriverCall::SessionOpened {
                session,
                timeout_ms,
            } => {
                self.session = Some(session);
                self.session_lost = false;
                // Lease renewal at a quarter of the timeout
                let interval = Duration::from_millis((timeout_ms / 4).max(50));
                self.keep_alive =
                    Some(self.context.schedule_repeating(interval, ProxyEvent::KeepAliveDue));
            }

            DriverCall::Subscribe(listener) => {
                self.listeners.push(listener);
            }
        }
    }

    /// Fill in driver-tracked fields before a request leaves
    fn prepare(&self, request: ClientRequest) -> ClientRequest {
        match request {
            ClientRequest::Query {
                session,
                sequence,
                last_index,
                operation,
                consistency,
            } => ClientRequest::Query {
                session,
                sequence,
                last_index: last_index.max(self.last_index),
                operation,
                consistency,
            },
            other => other,
        }
    }

    fn known_addresses(&self) -> Vec<SocketAddr> {
        if self.members.is_empty() {
            self.config.servers.clone()
        } else {
            self.members.iter().map(|m| m.address).collect()
        }
    }

    fn leader_address(&self) -> Option<SocketAddr> {
        let leader = self.leader.as_ref()?;
        self.members
            .iter()
            .find(|m| &m.id == leader)
            .map(|m| m.address)
    }

    /// Choose a target server for a request
    fn route(&mut self, request: &ClientRequest) -> Option<SocketAddr> {
        let eventual = matches!(
            request,
            ClientRequest::Query {
                consistency: Consistency::Eventual,
                ..
            }
        );

        if eventual {
            match self.config.strategy {
                Strategy::FollowersFirst => {
                    let follower = self
                        .members
                        .iter()
                        .find(|m| Some(&m.id) != self.leader.as_ref())
                        .map(|m| m.address);
                    if follower.is_some() {
                        return follower;
                    }
                }
                Strategy::Any => return self.rotate(),
                Strategy::LeaderOnly => {}
            }
        }

        // Leader-bound traffic: the hint first, otherwise probe around
        self.leader_address().or_else(|| self.rotate())
    }

    fn rotate(&mut self) -> Option<SocketAddr> {
        let addrs = self.known_addresses();
        if addrs.is_empty() {
            return None;
        }
        let addr = addrs[self.server_cursor % addrs.len()];
        self.server_cursor = self.server_cursor.wrapping_add(1);
        Some(addr)
    }

    async fn send_keep_alive(&mut self) {
        let session = match self.session {
            Some(s) if !self.session_lost => s,
            _ => return,
        };
        let addr = match self.leader_address().or_else(|| self.rotate()) {
            Some(a) => a,
            None => return,
        };

        let id = Uuid::new_v4().to_string();
        self.pending.insert(id.clone(), Waiter::Internal);
        let request = ClientRequest::KeepAlive {
            session,
            command_sequence: self.acked_sequence,
            event_index: self.event_index,
        };
        let _ = self
            .transport
            .send(&Message::Request { id, request }, addr)
            .await;
    }

    async fn handle_incoming(&mut self, msg: Message) {
        let (id, response) = match msg {
            Message::Response { id, response } => (id, response),
            // Clients only consume responses
            _ => return,
        };

        // Server-initiated event pushes are not correlated to a request
        if let ClientResponse::Event {
            event_index,
            payload,
            ..
        } = response
        {
            self.accept_event(event_index, payload);
            return;
        }

        self.note_hints(&response);

        let waiter = match self.pending.remove(&id) {
            Some(w) => w,
            None => return, // late response after timeout; discard
        };

        if let ClientResponse::CommandResult { .. } = &response {
            if let Some(sequence) = self.command_sequences.remove(&id) {
                self.acked_sequence = self.acked_sequence.max(sequence);
            }
        } else {
            self.command_sequences.remove(&id);
        }

        match waiter {
            Waiter::Caller(tx) => {
                let _ = tx.send(Ok(response));
            }
            Waiter::Internal => {
                if let ClientResponse::Error { error } = &response {
                    if error.kind == ErrorKind::UnknownSession
                        || error.kind == ErrorKind::ClosedSession
                    {
                        warn!("Client: Session lost: {}", error);
                        self.session_lost = true;
                        self.keep_alive = None;
                    }
                }
            }
        }
    }

    /// Track leader, membership and index hints from any response
    fn note_hints(&mut self, response: &ClientResponse) {
        match response {
            ClientResponse::SessionOpened {
                leader, members, ..
            } => {
                self.leader = Some(leader.clone());
                self.members = members.clone();
            }
            ClientResponse::KeepAliveAck { leader, members } => {
                self.leader = leader.clone();
                self.members = members.clone();
            }
            ClientResponse::MetadataResult {
                leader, members, ..
            } => {
                self.leader = leader.clone();
                self.members = members.clone();
            }
            ClientResponse::ConfigurationResult { members, .. } => {
                self.members = members.clone();
            }
            ClientResponse::CommandResult { index, .. } => {
                self.last_index = self.last_index.max(*index);
            }
            ClientResponse::QueryResult { index, .. } => {
                self.last_index = self.last_index.max(*index);
            }
            ClientResponse::Error { error } => {
                if let Some(leader) = &error.leader {
                    self.leader = Some(leader.clone());
                }
            }
            _ => {}
        }
    }

    /// Deliver events to listeners in index order, tolerating replays and
    /// reordering
    fn accept_event(&mut self, event_index: u64, payload: Vec<u8>) {
        if event_index <= self.event_index {
            return; // replay of an already-delivered event
        }
        self.event_buffer.insert(event_index, payload);
        while let Some(payload) = self.event_buffer.remove(&(self.event_index + 1)) {
            self.event_index += 1;
            for listener in &self.listeners {
                listener(self.event_index, payload.clone());
            }
        }
    }
}
