//! In-process multi-node cluster for end-to-end tests.
//!
//! Starts real servers on loopback UDP ports with tempdir-backed storage,
//! so the full stack runs: elections, replication, snapshot installs,
//! session expiry. Nodes can be stopped (process-kill semantics via task
//! abort) and restarted against the same storage directory.

use crate::kv::KvMachine;
use keel_client::{ClientConfig, ClusterInfo, KeelClient};
use keel_core::message::{ClientRequest, ClientResponse, Message};
use keel_core::server::{RaftServer, ServerConfig};
use keel_core::transport::Transport;
use keel_core::types::{Member, MemberType, NodeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Reserve a free loopback UDP port
fn free_udp_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    let addr = socket.local_addr().expect("probe socket has an address");
    drop(socket);
    addr
}

/// One server in the test cluster
pub struct TestNode {
    pub id: NodeId,
    pub address: SocketAddr,
    /// Storage survives restarts within a test
    data_dir: TempDir,
    handle: Option<JoinHandle<()>>,
}

impl TestNode {
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

/// A cluster of in-process keel servers
pub struct TestCluster {
    members: Vec<Member>,
    nodes: HashMap<NodeId, TestNode>,
    compaction_threshold: u64,
    segment_entries: u64,
}

impl TestCluster {
    /// Start `n` active nodes with production-like compaction settings
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, 1024, 64).await
    }

    /// Start `n` active nodes with explicit compaction knobs (small values
    /// force snapshot installs quickly)
    pub async fn start_with(n: usize, compaction_threshold: u64, segment_entries: u64) -> Self {
        init_tracing();

        let members: Vec<Member> = (1..=n)
            .map(|i| Member::new(format!("n{i}"), free_udp_addr(), MemberType::Active))
            .collect();

        let mut cluster = Self {
            members: members.clone(),
            nodes: HashMap::new(),
            compaction_threshold,
            segment_entries,
        };

        for member in members {
            cluster.add_stopped(member.clone());
            cluster.start_node(&member.id).await;
        }
        cluster
    }

    fn add_stopped(&mut self, member: Member) {
        let node = TestNode {
            id: member.id.clone(),
            address: member.address,
            data_dir: tempfile::tempdir().expect("create node tempdir"),
            handle: None,
        };
        self.nodes.insert(member.id, node);
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|m| m.address).collect()
    }

    pub fn address_of(&self, id: &str) -> Option<SocketAddr> {
        self.nodes.get(id).map(|n| n.address)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn running_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_running())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Start (or restart) a node against its existing storage
    pub async fn start_node(&mut self, id: &str) {
        let (address, data_dir) = {
            let node = self.nodes.get(id).expect("unknown node");
            (node.address, node.data_dir.path().to_path_buf())
        };
        // Joiners bootstrap from the base members and stay inactive until
        // their configuration entry arrives through the log
        let bootstrap = self.members.clone();

        let config = ServerConfig::new(id, address, data_dir, bootstrap)
            .with_compaction_threshold(self.compaction_threshold)
            .with_segment_entries(self.segment_entries)
            .without_fsync();

        // The port lingers briefly after a kill while the old socket drops
        let deadline = Instant::now() + Duration::from_secs(5);
        let server = loop {
            match RaftServer::new(config.clone(), Box::new(KvMachine::new())).await {
                Ok(server) => break server,
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!("Cluster: Bind retry for {}: {}", id, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("cannot start node {id}: {e}"),
            }
        };

        info!("Cluster: Started node {} at {}", id, address);
        let handle = tokio::spawn(server.run());
        if let Some(node) = self.nodes.get_mut(id) {
            node.handle = Some(handle);
        }
    }

    /// Kill a node without touching its storage
    pub async fn stop_node(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            if let Some(handle) = node.handle.take() {
                handle.abort();
                let _ = handle.await;
                info!("Cluster: Stopped node {}", id);
            }
        }
        // Give the socket a moment to close so restarts can rebind
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Register and start an extra node that is not yet in the
    /// configuration; membership is granted through a join request
    pub async fn add_node(&mut self, id: &str) -> Member {
        let member = Member::new(id, free_udp_addr(), MemberType::Active);
        let node = TestNode {
            id: member.id.clone(),
            address: member.address,
            data_dir: tempfile::tempdir().expect("create node tempdir"),
            handle: None,
        };
        self.nodes.insert(member.id.clone(), node);
        // Not appended to self.members: the joiner bootstraps from the
        // existing cluster and is inactive until the join commits
        self.start_node(id).await;
        member
    }

    /// Open a session against the cluster
    pub async fn client(&self) -> KeelClient {
        KeelClient::connect(ClientConfig::new(self.addresses()))
            .await
            .expect("client connects")
    }

    pub async fn client_with_timeout(&self, session_timeout_ms: u64) -> KeelClient {
        KeelClient::connect(
            ClientConfig::new(self.addresses()).with_session_timeout(session_timeout_ms),
        )
        .await
        .expect("client connects")
    }

    /// Wait until a running node reports a running leader; returns the
    /// leader and its term
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<(NodeId, u64)> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for id in self.running_nodes() {
                let addr = self.address_of(&id).expect("running node has address");
                if let Ok(info) = KeelClient::metadata_at(addr).await {
                    if let Some(leader) = info.leader {
                        if self
                            .nodes
                            .get(&leader)
                            .map(|n| n.is_running())
                            .unwrap_or(false)
                        {
                            return Some((leader, info.term));
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Find and kill the current leader; returns its id
    pub async fn kill_leader(&mut self, timeout: Duration) -> Option<NodeId> {
        let (leader, _) = self.wait_for_leader(timeout).await?;
        self.stop_node(&leader).await;
        Some(leader)
    }

    /// Metadata as reported by one node
    pub async fn metadata_of(&self, id: &str) -> Option<ClusterInfo> {
        let addr = self.address_of(id)?;
        KeelClient::metadata_at(addr).await.ok()
    }

    /// Wait until a node's applied index reaches `index`
    pub async fn wait_for_applied(&self, id: &str, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(info) = self.metadata_of(id).await {
                if info.applied_index >= index {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

/// Fire one raw client request at a server and await its correlated reply.
/// Lets tests drive the wire protocol directly (duplicate deliveries,
/// session-less probes) below the proxy's retry logic.
pub async fn request_at(
    addr: SocketAddr,
    request: ClientRequest,
    timeout: Duration,
) -> Option<ClientResponse> {
    let bind: SocketAddr = "127.0.0.1:0".parse().expect("static address parses");
    let (transport, mut incoming) = Transport::bind(bind).await.ok()?;
    let id = Uuid::new_v4().to_string();
    transport
        .send(
            &Message::Request {
                id: id.clone(),
                request,
            },
            addr,
        )
        .await
        .ok()?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let (msg, _src) = tokio::time::timeout(remaining, incoming.recv())
            .await
            .ok()??;
        if let Message::Response { id: got, response } = msg {
            if got == id {
                return Some(response);
            }
        }
    }
}

/// Run an eventual-consistency query directly against one node
pub async fn query_at(addr: SocketAddr, operation: Vec<u8>) -> Option<Vec<u8>> {
    match request_at(
        addr,
        ClientRequest::Query {
            session: 0,
            sequence: 0,
            last_index: 0,
            operation,
            consistency: keel_core::message::Consistency::Eventual,
        },
        Duration::from_millis(500),
    )
    .await?
    {
        ClientResponse::QueryResult { result, .. } => Some(result),
        _ => None,
    }
}
