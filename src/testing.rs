//! Testing utilities: an in-process Raft cluster over the in-memory
//! transport, with link-level fault injection.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::core::config::RaftConfig;
use crate::core::raft_core::{LogEntry, RaftCore, RaftState};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftError, RaftHandle, RaftServer};
use crate::state_machine::{AppliedCommands, TestStateMachine};
use crate::storage::memory::MemoryStorage;
use crate::transport::inmemory::{create_cluster_with_timeout, LinkControl};

/// How often waiters poll cluster state.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One node of a test cluster.
pub struct TestNode {
    pub id: u64,
    /// Client handle to the node's server loop
    pub raft_handle: RaftHandle,
    /// Shared consensus core, for direct inspection
    pub shared_core: SharedCore,
    /// Commands this node's state machine has applied, in order
    pub applied: AppliedCommands,
}

/// An in-process cluster of running Raft servers.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    links: LinkControl,
}

impl TestCluster {
    /// Start a cluster of `count` nodes with test-friendly timeouts.
    pub async fn new(count: usize) -> Self {
        let config = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300));
        Self::with_config(count, config).await
    }

    /// Start a cluster of `count` nodes with the given config.
    pub async fn with_config(count: usize, config: RaftConfig) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();
        let (mut transports, mut handles, links) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(100)));

        let mut nodes = Vec::new();
        for &id in &node_ids {
            let peers: Vec<u64> = node_ids.iter().copied().filter(|&p| p != id).collect();
            let applied: AppliedCommands = Default::default();

            let core = RaftCore::new(
                id,
                peers,
                Box::new(MemoryStorage::new()),
                Box::new(TestStateMachine::new_shared(applied.clone())),
            )
            .unwrap();

            let transport = transports.remove(&id).unwrap();
            let (server, shared_core) = RaftServer::with_config(core, transport, config.clone());
            let raft_handle = server.start();

            // Pump inbound RPCs for this node until the cluster shuts down.
            let pump = handles.remove(&id).unwrap();
            tokio::spawn(pump.run_shared(shared_core.clone()));

            nodes.push(TestNode {
                id,
                raft_handle,
                shared_core,
                applied,
            });
        }

        TestCluster { nodes, links }
    }

    fn node(&self, id: u64) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no node {id} in cluster"))
    }

    /// IDs of all nodes currently in the Leader role.
    pub async fn leader_ids(&self) -> Vec<u64> {
        let mut leaders = Vec::new();
        for node in &self.nodes {
            if node.shared_core.lock().await.state == RaftState::Leader {
                leaders.push(node.id);
            }
        }
        leaders
    }

    /// Wait until some node is leader; returns its ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let ids: Vec<u64> = self.nodes.iter().map(|n| n.id).collect();
        self.wait_for_leader_among(&ids, timeout).await
    }

    /// Wait until one of `candidates` is leader; returns its ID.
    pub async fn wait_for_leader_among(
        &self,
        candidates: &[u64],
        timeout: Duration,
    ) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for &id in candidates {
                if self.state_of(id).await == RaftState::Leader {
                    return Some(id);
                }
            }
            sleep(POLL_INTERVAL).await;
        }
        None
    }

    /// Wait until the node reaches the given role.
    pub async fn wait_for_state(&self, id: u64, state: RaftState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state_of(id).await == state {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// Wait until the node's commit index reaches `index`.
    pub async fn wait_for_commit(&self, id: u64, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.commit_index_of(id).await >= index {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// Submit a command through the given node.
    pub async fn submit(&self, id: u64, command: &[u8]) -> Result<Vec<u8>, RaftError> {
        self.node(id).raft_handle.submit(command.to_vec()).await
    }

    /// Cut a node off from every peer.
    pub fn partition(&self, id: u64) {
        self.links.partition(id);
    }

    /// Reconnect a previously partitioned node.
    pub fn heal(&self, id: u64) {
        self.links.heal(id);
    }

    pub async fn state_of(&self, id: u64) -> RaftState {
        self.node(id).shared_core.lock().await.state
    }

    pub async fn term_of(&self, id: u64) -> u64 {
        self.node(id).shared_core.lock().await.current_term
    }

    pub async fn commit_index_of(&self, id: u64) -> u64 {
        self.node(id).shared_core.lock().await.commit_index
    }

    pub async fn log_of(&self, id: u64) -> Vec<LogEntry> {
        self.node(id).shared_core.lock().await.log.clone()
    }

    pub async fn applied_of(&self, id: u64) -> Vec<Vec<u8>> {
        self.node(id).applied.lock().unwrap().clone()
    }

    /// Stop every server loop.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.raft_handle.shutdown().await;
        }
    }
}
