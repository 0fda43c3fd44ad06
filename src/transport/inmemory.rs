//! In-memory transport over tokio channels.
//!
//! Used by tests and in-process clusters. Each call is a request/reply pair:
//! the request goes over the target's mpsc channel, the reply comes back on a
//! oneshot. `LinkControl` can take nodes off the network to simulate
//! partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesReply, RaftCore, RequestVoteArgs, RequestVoteReply,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Requests deliverable to a node's request pump.
pub(crate) enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteReply>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesReply>,
    },
}

/// Shared switchboard for partition simulation: a node listed here can
/// neither send nor receive.
#[derive(Clone, Default)]
pub struct LinkControl {
    down: Arc<StdMutex<HashSet<u64>>>,
}

impl LinkControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the node off from every peer.
    pub fn partition(&self, node_id: u64) {
        self.down.lock().unwrap().insert(node_id);
    }

    /// Reconnect the node.
    pub fn heal(&self, node_id: u64) {
        self.down.lock().unwrap().remove(&node_id);
    }

    fn is_down(&self, node_id: u64) -> bool {
        self.down.lock().unwrap().contains(&node_id)
    }
}

/// Channel-backed transport for one node.
pub struct InMemoryTransport {
    local_id: u64,
    /// Senders to each peer's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional per-call timeout
    timeout: Option<Duration>,
    links: LinkControl,
}

impl InMemoryTransport {
    fn new(
        local_id: u64,
        senders: HashMap<u64, mpsc::Sender<Request>>,
        timeout: Option<Duration>,
        links: LinkControl,
    ) -> Self {
        Self {
            local_id,
            senders,
            timeout,
            links,
        }
    }

    async fn call<R>(
        &self,
        target: u64,
        make_request: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        if self.links.is_down(self.local_id) || self.links.is_down(target) {
            return Err(TransportError::ConnectionFailed);
        }
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        self.call(target, |reply| Request::RequestVote { args, reply })
            .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        self.call(target, |reply| Request::AppendEntries { args, reply })
            .await
    }
}

/// Receiving end of a node's request channel.
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against a directly owned core.
    /// Returns false once all senders are gone.
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one incoming request against a shared core, locking only for
    /// the handler itself.
    pub async fn process_one_shared(&mut self, node: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    /// Serve requests against a shared core until the channel closes.
    pub async fn run_shared(mut self, node: SharedCore) {
        while self.process_one_shared(&node).await {}
    }

    fn handle_request(request: Request, node: &mut RaftCore) {
        // A persistence failure means no reply; the caller times out and
        // treats the round as lost.
        match request {
            Request::RequestVote { args, reply } => {
                if let Ok(result) = node.handle_request_vote(&args) {
                    let _ = reply.send(result);
                }
            }
            Request::AppendEntries { args, reply } => {
                if let Ok(outcome) = node.handle_append_entries(&args) {
                    let _ = reply.send(outcome.reply);
                }
            }
        }
    }
}

/// Wire up transports and request handles for a full cluster.
pub fn create_cluster(
    node_ids: &[u64],
) -> (
    HashMap<u64, InMemoryTransport>,
    HashMap<u64, NodeHandle>,
    LinkControl,
) {
    create_cluster_with_timeout(node_ids, None)
}

/// Wire up a cluster with an optional per-call RPC timeout.
///
/// Without a timeout, a call to a node whose handle is never pumped waits
/// forever; tests that drop requests on the floor want `Some(..)`.
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (
    HashMap<u64, InMemoryTransport>,
    HashMap<u64, NodeHandle>,
    LinkControl,
) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();
    let links = LinkControl::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let peer_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        transports.insert(
            id,
            InMemoryTransport::new(id, peer_senders, timeout, links.clone()),
        );
    }

    (transports, handles, links)
}
