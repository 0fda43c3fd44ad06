//! Concurrent RPC fan-out around the consensus core.
//!
//! `RaftNode` owns the node's single lock. Each round builds its request
//! payloads under the lock, runs the transport calls as independent futures
//! outside it, then reacquires the lock per reply to fold the result in.
//! One slow or unreachable peer never blocks progress toward the others.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::raft_core::{AppendEntriesArgs, RaftCore, RaftState, RequestVoteArgs};
use crate::state_machine::ApplyResult;
use crate::storage::StorageError;
use crate::transport::Transport;

/// Shared reference to the consensus core.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Per-replica fan-out driver.
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

/// Build the AppendEntries payload for one peer from its `next_index`,
/// optionally bounded at `upto`. Returns the args and the index the peer's
/// log reaches if it accepts the call.
fn append_args_for(core: &RaftCore, peer_id: u64, upto: Option<u64>) -> (AppendEntriesArgs, u64) {
    let next_idx = core.next_index.get(&peer_id).copied().unwrap_or(1);
    let prev_log_index = next_idx - 1;
    let prev_log_term = if prev_log_index == 0 {
        0
    } else {
        core.log
            .get((prev_log_index - 1) as usize)
            .map(|e| e.term)
            .unwrap_or(0)
    };

    let entries: Vec<_> = core
        .log
        .iter()
        .filter(|e| e.index >= next_idx && upto.map_or(true, |max| e.index <= max))
        .cloned()
        .collect();
    let ack_index = prev_log_index + entries.len() as u64;

    let args = AppendEntriesArgs {
        term: core.current_term,
        leader_id: core.id,
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: core.commit_index,
    };
    (args, ack_index)
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Shared core handle, for serving inbound RPCs.
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Move to candidate and open a new ballot.
    pub async fn start_election(&self) -> Result<(), StorageError> {
        self.core.lock().await.start_election()
    }

    /// Ask every peer for its vote, folding replies in as they arrive.
    /// Returns true as soon as a majority is reached and leadership taken;
    /// remaining in-flight calls are dropped.
    pub async fn request_votes(&self) -> Result<bool, StorageError> {
        let (args, peers) = {
            let core = self.core.lock().await;
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone())
        };
        let ballot_term = args.term;

        let mut calls: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = calls.next().await {
            match result {
                Ok(reply) => {
                    let mut core = self.core.lock().await;
                    if core.record_vote_reply(peer_id, ballot_term, &reply)? {
                        return Ok(true);
                    }
                }
                // An unreachable peer is simply a vote we do not get.
                Err(err) => debug!(peer = peer_id, error = %err, "vote request failed"),
            }
        }

        Ok(false)
    }

    /// Replicate the log through `entry_index` to every peer. Returns the
    /// state machine result for that entry once it commits, or `None` if no
    /// majority acknowledged it this round.
    pub async fn replicate_to_peers(
        &self,
        entry_index: u64,
    ) -> Result<Option<ApplyResult>, StorageError> {
        let (rpc_term, requests) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return Ok(None);
            }
            let requests: Vec<_> = core
                .peers
                .iter()
                .map(|&peer_id| {
                    let (args, ack_index) = append_args_for(&core, peer_id, Some(entry_index));
                    (peer_id, args, ack_index)
                })
                .collect();
            (core.current_term, requests)
        };

        let mut calls: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, ack_index)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        ack_index,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        let mut outcome = None;
        while let Some((peer_id, ack_index, result)) = calls.next().await {
            match result {
                Ok(reply) => {
                    let mut core = self.core.lock().await;
                    let applied = core.record_append_reply(peer_id, rpc_term, ack_index, &reply)?;
                    for (index, result) in applied {
                        if index == entry_index {
                            outcome = Some(result);
                        }
                    }
                }
                Err(err) => debug!(peer = peer_id, error = %err, "replication call failed"),
            }
            if outcome.is_some() {
                break; // committed; stragglers catch up on the next round
            }
        }

        Ok(outcome)
    }

    /// Run one replication round toward every peer. Each call carries the
    /// suffix the peer is missing; for a caught-up peer that is an empty
    /// heartbeat. Returns whether we are still leader afterwards and how
    /// many peers acknowledged.
    pub async fn send_heartbeat(&self) -> Result<(bool, usize), StorageError> {
        let (rpc_term, requests) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return Ok((false, 0));
            }
            let requests: Vec<_> = core
                .peers
                .iter()
                .map(|&peer_id| {
                    let (args, ack_index) = append_args_for(&core, peer_id, None);
                    (peer_id, args, ack_index)
                })
                .collect();
            (core.current_term, requests)
        };

        let mut calls: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, ack_index)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        ack_index,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        // Wait for every peer so higher terms and acks are all folded in.
        let mut acked = 0;
        while let Some((peer_id, ack_index, result)) = calls.next().await {
            match result {
                Ok(reply) => {
                    let success = reply.success;
                    let mut core = self.core.lock().await;
                    core.record_append_reply(peer_id, rpc_term, ack_index, &reply)?;
                    if success {
                        acked += 1;
                    }
                }
                Err(err) => debug!(peer = peer_id, error = %err, "heartbeat failed"),
            }
        }

        let still_leader = self.core.lock().await.state == RaftState::Leader;
        Ok((still_leader, acked))
    }

    /// Current role.
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Current commit index.
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}
