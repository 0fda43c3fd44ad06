//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};

/// Carries RequestVote and AppendEntries calls to peers.
///
/// Calls are independent and may fail or be delayed arbitrarily; the caller
/// treats any error as "no vote / no acknowledgement" and retries on its next
/// timer tick. Implementations must not assume delivery ordering between
/// peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Errors produced by transport implementations. All of them are absorbed by
/// the consensus core; none escalate past the current RPC round.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection to peer failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("target node not found")]
    NodeNotFound,
}
