//! Raft-style leader election and log replication.
//!
//! One [`core::raft_core::RaftCore`] runs per replica; [`core::raft_server::RaftServer`]
//! drives it with election and heartbeat timers and replicates commands to a
//! fixed set of peers over a pluggable [`transport::Transport`]. Committed
//! commands are handed, in log order, to an application-supplied
//! [`state_machine::StateMachine`] sink.

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
