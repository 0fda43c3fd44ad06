//! Consensus core: state machine, RPC fan-out, and the server control loop.

pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
