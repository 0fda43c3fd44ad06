//! Storage abstraction for Raft persistent state
//!
//! Raft requires `current_term`, `voted_for`, and the log to reach stable
//! storage before the replica replies to an RPC. The core writes through this
//! trait synchronously; durability is the implementation's responsibility.

pub mod memory;

use thiserror::Error;

use crate::core::raft_core::LogEntry;

/// Errors surfaced by storage implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g. disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Persistence seam for Raft state.
///
/// All operations are synchronous and must be durable before returning. The
/// `Send` bound is required because the core lives behind an async lock.
pub trait Storage: Send {
    /// Load the current term; 0 on a fresh start.
    fn load_term(&self) -> Result<u64, StorageError>;

    /// Save the current term.
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Load the vote cast in the current term, if any.
    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    /// Save the vote cast in the current term.
    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Load the whole log.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing ones.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Drop every entry with index >= `from_index`. Used when a leader's
    /// entries conflict with ours.
    fn truncate_from(&mut self, from_index: u64) -> Result<(), StorageError>;
}
