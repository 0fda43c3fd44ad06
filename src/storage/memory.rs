//! In-memory storage.
//!
//! No disk I/O and no durability across restarts; intended for tests and
//! in-process clusters where persistence is handled elsewhere.

use super::{Storage, StorageError};
use crate::core::raft_core::LogEntry;

/// Volatile `Storage` implementation.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        Ok(self.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.term = term;
        Ok(())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.voted_for)
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_from(&mut self, from_index: u64) -> Result<(), StorageError> {
        // Entries are 1-indexed; entry N sits at position N-1.
        if from_index > 0 {
            let pos = (from_index - 1) as usize;
            if pos < self.log.len() {
                self.log.truncate(pos);
            }
        } else {
            self.log.clear();
        }
        Ok(())
    }
}
