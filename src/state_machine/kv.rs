//! Simple key-value store state machine
//!
//! Commands are UTF-8 text:
//! - `set <key> <value>` — store a value, returns the previous value if any
//! - `del <key>` — remove a key, returns `Err("NOT_FOUND")` when absent
//!
//! Reads go through `get()` directly and bypass the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ApplyResult, StateMachine};

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value directly (bypasses the replicated log).
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        let text = std::str::from_utf8(command)
            .map_err(|_| "command is not valid UTF-8".to_string())?;
        let mut parts = text.splitn(3, ' ');

        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => {
                let previous = self.data.insert(key.to_string(), value.to_string());
                Ok(previous.map(String::into_bytes).unwrap_or_default())
            }
            (Some("del"), Some(key), None) => match self.data.remove(key) {
                Some(previous) => Ok(previous.into_bytes()),
                None => Err("NOT_FOUND".to_string()),
            },
            _ => Err(format!("unknown command: {}", text)),
        }
    }
}

/// Store shared between the consensus core (writes) and direct readers.
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.lock().unwrap().apply(command)
    }
}
