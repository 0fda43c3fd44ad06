//! State machine abstraction
//!
//! The state machine is the application logic the replicated log drives.
//! Once an entry commits, its command is handed here, in log order, exactly
//! once per `RaftCore` lifetime.

use std::sync::{Arc, Mutex};

/// Result of applying one command: an opaque output, or an application-level
/// error message. Application errors are deterministic outputs like any
/// other; they do not affect consensus.
pub type ApplyResult = Result<Vec<u8>, String>;

/// Sink for committed commands.
///
/// Implementations must be deterministic: the same commands in the same
/// order produce the same state on every replica.
pub trait StateMachine: Send {
    /// Apply one committed command.
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// Shared record of applied commands, for inspection from tests.
pub type AppliedCommands = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test sink that records every applied command.
#[derive(Default)]
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with an externally held record of applied commands.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied.lock().unwrap().push(command.to_vec());
        Ok(Vec::new())
    }
}
