//! Apply sinks for committed commands
//!
//! - `KeyValueStore`: simple key-value store
//! - `ChannelSink`: hands commands to a consumer over a bounded queue
//! - `TestStateMachine`: records commands for testing

pub mod channel;
pub mod kv;
pub mod traits;

pub use channel::ChannelSink;
pub use traits::{AppliedCommands, ApplyResult, StateMachine, TestStateMachine};
