//! Bounded-queue apply sink.
//!
//! Hands each committed command to a consumer thread over a bounded
//! crossbeam channel. The handoff is one-way and order-preserving; if the
//! consumer stops draining, `apply` blocks and the node's commit pipeline
//! stalls with it.

use crossbeam_channel::{bounded, Receiver, Sender};

use super::{ApplyResult, StateMachine};

/// Apply sink backed by a bounded channel.
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its queue, holding at most
    /// `capacity` undelivered commands.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(capacity);
        (ChannelSink { tx }, rx)
    }
}

impl StateMachine for ChannelSink {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.tx
            .send(command.to_vec())
            .map_err(|_| "apply channel closed".to_string())?;
        Ok(Vec::new())
    }
}
