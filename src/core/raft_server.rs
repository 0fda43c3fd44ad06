//! Server control loop: owns the election and heartbeat timers and accepts
//! client commands.
//!
//! One long-lived task per node drives every role transition. RPC fan-out
//! runs in short-lived futures inside each round; nothing mutates the core
//! without going through the node's lock.

use std::pin::pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{error, warn};

use super::config::RaftConfig;
use super::raft_core::{RaftCore, RaftState};
use super::raft_node::{RaftNode, SharedCore};
use crate::storage::StorageError;
use crate::transport::{Transport, TransportError};

/// Client-facing errors. Everything here is retryable from the client's
/// point of view; consensus itself has no fatal error states.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is not the leader (with a hint to the real one, if known)
    #[error("not the leader")]
    NotLeader { leader_hint: Option<u64> },
    /// The command did not reach a majority this round
    #[error("entry was not committed")]
    NotCommitted,
    /// The state machine rejected the command
    #[error("state machine error: {0}")]
    StateMachine(String),
    /// The storage collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The transport collaborator failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Command {
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, RaftError>>,
    },
}

/// Cloneable handle for interacting with a running server.
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a command for replication. Resolves with the state machine
    /// output once the entry commits.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?;

        reply_rx
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?
    }

    /// Stop the server loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Raft server: the control task plus the channels feeding it.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server with the default config. Returns the server and the
    /// shared core for inbound RPC handling.
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a server with a custom config.
    pub fn with_config(core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        if let Err(reason) = config.validate() {
            warn!(%reason, "raft config does not guarantee liveness");
        }
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
        };
        (server, shared_core)
    }

    /// Spawn the control loop and return the client handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// The control loop. Storage failures inside a round are logged and
    /// degrade to retry on the next tick.
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay missed ticks so a backlog cannot starve the election branch.
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // A fresh random timeout every wait is what resolves split votes.
            let election_timeout = self.config.random_election_timeout();
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Submit { command, reply } => {
                            let result = self.handle_submit(command).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        // Leaders do not run election timers against themselves.
                        self.node.shared_core().lock().await.last_leader_contact = Instant::now();
                        if let Err(err) = self.node.send_heartbeat().await {
                            error!(error = %err, "heartbeat round failed");
                        }
                    }
                }
                _ = election_sleep => {
                    if self.node.state().await != RaftState::Leader
                        && self.election_timed_out(election_timeout).await
                    {
                        if let Err(err) = self.run_election().await {
                            error!(error = %err, "election round failed");
                        }
                    }
                }
                else => break, // all channels closed
            }
        }
    }

    async fn run_election(&self) -> Result<(), StorageError> {
        self.node.start_election().await?;
        if self.node.request_votes().await? {
            // Assert leadership before anyone else times out.
            self.node.send_heartbeat().await?;
        }
        Ok(())
    }

    /// Deadline at which silence from a leader becomes an election.
    async fn election_deadline(&self, timeout: Duration) -> Instant {
        let core = self.node.shared_core();
        let last_contact = core.lock().await.last_leader_contact;
        last_contact + timeout
    }

    /// Re-check under the lock that no heartbeat or granted vote arrived
    /// while the timer was firing.
    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let core = self.node.shared_core();
        let last_contact = core.lock().await.last_leader_contact;
        Instant::now() >= last_contact + timeout
    }

    async fn handle_submit(&self, command: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let entry_index = {
            let shared_core = self.node.shared_core();
            let mut core = shared_core.lock().await;

            if core.state != RaftState::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: core.current_leader,
                });
            }

            let entry = core
                .append_command(command)?
                .ok_or(RaftError::NotLeader { leader_hint: None })?;
            entry.index
        };

        match self.node.replicate_to_peers(entry_index).await? {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(RaftError::StateMachine(message)),
            None => Err(RaftError::NotCommitted),
        }
    }

    /// Move to candidate and open a ballot (exposed for tests and embedding).
    pub async fn start_election(&self) -> Result<(), StorageError> {
        self.node.start_election().await
    }

    /// Collect votes for the current ballot (exposed for tests and embedding).
    pub async fn request_votes(&self) -> Result<bool, StorageError> {
        self.node.request_votes().await
    }

    /// Current role.
    pub async fn state(&self) -> RaftState {
        self.node.state().await
    }

    /// Current commit index.
    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}
