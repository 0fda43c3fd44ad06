//! Consensus state machine: roles, terms, votes, the replicated log, and
//! commit bookkeeping.
//!
//! `RaftCore` is synchronous and transport-agnostic. All I/O happens in the
//! layers above; every mutation here runs under the node's single lock.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state_machine::{ApplyResult, StateMachine};
use crate::storage::{Storage, StorageError};

/// Replica roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Passive: appends entries from the leader, grants votes
    Follower,
    /// Actively collecting votes to become leader
    Candidate,
    /// Accepts commands and replicates the log
    Leader,
}

/// A single replicated log entry. Indices start at 1; index 0 means "nothing".
///
/// An empty `command` is a leadership no-op appended by a fresh leader and is
/// never handed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader accepted this entry
    pub term: u64,
    /// Position in the log
    pub index: u64,
    /// Opaque command payload for the state machine
    pub command: Vec<u8>,
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting the vote
    pub candidate_id: u64,
    /// Index of the candidate's last log entry
    pub last_log_index: u64,
    /// Term of the candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Receiver's current term, for the candidate to update itself
    pub term: u64,
    /// Whether the receiver granted its vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`
    pub prev_log_term: u64,
    /// Entries to append (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// AppendEntries RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Receiver's current term, for the leader to update itself
    pub term: u64,
    /// Whether the receiver's log matched at `prev_log_index`/`prev_log_term`
    pub success: bool,
}

/// Result of handling an inbound AppendEntries call.
#[derive(Debug, Clone)]
pub struct AppendEntriesOutcome {
    /// Reply to send back to the caller
    pub reply: AppendEntriesReply,
    /// The leader this call established, if the call was accepted
    pub leader_id: Option<u64>,
}

/// Per-replica consensus state.
pub struct RaftCore {
    // Persistence seam; term, vote, and log writes go through here before
    // the corresponding RPC reply is produced.
    storage: Box<dyn Storage>,
    // Sink for committed commands.
    state_machine: Box<dyn StateMachine>,

    // Persistent state, cached in memory.
    /// Latest term this replica has seen; never decreases
    pub current_term: u64,
    /// Candidate granted this replica's vote in `current_term`, if any
    pub voted_for: Option<u64>,
    /// The replicated log, 1-indexed
    pub log: Vec<LogEntry>,

    // Volatile state.
    /// Highest index known to be replicated on a majority
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,

    // Leader-only replication progress, reinitialized on election.
    /// Next log index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Highest log index known replicated on each peer
    pub match_index: HashMap<u64, u64>,

    /// This replica's ID
    pub id: u64,
    /// Current role
    pub state: RaftState,
    /// The other replicas (fixed membership)
    pub peers: Vec<u64>,
    /// Peers that granted a vote in the current candidate round
    votes_granted: HashSet<u64>,
    /// Leader of the current term, once one has been recognized
    pub current_leader: Option<u64>,
    /// Last accepted leader contact or granted vote; drives the election timer
    pub last_leader_contact: Instant,
}

impl RaftCore {
    /// Construct a replica, restoring term, vote, and log from storage.
    pub fn new(
        id: u64,
        peers: Vec<u64>,
        storage: Box<dyn Storage>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self, StorageError> {
        let current_term = storage.load_term()?;
        let voted_for = storage.load_voted_for()?;
        let log = storage.load_log()?;

        Ok(RaftCore {
            storage,
            state_machine,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_granted: HashSet::new(),
            current_leader: None,
            last_leader_contact: Instant::now(),
        })
    }

    // === Persistence helpers ===

    fn set_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.storage.save_term(term)?;
        self.current_term = term;
        Ok(())
    }

    fn set_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.storage.save_voted_for(voted_for)?;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Adopt a newer term and revert to follower. The term bump and the vote
    /// reset happen together; `voted_for` is cleared exactly when the term
    /// increases.
    fn step_down(&mut self, term: u64) -> Result<(), StorageError> {
        let old_state = self.state;
        self.set_term(term)?;
        self.set_voted_for(None)?;
        self.state = RaftState::Follower;
        self.current_leader = None;
        if old_state != RaftState::Follower {
            info!(id = self.id, term, from = ?old_state, "stepped down to follower");
        }
        Ok(())
    }

    fn persist_entry(&mut self, entry: LogEntry) -> Result<(), StorageError> {
        self.storage.append(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError> {
        let pos = (index - 1) as usize;
        if pos < self.log.len() {
            self.storage.truncate_from(index)?;
            self.log.truncate(pos);
        }
        Ok(())
    }

    // === Log accessors ===

    /// Index of the last log entry (0 when the log is empty).
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last log entry (0 when the log is empty).
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    fn entry_term(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|e| e.term)
    }

    /// Votes needed to win: a strict majority of the whole cluster, self
    /// included.
    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Election restriction: a candidate's log is at least as up-to-date as
    /// ours if its last term is higher, or equal with an index at least as
    /// large.
    pub fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index)
    }

    // === Inbound RPCs ===

    /// Handle an inbound RequestVote call.
    ///
    /// At most one vote is granted per term; granting also defers our own
    /// election timer.
    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteArgs,
    ) -> Result<RequestVoteReply, StorageError> {
        if req.term < self.current_term {
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        let already_voted_elsewhere =
            self.voted_for.is_some() && self.voted_for != Some(req.candidate_id);
        if already_voted_elsewhere
            || !self.is_log_up_to_date(req.last_log_term, req.last_log_index)
        {
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.set_voted_for(Some(req.candidate_id))?;
        self.last_leader_contact = Instant::now();
        debug!(id = self.id, term = self.current_term, candidate = req.candidate_id, "granted vote");

        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted: true,
        })
    }

    /// Handle an inbound AppendEntries call (heartbeat or replication).
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesArgs,
    ) -> Result<AppendEntriesOutcome, StorageError> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        if req.term < self.current_term {
            // Stale leader; do not reset the election timer.
            return Ok(AppendEntriesOutcome {
                reply: AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                },
                leader_id: None,
            });
        }

        // The call is from the live leader of our term. A candidate in the
        // same term concedes.
        if self.state != RaftState::Follower {
            info!(id = self.id, term = self.current_term, leader = req.leader_id,
                "yielding to leader");
            self.state = RaftState::Follower;
        }
        self.current_leader = Some(req.leader_id);
        self.last_leader_contact = Instant::now();

        // Consistency check: our log must contain the leader's previous entry.
        let prev_matches = req.prev_log_index == 0
            || self.entry_term(req.prev_log_index) == Some(req.prev_log_term);
        if !prev_matches {
            return Ok(AppendEntriesOutcome {
                reply: AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                },
                leader_id: Some(req.leader_id),
            });
        }

        self.reconcile_entries(&req.entries)?;

        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_log_index());
            self.apply_committed_entries();
        }

        Ok(AppendEntriesOutcome {
            reply: AppendEntriesReply {
                term: self.current_term,
                success: true,
            },
            leader_id: Some(req.leader_id),
        })
    }

    /// Fold the leader's entries into our log: drop the conflicting suffix at
    /// the first index whose term disagrees, then append what is missing.
    /// Re-delivery of entries we already hold is a no-op.
    fn reconcile_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        for entry in entries {
            match self.entry_term(entry.index) {
                Some(term) if term == entry.term => {} // already present
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    self.persist_entry(entry.clone())?;
                    debug!(id = self.id, index = entry.index, term = entry.term,
                        "replaced conflicting suffix");
                }
                None => {
                    self.persist_entry(entry.clone())?;
                    debug!(id = self.id, index = entry.index, term = entry.term, "appended entry");
                }
            }
        }
        Ok(())
    }

    // === Role transitions ===

    /// Start a new election round: bump the term, vote for ourselves.
    pub fn start_election(&mut self) -> Result<(), StorageError> {
        self.set_term(self.current_term + 1)?;
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.set_voted_for(Some(self.id))?;

        self.votes_granted.clear();
        self.votes_granted.insert(self.id);

        // Restart the timer so this round gets its full timeout.
        self.last_leader_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became candidate");
        Ok(())
    }

    /// Take leadership after winning an election.
    ///
    /// Appends a no-op entry in the new term so that entries from previous
    /// terms can commit indirectly without waiting for client traffic.
    pub fn become_leader(&mut self) -> Result<(), StorageError> {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.last_leader_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became leader");

        // next_index points at the no-op so the first round carries it.
        let last_index = self.last_log_index();
        for &peer_id in &self.peers {
            self.next_index.insert(peer_id, last_index + 1);
            self.match_index.insert(peer_id, 0);
        }

        let noop = LogEntry {
            term: self.current_term,
            index: last_index + 1,
            command: Vec::new(),
        };
        self.persist_entry(noop)
    }

    /// Append a client command to the leader's log. Returns `None` when this
    /// replica is not the leader.
    pub fn append_command(&mut self, command: Vec<u8>) -> Result<Option<LogEntry>, StorageError> {
        if self.state != RaftState::Leader {
            return Ok(None);
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
        };
        debug!(id = self.id, index = entry.index, term = entry.term, "accepted command");
        self.persist_entry(entry.clone())?;
        Ok(Some(entry))
    }

    // === Reply folding ===

    /// Fold in a RequestVote reply from `peer` for the round started in
    /// `ballot_term`. Returns true if this vote completed a majority and we
    /// took leadership.
    ///
    /// Replies from an abandoned round (the term has moved on) are discarded.
    pub fn record_vote_reply(
        &mut self,
        peer: u64,
        ballot_term: u64,
        reply: &RequestVoteReply,
    ) -> Result<bool, StorageError> {
        if reply.term > self.current_term {
            self.step_down(reply.term)?;
            return Ok(false);
        }

        if self.state != RaftState::Candidate || ballot_term != self.current_term {
            return Ok(false); // stale round
        }

        if reply.vote_granted {
            self.votes_granted.insert(peer);
        }

        if self.votes_granted.len() >= self.quorum() {
            self.become_leader()?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Fold in an AppendEntries reply from `peer`. `rpc_term` is the term the
    /// call was issued in and `ack_index` is `prev_log_index + entries.len()`
    /// of that call — the index the peer's log reaches on success.
    ///
    /// Returns the apply results of any entries this acknowledgement
    /// committed.
    pub fn record_append_reply(
        &mut self,
        peer: u64,
        rpc_term: u64,
        ack_index: u64,
        reply: &AppendEntriesReply,
    ) -> Result<Vec<(u64, ApplyResult)>, StorageError> {
        if reply.term > self.current_term {
            self.step_down(reply.term)?;
            return Ok(Vec::new());
        }

        if self.state != RaftState::Leader || rpc_term != self.current_term {
            return Ok(Vec::new()); // stale round
        }

        if reply.success {
            let matched = self.match_index.get(&peer).copied().unwrap_or(0);
            if ack_index > matched {
                self.match_index.insert(peer, ack_index);
                self.next_index.insert(peer, ack_index + 1);
            }
            Ok(self.advance_commit_index())
        } else {
            // Log mismatch: back up one entry and retry on the next round.
            let next = self.next_index.get(&peer).copied().unwrap_or(1);
            if next > 1 {
                self.next_index.insert(peer, next - 1);
            }
            Ok(Vec::new())
        }
    }

    /// Advance `commit_index` to the highest index replicated on a majority
    /// whose entry is from the current term. Entries from earlier terms are
    /// never counted directly; they commit when a current-term entry above
    /// them does.
    fn advance_commit_index(&mut self) -> Vec<(u64, ApplyResult)> {
        let quorum = self.quorum();
        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.entry_term(n) == Some(self.current_term) {
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|&&peer| self.match_index.get(&peer).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= quorum {
                    self.commit_index = n;
                    debug!(id = self.id, index = n, replicas, "commit index advanced");
                    return self.apply_committed_entries();
                }
            }
            n -= 1;
        }
        Vec::new()
    }

    /// Hand newly committed commands to the state machine, in log order.
    /// Leadership no-ops are skipped. Returns (index, result) per applied
    /// command.
    pub fn apply_committed_entries(&mut self) -> Vec<(u64, ApplyResult)> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let command = match self.entry(self.last_applied) {
                Some(e) if !e.command.is_empty() => e.command.clone(),
                _ => continue,
            };
            let result = self.state_machine.apply(&command);
            results.push((self.last_applied, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TestStateMachine;
    use crate::storage::memory::MemoryStorage;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(TestStateMachine::new()),
        )
        .unwrap()
    }

    fn entry(term: u64, index: u64, command: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            command: command.to_vec(),
        }
    }

    fn granted(term: u64) -> RequestVoteReply {
        RequestVoteReply {
            term,
            vote_granted: true,
        }
    }

    fn denied(term: u64) -> RequestVoteReply {
        RequestVoteReply {
            term,
            vote_granted: false,
        }
    }

    #[tokio::test]
    async fn test_new_node_starts_as_follower() {
        let node = new_test_core(1, vec![2, 3]);
        assert_eq!(node.id, 1);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.state, RaftState::Follower);
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn test_start_election_bumps_term_and_votes_for_self() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_restart_restores_persistent_state() {
        let mut storage = MemoryStorage::new();
        storage.save_term(3).unwrap();
        storage.save_voted_for(Some(2)).unwrap();
        storage.append(&[entry(3, 1, b"set x 1")]).unwrap();

        let node = RaftCore::new(
            1,
            vec![2, 3],
            Box::new(storage),
            Box::new(TestStateMachine::new()),
        )
        .unwrap();

        assert_eq!(node.current_term, 3);
        assert_eq!(node.voted_for, Some(2));
        assert_eq!(node.last_log_index(), 1);
        assert_eq!(node.state, RaftState::Follower);
    }

    // === Voting ===

    #[tokio::test]
    async fn test_vote_granted_to_first_candidate() {
        let mut node = new_test_core(1, vec![2, 3]);
        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(reply.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_vote_denied_stale_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;
        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[tokio::test]
    async fn test_at_most_one_vote_per_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();

        assert!(!reply.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_vote_regranted_to_same_candidate() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        // Retransmission of the same request gets the same answer.
        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(reply.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_vote_denied_candidate_log_behind_on_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(3, 1, b"set x 1"));

        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();

        // Term is adopted even though the vote is withheld.
        assert!(!reply.vote_granted);
        assert_eq!(node.current_term, 4);
    }

    #[tokio::test]
    async fn test_vote_denied_candidate_log_shorter() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(2, 1, b"set x 1"));
        node.log.push(entry(2, 2, b"set y 2"));

        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();

        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_granted_candidate_log_newer_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(2, 1, b"set x 1"));

        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 3,
            })
            .unwrap();

        assert!(reply.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_granting_vote_defers_election_timer() {
        let mut node = new_test_core(1, vec![2, 3]);
        let before = node.last_leader_contact;
        let reply = node
            .handle_request_vote(&RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(reply.vote_granted);
        assert!(node.last_leader_contact >= before);
    }

    // === Term and role transitions ===

    #[tokio::test]
    async fn test_leader_steps_down_on_higher_term_vote_reply() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;

        node.record_vote_reply(2, 1, &denied(5)).unwrap();

        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[tokio::test]
    async fn test_leader_steps_down_on_higher_term_append_reply() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;

        let reply = AppendEntriesReply {
            term: 5,
            success: false,
        };
        node.record_append_reply(2, 1, 1, &reply).unwrap();

        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[tokio::test]
    async fn test_candidate_yields_to_leader_in_same_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();
        assert_eq!(node.state, RaftState::Candidate);

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();

        assert!(outcome.reply.success);
        assert_eq!(outcome.leader_id, Some(2));
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_leader, Some(2));
    }

    #[tokio::test]
    async fn test_follower_adopts_higher_term_from_append() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(3);

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 5,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();

        assert!(outcome.reply.success);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[tokio::test]
    async fn test_term_never_decreases() {
        let mut node = new_test_core(1, vec![2, 3]);
        let mut observed = vec![node.current_term];

        node.handle_append_entries(&AppendEntriesArgs {
            term: 4,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .unwrap();
        observed.push(node.current_term);

        // A stale leader at term 2 must not drag the term back down.
        node.handle_append_entries(&AppendEntriesArgs {
            term: 2,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .unwrap();
        observed.push(node.current_term);

        node.start_election().unwrap();
        observed.push(node.current_term);

        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    }

    // === Heartbeats and the election timer ===

    #[tokio::test]
    async fn test_heartbeat_resets_election_timer() {
        let mut node = new_test_core(1, vec![2, 3]);
        let before = node.last_leader_contact;

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();

        assert!(outcome.reply.success);
        assert!(node.last_leader_contact >= before);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_does_not_reset_timer() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 2;
        let before = node.last_leader_contact;

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();

        assert!(!outcome.reply.success);
        assert_eq!(outcome.leader_id, None);
        assert_eq!(node.last_leader_contact, before);
    }

    // === Log reconciliation ===

    #[tokio::test]
    async fn test_append_rejected_when_prev_entry_missing() {
        let mut node = new_test_core(1, vec![2, 3]);

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(1, 2, b"set x 1")],
                leader_commit: 0,
            })
            .unwrap();

        assert!(!outcome.reply.success);
        assert!(node.log.is_empty());
    }

    #[tokio::test]
    async fn test_append_rejected_on_prev_term_mismatch() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 1, b"set x 1"));

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 2,
                entries: vec![entry(2, 2, b"set y 2")],
                leader_commit: 0,
            })
            .unwrap();

        assert!(!outcome.reply.success);
        assert_eq!(node.log.len(), 1);
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(entry(1, 1, b"set x 1"));
        node.log.push(entry(1, 2, b"set y old"));

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 2, b"set y new")],
                leader_commit: 0,
            })
            .unwrap();

        assert!(outcome.reply.success);
        assert_eq!(node.log.len(), 2);
        assert_eq!(node.log[1].command, b"set y new");
        assert_eq!(node.log[1].term, 2);
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"set x 1")],
            leader_commit: 0,
        };

        assert!(node.handle_append_entries(&args).unwrap().reply.success);
        assert!(node.handle_append_entries(&args).unwrap().reply.success);
        assert_eq!(node.log.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_commit_follows_leader_commit() {
        let mut node = new_test_core(1, vec![2, 3]);

        let outcome = node
            .handle_append_entries(&AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1, b"set x 1")],
                leader_commit: 1,
            })
            .unwrap();

        assert!(outcome.reply.success);
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    #[tokio::test]
    async fn test_follower_commit_bounded_by_log_length() {
        let mut node = new_test_core(1, vec![2, 3]);

        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"set x 1")],
            leader_commit: 5,
        })
        .unwrap();

        assert_eq!(node.commit_index, 1);
    }

    // === Vote tallying ===

    #[tokio::test]
    async fn test_majority_needed_in_five_node_cluster() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election().unwrap();

        assert!(!node.record_vote_reply(2, 1, &granted(1)).unwrap());
        assert_eq!(node.state, RaftState::Candidate);

        assert!(!node.record_vote_reply(3, 1, &denied(1)).unwrap());
        assert_eq!(node.state, RaftState::Candidate);

        // Third granted vote (self + 2) is the majority of 5.
        assert!(node.record_vote_reply(4, 1, &granted(1)).unwrap());
        assert_eq!(node.state, RaftState::Leader);
    }

    #[tokio::test]
    async fn test_duplicate_vote_counted_once() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election().unwrap();

        assert!(!node.record_vote_reply(2, 1, &granted(1)).unwrap());
        // Retransmitted reply from the same peer must not complete the quorum.
        assert!(!node.record_vote_reply(2, 1, &granted(1)).unwrap());
        assert_eq!(node.state, RaftState::Candidate);
    }

    #[tokio::test]
    async fn test_election_lost_without_majority() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election().unwrap();

        assert!(!node.record_vote_reply(2, 1, &denied(1)).unwrap());
        assert!(!node.record_vote_reply(3, 1, &denied(1)).unwrap());

        // Still a candidate; the next timeout starts a fresh round.
        assert_eq!(node.state, RaftState::Candidate);
    }

    #[tokio::test]
    async fn test_votes_from_abandoned_round_discarded() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election().unwrap(); // term 1
        node.record_vote_reply(2, 1, &granted(1)).unwrap();

        // Round times out; a new election starts at term 2.
        node.start_election().unwrap();

        // Late replies for the term-1 ballot trickle in. They must not count
        // toward the term-2 quorum.
        assert!(!node.record_vote_reply(3, 1, &granted(1)).unwrap());
        assert!(!node.record_vote_reply(4, 1, &granted(1)).unwrap());
        assert_eq!(node.state, RaftState::Candidate);

        // Fresh term-2 votes still win it.
        assert!(!node.record_vote_reply(2, 2, &granted(2)).unwrap());
        assert!(node.record_vote_reply(3, 2, &granted(2)).unwrap());
        assert_eq!(node.state, RaftState::Leader);
    }

    // === Leader replication bookkeeping ===

    fn new_test_leader(id: u64, peers: Vec<u64>) -> RaftCore {
        let mut leader = new_test_core(id, peers);
        leader.start_election().unwrap();
        for &peer in leader.peers.clone().iter() {
            if leader.state != RaftState::Leader {
                leader
                    .record_vote_reply(peer, leader.current_term, &granted(leader.current_term))
                    .unwrap();
            }
        }
        assert_eq!(leader.state, RaftState::Leader);
        leader
    }

    #[tokio::test]
    async fn test_become_leader_appends_noop_and_resets_progress() {
        let leader = new_test_leader(1, vec![2, 3]);
        // No-op at index 1 in term 1.
        assert_eq!(leader.last_log_index(), 1);
        assert!(leader.log[0].command.is_empty());
        assert_eq!(leader.next_index.get(&2), Some(&1));
        assert_eq!(leader.match_index.get(&2), Some(&0));
    }

    #[tokio::test]
    async fn test_successful_ack_advances_progress() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        leader.append_command(b"set x 1".to_vec()).unwrap();

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: true,
        };
        leader
            .record_append_reply(2, leader.current_term, 2, &reply)
            .unwrap();

        assert_eq!(leader.match_index.get(&2), Some(&2));
        assert_eq!(leader.next_index.get(&2), Some(&3));
    }

    #[tokio::test]
    async fn test_failed_ack_backs_off_next_index() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        leader.next_index.insert(2, 5);

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: false,
        };
        leader
            .record_append_reply(2, leader.current_term, 5, &reply)
            .unwrap();

        assert_eq!(leader.next_index.get(&2), Some(&4));
    }

    #[tokio::test]
    async fn test_next_index_never_below_one() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        leader.next_index.insert(2, 1);

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: false,
        };
        leader
            .record_append_reply(2, leader.current_term, 1, &reply)
            .unwrap();

        assert_eq!(leader.next_index.get(&2), Some(&1));
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_regress_match_index() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        leader.match_index.insert(2, 5);
        leader.next_index.insert(2, 6);

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: true,
        };
        leader
            .record_append_reply(2, leader.current_term, 3, &reply)
            .unwrap();

        assert_eq!(leader.match_index.get(&2), Some(&5));
        assert_eq!(leader.next_index.get(&2), Some(&6));
    }

    #[tokio::test]
    async fn test_ack_from_older_leadership_term_discarded() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        let old_term = leader.current_term;

        // Leadership is lost and regained at a higher term.
        leader.step_down(old_term + 1).unwrap();
        leader.start_election().unwrap();
        let new_term = leader.current_term;
        leader.record_vote_reply(2, new_term, &granted(new_term)).unwrap();
        assert_eq!(leader.state, RaftState::Leader);

        // A late ack for an RPC of the old leadership must not move progress.
        let before = leader.match_index.get(&2).copied().unwrap();
        let reply = AppendEntriesReply {
            term: old_term,
            success: true,
        };
        leader.record_append_reply(3, old_term, 9, &reply).unwrap();
        assert_eq!(leader.match_index.get(&2).copied().unwrap(), before);
        assert_eq!(leader.match_index.get(&3), Some(&0));
    }

    // === Commit safety ===

    #[tokio::test]
    async fn test_not_committed_without_majority() {
        let mut leader = new_test_leader(1, vec![2, 3, 4, 5]);
        leader.append_command(b"set x 1".to_vec()).unwrap();

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: true,
        };
        // Leader + one peer is 2 of 5.
        leader
            .record_append_reply(2, leader.current_term, 2, &reply)
            .unwrap();

        assert_eq!(leader.commit_index, 0);
    }

    #[tokio::test]
    async fn test_committed_once_majority_acks() {
        let mut leader = new_test_leader(1, vec![2, 3, 4, 5]);
        leader.append_command(b"set x 1".to_vec()).unwrap();

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: true,
        };
        leader
            .record_append_reply(2, leader.current_term, 2, &reply)
            .unwrap();
        let results = leader
            .record_append_reply(3, leader.current_term, 2, &reply)
            .unwrap();

        // No-op at 1 and the command at 2 commit together.
        assert_eq!(leader.commit_index, 2);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 2);
    }

    #[tokio::test]
    async fn test_commit_advances_to_highest_majority_index() {
        let mut leader = new_test_leader(1, vec![2, 3]);
        leader.append_command(b"cmd 1".to_vec()).unwrap();
        leader.append_command(b"cmd 2".to_vec()).unwrap();
        leader.append_command(b"cmd 3".to_vec()).unwrap();

        let reply = AppendEntriesReply {
            term: leader.current_term,
            success: true,
        };
        // One peer acks everything: noop + 3 commands = index 4.
        let results = leader
            .record_append_reply(2, leader.current_term, 4, &reply)
            .unwrap();

        assert_eq!(leader.commit_index, 4);
        assert_eq!(leader.last_applied, 4);
        // The no-op is not handed to the state machine.
        let applied: Vec<u64> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(applied, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_prior_term_entries_never_counted_directly() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);

        // An entry inherited from an older leader.
        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"set x 1")],
            leader_commit: 0,
        })
        .unwrap();

        // This node now wins term 2 but suppress the no-op to isolate the
        // gating rule: pretend replication progress covers only index 1.
        node.start_election().unwrap();
        node.record_vote_reply(2, 2, &granted(2)).unwrap();
        node.record_vote_reply(3, 2, &granted(2)).unwrap();
        assert_eq!(node.state, RaftState::Leader);
        node.log.truncate(1); // drop the no-op appended on election

        let reply = AppendEntriesReply {
            term: 2,
            success: true,
        };
        node.record_append_reply(2, 2, 1, &reply).unwrap();
        node.record_append_reply(3, 2, 1, &reply).unwrap();

        // Index 1 is majority-replicated but belongs to term 1, so it must
        // not commit while the current term is 2.
        assert_eq!(node.commit_index, 0);
    }

    #[tokio::test]
    async fn test_prior_term_entry_commits_via_current_term_entry() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"set x 1")],
            leader_commit: 0,
        })
        .unwrap();

        node.start_election().unwrap();
        node.record_vote_reply(2, 2, &granted(2)).unwrap();
        node.record_vote_reply(3, 2, &granted(2)).unwrap();
        // The election no-op sits at index 2 in term 2.

        let reply = AppendEntriesReply {
            term: 2,
            success: true,
        };
        node.record_append_reply(2, 2, 2, &reply).unwrap();
        node.record_append_reply(3, 2, 2, &reply).unwrap();

        // Committing the term-2 no-op pulls the term-1 entry in with it.
        assert_eq!(node.commit_index, 2);
        assert_eq!(node.last_applied, 2);
    }

    #[tokio::test]
    async fn test_non_leader_rejects_commands() {
        let mut node = new_test_core(1, vec![2, 3]);
        assert!(node.append_command(b"set x 1".to_vec()).unwrap().is_none());
    }
}
