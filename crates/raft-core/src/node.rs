//! # node
//!
//! why: define the raft node state machine and the rpc rules around it
//! relations: uses message.rs for rpc types, log.rs for entries, persist.rs for durable state
//! what: NodeState enum, RaftNode struct, election, replication and commit logic
//!
//! The node performs no I/O. Every method mutates in-memory state and returns
//! what the caller must send or act upon. Whenever `currentTerm`, `votedFor`
//! or the log change, the node raises a persist flag that the caller drains
//! with [`RaftNode::take_persist_pending`] and must honor before the reply or
//! request that depends on the change leaves the process.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RaftConfig;
use crate::log::{Log, LogEntry};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::persist::PersistentState;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, for observers and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: u64,
    pub state: NodeState,
    pub term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<u64>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    pub log: Log,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<u64, u64>,
    /// Candidate only: distinct nodes that granted us their vote
    pub votes_received: Vec<u64>,
    pub leader_id: Option<u64>,
    persist_pending: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self::restore(id, cluster_nodes, config, PersistentState::default())
    }

    /// Resume from persisted state. A restarted node is always a follower.
    ///
    /// Repeated ids in `cluster_nodes` are dropped, keeping the first
    /// occurrence, so every majority counts distinct nodes.
    pub fn restore(
        id: u64,
        mut cluster_nodes: Vec<u64>,
        config: RaftConfig,
        persisted: PersistentState,
    ) -> Self {
        let mut seen = HashSet::new();
        cluster_nodes.retain(|node| seen.insert(*node));

        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: Vec::new(),
            leader_id: None,
            persist_pending: false,
        }
    }

    // -- cluster helpers --

    /// Votes or replicas needed for a strict majority
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Every cluster member except this node
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&p| p != self.id)
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at `index`, 0 when there is no such entry
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- persistence --

    /// Snapshot of the state that must survive a restart
    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// True once per batch of changes to term, vote or log.
    pub fn take_persist_pending(&mut self) -> bool {
        std::mem::take(&mut self.persist_pending)
    }

    // -- observation --

    /// (currentTerm, isLeader)
    pub fn get_state(&self) -> (u64, bool) {
        (self.current_term, self.state == NodeState::Leader)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            last_log_index: self.last_log_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            leader_id: self.leader_id,
        }
    }

    // -- role transitions --

    /// Revert to follower, adopting `term` if it is newer.
    ///
    /// The vote is only cleared on a strictly greater term; a candidate that
    /// yields to a leader of its own term keeps its self-vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            tracing::info!(node_id = self.id, from = self.current_term, to = term, "adopting newer term");
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_pending = true;
        }
        if self.state != NodeState::Follower {
            tracing::info!(node_id = self.id, term = self.current_term, from = %self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Election timer fired: bump the term, vote for ourselves and return
    /// the request to broadcast. A single-node cluster wins on the spot.
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.persist_pending = true;

        tracing::info!(node_id = self.id, term = self.current_term, "starting election");

        let request = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        tracing::info!(node_id = self.id, term = self.current_term, "became leader");
    }

    // -- RequestVote --

    /// Server side of RequestVote. The bool is true when the vote was
    /// granted, which must reset the election timer.
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (
                RequestVoteReply {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            );
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let free_to_vote = match self.voted_for {
            None => true,
            Some(candidate) => candidate == args.candidate_id,
        };
        let granted = free_to_vote && self.log.is_up_to_date(args.last_log_index, args.last_log_term);
        if granted && self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.persist_pending = true;
        }

        tracing::debug!(
            node_id = self.id,
            candidate = args.candidate_id,
            term = args.term,
            granted,
            "RequestVote handled"
        );

        (
            RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
            },
            granted,
        )
    }

    /// Client side of RequestVote. `request_term` is the term the request was
    /// sent in; replies to superseded elections are dropped. Returns true if
    /// this reply won the election.
    pub fn handle_vote_response(&mut self, request_term: u64, from: u64, reply: &RequestVoteReply) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || request_term != self.current_term {
            return false;
        }

        if reply.vote_granted
            && self.cluster_nodes.contains(&from)
            && !self.votes_received.contains(&from)
        {
            self.votes_received.push(from);
            tracing::debug!(node_id = self.id, peer = from, votes = self.votes_received.len(), "received vote");
        }

        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- log replication (leader) --

    /// Append a client command at `last_index + 1`. `None` if not leader.
    pub fn append_entry(&mut self, command: Vec<u8>) -> Option<LogEntry> {
        if self.state != NodeState::Leader {
            return None;
        }
        let entry = self.log.append(self.current_term, command).clone();
        self.persist_pending = true;
        tracing::debug!(node_id = self.id, index = entry.index, term = entry.term, "appended command");
        Some(entry)
    }

    /// AppendEntries for `peer` starting at its `next_index`; an empty batch
    /// doubles as the heartbeat. `None` if not leader.
    pub fn create_append_entries(&self, peer: u64) -> Option<AppendEntriesArgs> {
        if self.state != NodeState::Leader {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Fold an AppendEntries reply from `from` back into leader state.
    /// Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: u64,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Leader || args.term != self.current_term {
            return false;
        }

        if !reply.success {
            let next = reply.hint_next_index.clamp(1, self.last_log_index() + 1);
            self.next_index.insert(from, next);
            tracing::debug!(node_id = self.id, peer = from, next, "follower rejected append, backing off");
            return false;
        }
        if args.entries.is_empty() {
            return false;
        }

        // replies can arrive out of order; never move match_index backwards
        let matched = self
            .match_index
            .get(&from)
            .copied()
            .unwrap_or(0)
            .max(args.last_index());
        self.match_index.insert(from, matched);
        self.next_index.insert(from, matched + 1);
        self.advance_commit_index()
    }

    /// Commit the highest current-term index held by a majority.
    ///
    /// Entries from earlier terms are never committed by counting replicas;
    /// they become committed once a later current-term entry does (§5.4.2).
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            let term = self.get_term_at(n);
            if term < self.current_term {
                break;
            }
            if term == self.current_term {
                let replicas = 1 + self
                    .peers()
                    .filter(|p| self.match_index.get(p).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= self.quorum_size() {
                    tracing::debug!(node_id = self.id, from = self.commit_index, to = n, "advancing commit index");
                    self.commit_index = n;
                    return true;
                }
            }
            n -= 1;
        }
        false
    }

    // -- log replication (follower) --

    /// Server side of AppendEntries. The bool is true for any request from a
    /// current leader, which must reset the election timer.
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (self.reject_append(self.last_log_index() + 1), false);
        }
        if args.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(args.term);
        }
        self.leader_id = Some(args.leader_id);

        if args.prev_log_index > self.last_log_index() {
            return (self.reject_append(self.last_log_index() + 1), true);
        }
        if self.log.term_at(args.prev_log_index) != Some(args.prev_log_term) {
            let hint = self.log.first_index_of_term_at(args.prev_log_index);
            tracing::debug!(
                node_id = self.id,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                hint,
                "log mismatch"
            );
            return (self.reject_append(hint), true);
        }

        if self.log.merge_from(args.prev_log_index, &args.entries) {
            self.persist_pending = true;
        }

        let last_new = args.last_index();
        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        (
            AppendEntriesReply {
                term: self.current_term,
                success: true,
                hint_next_index: last_new + 1,
            },
            true,
        )
    }

    fn reject_append(&self, hint_next_index: u64) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success: false,
            hint_next_index,
        }
    }

    // -- state machine application --

    /// The committed entry right after `last_applied`, if any
    pub fn next_to_apply(&self) -> Option<LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        self.log.get(self.last_applied + 1).cloned()
    }

    /// Record that `index` has been delivered. Only the next index in
    /// sequence is accepted, so nothing is skipped or applied twice.
    pub fn mark_applied(&mut self, index: u64) -> bool {
        if index != self.last_applied + 1 || index > self.commit_index {
            return false;
        }
        self.last_applied = index;
        true
    }
}
