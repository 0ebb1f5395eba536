//! # message
//!
//! why: define the raft rpc message types exchanged between peers
//! relations: produced and consumed by node.rs, carried by raft-runtime's transport
//! what: RequestVote and AppendEntries argument/reply structs

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Invoked by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Voter's current term, for the candidate to update itself
    pub term: u64,
    pub vote_granted: bool,
}

/// Invoked by the leader to replicate entries; an empty batch is a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    /// Index of the last entry carried, or `prev_log_index` for a heartbeat
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Where the leader should resume replication for this follower
    pub hint_next_index: u64,
}
