//! # persist
//!
//! why: define what raft must write to stable storage and how it is encoded
//! relations: snapshot taken from node.rs, bytes handed to raft-storage backends
//! what: PersistentState (currentTerm, votedFor, log) and its three-part codec

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::{Log, LogEntry};

/// Persistent state on all servers (currentTerm, votedFor, log[])
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Log,
}

/// Encoded persistent state, one opaque blob per field
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodedState {
    pub term: Vec<u8>,
    pub voted_for: Vec<u8>,
    pub log: Vec<u8>,
}

impl PersistentState {
    pub fn encode(&self) -> Result<EncodedState> {
        Ok(EncodedState {
            term: serde_json::to_vec(&self.current_term)?,
            voted_for: serde_json::to_vec(&self.voted_for)?,
            log: serde_json::to_vec(self.log.entries())?,
        })
    }

    /// Decode state written by `encode`; the log is checked for contiguity.
    pub fn decode(encoded: &EncodedState) -> Result<Self> {
        let current_term: u64 = serde_json::from_slice(&encoded.term)?;
        let voted_for: Option<u64> = serde_json::from_slice(&encoded.voted_for)?;
        let entries: Vec<LogEntry> = serde_json::from_slice(&encoded.log)?;
        Ok(Self {
            current_term,
            voted_for,
            log: Log::from_entries(entries)?,
        })
    }
}
