//! # log
//!
//! why: manage the ordered log of commands that raft replicates
//! relations: owned by node.rs, shipped inside message.rs, persisted via persist.rs
//! what: LogEntry struct, sentinel-based Log with consistency and conflict helpers

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed, 0 is the sentinel)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    fn sentinel() -> Self {
        Self::new(0, 0, Vec::new())
    }
}

/// The node's log.
///
/// Position 0 always holds a sentinel entry with index 0 and term 0, so
/// `prev_log_index = 0` matches on every node and real entries start at 1.
/// Indices are contiguous: the entry at position `i` has index `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// An empty log holding only the sentinel
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    /// Rebuild a log from recovered entries (sentinel excluded).
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        let mut log = Self::new();
        for (offset, entry) in entries.into_iter().enumerate() {
            let expected = offset as u64 + 1;
            if entry.index != expected {
                return Err(RaftError::CorruptLog(format!(
                    "expected index {expected}, found {}",
                    entry.index
                )));
            }
            if entry.term < log.last_term() {
                return Err(RaftError::CorruptLog(format!(
                    "term decreases at index {expected}"
                )));
            }
            log.entries.push(entry);
        }
        Ok(log)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Number of real entries (the sentinel is not counted)
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at `index`; the sentinel is never returned.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Term of the entry at `index`, `Some(0)` for the sentinel.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// Real entries in index order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries[1..]
    }

    /// Clone of every entry with index >= `start`
    pub fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        let start = start.max(1) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    /// Leader path: append a new entry at `last_index + 1`.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> &LogEntry {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        &self.entries[index as usize]
    }

    /// Follower path: place `entries` right after `prev_index`.
    ///
    /// An existing entry is only dropped, together with everything after it,
    /// when an incoming entry at the same index carries a different term.
    /// Entries that already match are kept, so a delayed or duplicated
    /// request can never shorten the log. Returns true if the log changed.
    pub fn merge_from(&mut self, prev_index: u64, entries: &[LogEntry]) -> bool {
        let mut changed = false;
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => self.entries.truncate(index as usize),
                None => {}
            }
            let mut entry = entry.clone();
            entry.index = index;
            self.entries.push(entry);
            changed = true;
        }
        changed
    }

    /// First index holding the same term as the entry at `index`.
    ///
    /// Used as the retry hint when `prev_log_term` conflicts, so the leader
    /// can skip the whole conflicting term in one round trip.
    pub fn first_index_of_term_at(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > 1 && self.entries[first as usize - 1].term == term {
            first -= 1;
        }
        first.max(1)
    }

    /// Candidate up-to-date check (§5.4.1)
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index())
    }
}
