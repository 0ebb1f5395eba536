//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime, persisted through raft-storage
//! what: state machine, election logic, log management, message types, persistent-state codec

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod persist;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::{Log, LogEntry};
pub use message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use node::{NodeState, NodeStatus, RaftNode};
pub use persist::{EncodedState, PersistentState};
