//! # error
//!
//! why: one error type for every fallible raft operation
//! relations: returned by persist.rs and config.rs, propagated by raft-runtime
//! what: RaftError enum and Result alias

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Persisted log is corrupt: {0}")]
    CorruptLog(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("RPC to node {peer} failed: {reason}")]
    Transport { peer: u64, reason: String },

    #[error("Node has been shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
