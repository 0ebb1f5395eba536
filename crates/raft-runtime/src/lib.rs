//! # raft-runtime
//!
//! why: run raft-core's state machine on tokio with real timers and concurrent rpcs
//! relations: drives raft-core, persists through raft-storage, talks to peers via a Transport
//! what: Node handle, driver loop, apply pipeline, Transport trait, in-process LocalNetwork

mod apply;
mod driver;
pub mod local;
mod node;
pub mod transport;

pub use apply::ApplyMsg;
pub use local::LocalNetwork;
pub use node::{Node, Proposal};
pub use transport::Transport;

pub use raft_core::{NodeState, NodeStatus, RaftConfig, RaftError, Result};
