//! # transport
//!
//! why: decouple the node from how rpcs actually reach a peer
//! relations: called by driver.rs for outgoing rpcs, implemented by local.rs for in-process clusters
//! what: the async Transport trait

use async_trait::async_trait;
use raft_core::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, Result};

/// Client side of the peer-to-peer rpc surface.
///
/// The network may drop or delay messages but never forges them. Every call
/// must eventually return; a call that cannot complete returns
/// [`raft_core::RaftError::Transport`] and the node treats it as no
/// information gained.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_entries(&self, peer: u64, args: AppendEntriesArgs) -> Result<AppendEntriesReply>;
}
