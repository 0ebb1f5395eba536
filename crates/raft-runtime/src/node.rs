//! # node
//!
//! why: give callers a cheap, cloneable handle to a running raft node
//! relations: wraps raft-core's RaftNode and a raft-storage backend, spawns driver.rs and apply.rs
//! what: Node handle, Proposal, construction from persisted state, rpc entry points, shutdown
//!
//! All node state sits behind one `parking_lot::Mutex`. The lock is never
//! held across an `.await`; anything that needs the network or the apply
//! channel copies what it needs out first.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeStatus, PersistentState, RaftConfig, RaftError, RaftNode,
    RequestVoteArgs, RequestVoteReply, Result,
};
use raft_storage::Storage;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::apply::{self, ApplyMsg};
use crate::driver::{self, Event};
use crate::transport::Transport;

const EVENT_BUFFER: usize = 64;

/// Outcome of [`Node::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Log index assigned to the command, 0 when `is_leader` is false
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}

pub(crate) struct Inner {
    pub(crate) core: RaftNode,
    storage: Box<dyn Storage>,
}

impl Inner {
    /// Write term, vote and log if any of them changed since the last save.
    fn persist(&mut self) -> Result<()> {
        if !self.core.take_persist_pending() {
            return Ok(());
        }
        let encoded = self.core.persistent_state().encode()?;
        self.storage.save(&encoded.term, &encoded.voted_for, &encoded.log)?;
        Ok(())
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) apply_notify: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    /// Persist pending changes. A failed write halts the node: an
    /// unpersisted term, vote or entry must never become visible.
    pub(crate) fn flush(&self, inner: &mut Inner) -> Result<()> {
        if let Err(err) = inner.persist() {
            tracing::error!(node_id = self.id, error = %err, "failed to persist raft state, halting node");
            self.shutdown.cancel();
            return Err(err);
        }
        Ok(())
    }

    /// Wake the driver. A full buffer already holds a pending wakeup.
    pub(crate) fn signal(&self, event: Event) {
        let _ = self.events.try_send(event);
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Shutdown);
        }
        Ok(())
    }
}

/// Handle to a running raft node. Clones refer to the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) shared: Arc<Shared>,
}

impl Node {
    /// Build a node from whatever `storage` holds and start its background
    /// tasks. Must be called from inside a tokio runtime.
    ///
    /// Committed entries are delivered on `apply_tx` in index order. The
    /// channel's capacity bounds how far delivery may run ahead of the
    /// consumer.
    pub fn spawn(
        id: u64,
        cluster: Vec<u64>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        config.validate()?;
        if !cluster.contains(&id) {
            return Err(RaftError::Config(format!("node {id} is not a member of {cluster:?}")));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cluster.iter().find(|&&member| !seen.insert(member)) {
            return Err(RaftError::Config(format!("node {dup} appears more than once in {cluster:?}")));
        }

        let persisted = match storage.load()? {
            Some(encoded) => PersistentState::decode(&encoded)?,
            None => PersistentState::default(),
        };
        tracing::info!(
            node_id = id,
            term = persisted.current_term,
            last_log_index = persisted.log.last_index(),
            "starting raft node"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            id,
            inner: Mutex::new(Inner {
                core: RaftNode::restore(id, cluster, config, persisted),
                storage,
            }),
            transport,
            events: events_tx,
            apply_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(driver::run(shared.clone(), events_rx));
        tokio::spawn(apply::run(shared.clone(), apply_tx));

        Ok(Self { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// (currentTerm, isLeader)
    pub fn get_state(&self) -> (u64, bool) {
        self.shared.inner.lock().core.get_state()
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.inner.lock().core.status()
    }

    /// Propose `command` for replication.
    ///
    /// Returns immediately. A leader appends and persists the entry and
    /// ships it with the next heartbeat; there is no promise it commits.
    /// A non-leader assigns nothing and reports `is_leader: false`.
    pub fn start(&self, command: Vec<u8>) -> Result<Proposal> {
        self.shared.ensure_running()?;

        let mut inner = self.shared.inner.lock();
        let Some(entry) = inner.core.append_entry(command) else {
            return Ok(Proposal {
                index: 0,
                term: inner.core.current_term,
                is_leader: false,
            });
        };
        self.shared.flush(&mut inner)?;

        // a single-node cluster is its own majority
        if inner.core.advance_commit_index() {
            self.shared.apply_notify.notify_one();
        }

        Ok(Proposal {
            index: entry.index,
            term: entry.term,
            is_leader: true,
        })
    }

    /// RequestVote server side
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.shared.ensure_running()?;

        let (reply, granted) = {
            let mut inner = self.shared.inner.lock();
            let (reply, granted) = inner.core.handle_vote_request(&args);
            self.shared.flush(&mut inner)?;
            (reply, granted)
        };

        if granted {
            self.shared.signal(Event::VoteGranted);
        }
        Ok(reply)
    }

    /// AppendEntries server side
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        self.shared.ensure_running()?;

        let (reply, reset, committed) = {
            let mut inner = self.shared.inner.lock();
            let before = inner.core.commit_index;
            let (reply, reset) = inner.core.handle_append_entries(&args);
            self.shared.flush(&mut inner)?;
            (reply, reset, inner.core.commit_index > before)
        };

        if reset {
            self.shared.signal(Event::HeartbeatReceived);
        }
        if committed {
            self.shared.apply_notify.notify_one();
        }
        Ok(reply)
    }

    /// Stop the driver and the applier. Safe to call more than once; after
    /// it returns no new rpc is sent and no further entry is delivered.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::info!(node_id = self.shared.id, "shutting down raft node");
        }
        self.shared.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}
