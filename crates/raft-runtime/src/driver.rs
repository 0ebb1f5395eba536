//! # driver
//!
//! why: turn the passive core state machine into a live node
//! relations: spawned by node.rs, sends through transport.rs, folds replies back into raft-core
//! what: election timer, heartbeat ticker, concurrent RequestVote and AppendEntries fan-out

use std::sync::Arc;

use raft_core::{AppendEntriesArgs, NodeState, RequestVoteArgs};
use tokio::sync::mpsc;

use crate::node::Shared;

/// Wakeups for the driver loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// A current leader contacted us
    HeartbeatReceived,
    /// We granted our vote to a candidate
    VoteGranted,
    /// One of our vote requests won the election
    ElectionWon,
}

/// Main loop. Followers and candidates wait out a fresh randomized election
/// timeout, restarted by every event; leaders broadcast AppendEntries once
/// per heartbeat interval.
pub(crate) async fn run(shared: Arc<Shared>, mut events: mpsc::Receiver<Event>) {
    loop {
        let (is_leader, election_timeout, heartbeat) = {
            let inner = shared.inner.lock();
            let config = &inner.core.config;
            (
                inner.core.state == NodeState::Leader,
                config.random_election_timeout(),
                config.heartbeat(),
            )
        };

        if is_leader {
            broadcast_append_entries(&shared);
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(heartbeat) => {}
            }
            continue;
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => tracing::trace!(node_id = shared.id, ?event, "election timer reset"),
                None => break,
            },
            _ = tokio::time::sleep(election_timeout) => campaign(&shared),
        }
    }
    tracing::debug!(node_id = shared.id, "driver stopped");
}

/// Start an election and ask every peer for its vote.
fn campaign(shared: &Arc<Shared>) {
    let (request, peers) = {
        let mut inner = shared.inner.lock();
        // an ElectionWon can race the timer in select!
        if inner.core.state == NodeState::Leader {
            return;
        }
        let request = inner.core.start_election();
        if shared.flush(&mut inner).is_err() {
            return;
        }
        if inner.core.state == NodeState::Leader {
            return;
        }
        (request, inner.core.peers().collect::<Vec<_>>())
    };

    for peer in peers {
        tokio::spawn(request_vote(shared.clone(), peer, request.clone()));
    }
}

async fn request_vote(shared: Arc<Shared>, peer: u64, args: RequestVoteArgs) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let result = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        result = shared.transport.request_vote(peer, args.clone()) => result,
    };
    let reply = match result {
        Ok(reply) => reply,
        Err(err) => {
            tracing::trace!(node_id = shared.id, peer, error = %err, "RequestVote failed");
            return;
        }
    };
    if shared.shutdown.is_cancelled() {
        return;
    }

    let won = {
        let mut inner = shared.inner.lock();
        let won = inner.core.handle_vote_response(args.term, peer, &reply);
        if shared.flush(&mut inner).is_err() {
            return;
        }
        won
    };
    if won {
        shared.signal(Event::ElectionWon);
    }
}

/// Send every peer the entries it is missing, or an empty heartbeat.
fn broadcast_append_entries(shared: &Arc<Shared>) {
    let batches: Vec<(u64, AppendEntriesArgs)> = {
        let inner = shared.inner.lock();
        inner
            .core
            .peers()
            .filter_map(|peer| inner.core.create_append_entries(peer).map(|args| (peer, args)))
            .collect()
    };

    for (peer, args) in batches {
        tokio::spawn(append_entries(shared.clone(), peer, args));
    }
}

async fn append_entries(shared: Arc<Shared>, peer: u64, args: AppendEntriesArgs) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let result = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        result = shared.transport.append_entries(peer, args.clone()) => result,
    };
    let reply = match result {
        Ok(reply) => reply,
        Err(err) => {
            tracing::trace!(node_id = shared.id, peer, error = %err, "AppendEntries failed");
            return;
        }
    };
    if shared.shutdown.is_cancelled() {
        return;
    }

    let committed = {
        let mut inner = shared.inner.lock();
        let committed = inner.core.handle_append_entries_response(peer, &args, &reply);
        if shared.flush(&mut inner).is_err() {
            return;
        }
        committed
    };
    if committed {
        shared.apply_notify.notify_one();
    }
}
