//! # apply
//!
//! why: hand committed commands to the consuming service, in order, exactly once per index
//! relations: woken by node.rs and driver.rs whenever commit_index moves, reads raft-core's log
//! what: ApplyMsg and the applier task

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::node::Shared;

/// A committed command, ready for the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Deliver entries one at a time. `last_applied` only moves after the
/// channel accepted the entry, so a slow consumer stalls delivery instead
/// of losing it.
pub(crate) async fn run(shared: Arc<Shared>, apply_tx: mpsc::Sender<ApplyMsg>) {
    loop {
        let next = shared.inner.lock().core.next_to_apply();
        let entry = match next {
            Some(entry) => entry,
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.apply_notify.notified() => {}
                }
                continue;
            }
        };

        let index = entry.index;
        let msg = ApplyMsg {
            index,
            term: entry.term,
            command: entry.command,
        };
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            sent = apply_tx.send(msg) => {
                if sent.is_err() {
                    tracing::warn!(node_id = shared.id, "apply receiver dropped, stopping applier");
                    break;
                }
            }
        }

        shared.inner.lock().core.mark_applied(index);
        tracing::trace!(node_id = shared.id, index, "applied entry");
    }
    tracing::debug!(node_id = shared.id, "applier stopped");
}
