//! # cluster tests
//!
//! why: verify elections, replication and recovery with real timers and concurrent rpcs
//! relations: tests raft-runtime over LocalNetwork with raft-storage backends
//! what: leader election, commit and apply, partitions, catch-up, restarts, shutdown, storage failure

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use raft_core::{EncodedState, RequestVoteArgs};
use raft_runtime::{ApplyMsg, LocalNetwork, Node, NodeState, RaftConfig, RaftError};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().without_time().try_init();
}

struct Cluster {
    net: LocalNetwork,
    ids: Vec<u64>,
    storages: HashMap<u64, InMemoryStorage>,
    applied: HashMap<u64, mpsc::Receiver<ApplyMsg>>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        Self::with_configs((0..size).map(|_| RaftConfig::default()).collect())
    }

    /// One config per node, node ids start at 1
    fn with_configs(configs: Vec<RaftConfig>) -> Self {
        init_tracing();
        let ids: Vec<u64> = (1..=configs.len() as u64).collect();
        let mut cluster = Self {
            net: LocalNetwork::new(),
            ids,
            storages: HashMap::new(),
            applied: HashMap::new(),
        };
        for (id, config) in cluster.ids.clone().into_iter().zip(configs) {
            cluster.storages.insert(id, InMemoryStorage::new());
            cluster.start_node(id, config);
        }
        cluster
    }

    /// (Re)start `id` from whatever its storage holds
    fn start_node(&mut self, id: u64, config: RaftConfig) {
        let (apply_tx, apply_rx) = mpsc::channel(16);
        let node = Node::spawn(
            id,
            self.ids.clone(),
            config,
            Box::new(self.storages[&id].clone()),
            self.net.transport(id),
            apply_tx,
        )
        .unwrap();
        self.net.register(node);
        self.applied.insert(id, apply_rx);
    }

    fn node(&self, id: u64) -> Node {
        self.net.node(id).unwrap()
    }

    /// Leaders among the nodes that can still reach the network
    fn connected_leaders(&self) -> Vec<u64> {
        self.ids
            .iter()
            .copied()
            .filter(|&id| self.net.is_connected(id) && self.node(id).get_state().1)
            .collect()
    }

    async fn wait_for_leader(&self) -> u64 {
        for _ in 0..100 {
            sleep(Duration::from_millis(100)).await;
            if let [leader] = self.connected_leaders()[..] {
                return leader;
            }
        }
        panic!("no single leader elected");
    }

    async fn expect_applied(&mut self, id: u64, index: u64, command: &[u8]) {
        let rx = self.applied.get_mut(&id).unwrap();
        let msg = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("entry applied in time")
            .expect("apply channel open");
        assert_eq!(msg.index, index, "node {id} applied out of order");
        assert_eq!(msg.command, command.to_vec());
    }

    fn assert_nothing_applied(&mut self, id: u64) {
        assert!(self.applied.get_mut(&id).unwrap().try_recv().is_err());
    }

    fn shutdown(&self) {
        for &id in &self.ids {
            self.node(id).shutdown();
        }
    }
}

fn staggered(min: u64, max: u64) -> RaftConfig {
    RaftConfig {
        election_timeout_min: min,
        election_timeout_max: max,
        heartbeat_interval: 100,
    }
}

/// Storage that refuses every write
struct FailingStorage;

impl Storage for FailingStorage {
    fn save(&mut self, _term: &[u8], _voted_for: &[u8], _log: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    fn load(&self) -> io::Result<Option<EncodedState>> {
        Ok(None)
    }

    fn clear(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// SECTION 1: LEADER ELECTION
// =============================================================================

mod election {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn three_nodes_elect_exactly_one_leader() {
        let cluster = Cluster::new(3);

        let leader = cluster.wait_for_leader().await;
        sleep(Duration::from_secs(2)).await;

        // leadership is stable while nothing fails
        assert_eq!(cluster.connected_leaders(), vec![leader]);
        let (term, _) = cluster.node(leader).get_state();
        for &id in &cluster.ids {
            assert_eq!(cluster.node(id).get_state().0, term);
        }
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn first_election_settles_in_term_one() {
        let cluster = Cluster::with_configs(vec![
            staggered(550, 600),
            staggered(800, 883),
            staggered(800, 883),
        ]);

        let leader = cluster.wait_for_leader().await;

        assert_eq!(leader, 1);
        for &id in &cluster.ids {
            let status = cluster.node(id).status();
            assert_eq!(status.term, 1);
            assert_eq!(status.leader_id, Some(1));
            let expected = if id == 1 { NodeState::Leader } else { NodeState::Follower };
            assert_eq!(status.state, expected);
        }
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_elects_itself() {
        let cluster = Cluster::new(1);

        assert_eq!(cluster.wait_for_leader().await, 1);
        assert_eq!(cluster.node(1).get_state(), (1, true));
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn new_leader_elected_after_leader_is_cut_off() {
        let cluster = Cluster::new(3);
        let old = cluster.wait_for_leader().await;
        let (old_term, _) = cluster.node(old).get_state();

        cluster.net.disconnect(old);
        let new = cluster.wait_for_leader().await;

        assert_ne!(new, old);
        assert!(cluster.node(new).get_state().0 > old_term);

        // the old leader learns the newer term once it can talk again
        cluster.net.reconnect(old);
        sleep(Duration::from_secs(2)).await;
        let leaders: Vec<u64> = cluster.connected_leaders();
        assert_eq!(leaders.len(), 1);
        let (term, _) = cluster.node(leaders[0]).get_state();
        for &id in &cluster.ids {
            assert_eq!(cluster.node(id).get_state().0, term);
        }
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn minority_cannot_elect_a_leader() {
        let cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        for &id in &cluster.ids {
            cluster.net.disconnect(id);
        }

        sleep(Duration::from_secs(5)).await;

        for &id in cluster.ids.iter().filter(|&&id| id != leader) {
            assert!(!cluster.node(id).get_state().1, "node {id} won without a majority");
        }
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 2: REPLICATION AND APPLY
// =============================================================================

mod replication {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn committed_command_is_applied_once_everywhere() {
        let mut cluster = Cluster::with_configs(vec![
            staggered(550, 600),
            staggered(800, 883),
            staggered(800, 883),
        ]);
        let leader = cluster.wait_for_leader().await;

        let proposal = cluster.node(leader).start(b"x".to_vec()).unwrap();
        assert_eq!((proposal.index, proposal.term, proposal.is_leader), (1, 1, true));

        for id in cluster.ids.clone() {
            cluster.expect_applied(id, 1, b"x").await;
        }
        sleep(Duration::from_secs(1)).await;
        for id in cluster.ids.clone() {
            cluster.assert_nothing_applied(id);
            assert_eq!(cluster.node(id).status().commit_index, 1);
            assert_eq!(cluster.node(id).status().last_applied, 1);
        }
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn follower_rejects_start() {
        let cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let follower = cluster.ids.iter().copied().find(|&id| id != leader).unwrap();

        let proposal = cluster.node(follower).start(b"nope".to_vec()).unwrap();

        assert!(!proposal.is_leader);
        assert_eq!(proposal.index, 0);
        assert_eq!(cluster.node(follower).status().last_log_index, 0);
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_apply_in_submission_order() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;

        for i in 1..=5u8 {
            let proposal = cluster.node(leader).start(vec![i]).unwrap();
            assert_eq!(proposal.index, i as u64);
        }

        for id in cluster.ids.clone() {
            for i in 1..=5u8 {
                cluster.expect_applied(id, i as u64, &[i]).await;
            }
        }
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_follower_catches_up() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let lagging = cluster.ids.iter().copied().find(|&id| id != leader).unwrap();

        cluster.net.disconnect(lagging);
        for cmd in [b"a", b"b", b"c"] {
            cluster.node(leader).start(cmd.to_vec()).unwrap();
        }
        // a majority is still reachable
        cluster.expect_applied(leader, 1, b"a").await;
        cluster.expect_applied(leader, 2, b"b").await;
        cluster.expect_applied(leader, 3, b"c").await;
        cluster.assert_nothing_applied(lagging);

        cluster.net.reconnect(lagging);

        cluster.expect_applied(lagging, 1, b"a").await;
        cluster.expect_applied(lagging, 2, b"b").await;
        cluster.expect_applied(lagging, 3, b"c").await;
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn uncommitted_entries_of_a_partitioned_leader_are_replaced() {
        let mut cluster = Cluster::new(3);
        let old = cluster.wait_for_leader().await;

        cluster.net.disconnect(old);
        let stray = cluster.node(old).start(b"lost".to_vec()).unwrap();
        assert!(stray.is_leader);

        let new = cluster.wait_for_leader().await;
        cluster.node(new).start(b"kept".to_vec()).unwrap();
        cluster.expect_applied(new, 1, b"kept").await;

        cluster.net.reconnect(old);
        cluster.expect_applied(old, 1, b"kept").await;
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 3: RESTART AND PERSISTENCE
// =============================================================================

mod restart {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn restarted_node_recovers_persisted_state() {
        let mut cluster = Cluster::new(1);
        cluster.wait_for_leader().await;
        let node = cluster.node(1);
        node.start(b"a".to_vec()).unwrap();
        node.start(b"b".to_vec()).unwrap();
        cluster.expect_applied(1, 1, b"a").await;
        cluster.expect_applied(1, 2, b"b").await;
        node.shutdown();

        cluster.start_node(1, RaftConfig::default());
        let status = cluster.node(1).status();
        assert_eq!(status.state, NodeState::Follower);
        assert_eq!(status.term, 1);
        assert_eq!(status.last_log_index, 2);
        assert_eq!(status.commit_index, 0);

        cluster.wait_for_leader().await;
        assert_eq!(cluster.node(1).get_state(), (2, true));
        // entries from term 1 wait for an entry of the current term
        cluster.assert_nothing_applied(1);

        let proposal = cluster.node(1).start(b"c".to_vec()).unwrap();
        assert_eq!((proposal.index, proposal.term), (3, 2));
        cluster.expect_applied(1, 1, b"a").await;
        cluster.expect_applied(1, 2, b"b").await;
        cluster.expect_applied(1, 3, b"c").await;
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_follower_rejoins_cluster() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let follower = cluster.ids.iter().copied().find(|&id| id != leader).unwrap();
        cluster.node(leader).start(b"before".to_vec()).unwrap();
        cluster.expect_applied(follower, 1, b"before").await;

        let stopped = cluster.net.unregister(follower).unwrap();
        stopped.shutdown();
        assert!(cluster.net.node(follower).is_none());
        assert!(cluster.net.unregister(follower).is_none());
        // the leader keeps its seat while a peer is missing from the network
        sleep(Duration::from_secs(1)).await;
        assert!(cluster.node(leader).get_state().1);

        cluster.start_node(follower, RaftConfig::default());
        assert_eq!(cluster.node(follower).status().last_log_index, 1);

        let leader = cluster.wait_for_leader().await;
        cluster.node(leader).start(b"after".to_vec()).unwrap();
        cluster.expect_applied(follower, 1, b"before").await;
        cluster.expect_applied(follower, 2, b"after").await;
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn file_storage_backs_a_node() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let net = LocalNetwork::new();

        let (tx, mut rx) = mpsc::channel(4);
        let storage = FileStorage::new(dir.path()).unwrap();
        let node = Node::spawn(1, vec![1], RaftConfig::default(), Box::new(storage), net.transport(1), tx).unwrap();
        sleep(Duration::from_secs(2)).await;
        node.start(b"durable".to_vec()).unwrap();
        assert_eq!(rx.recv().await.unwrap().command, b"durable".to_vec());
        node.shutdown();

        let (tx, _rx) = mpsc::channel(4);
        let storage = FileStorage::new(dir.path()).unwrap();
        let node = Node::spawn(1, vec![1], RaftConfig::default(), Box::new(storage), net.transport(1), tx).unwrap();
        assert_eq!(node.status().last_log_index, 1);
        assert_eq!(node.get_state().0, 1);
        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_storage_is_rejected_at_startup() {
        let mut storage = InMemoryStorage::new();
        storage.save(b"oops", b"null", b"[]").unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let result = Node::spawn(
            1,
            vec![1],
            RaftConfig::default(),
            Box::new(storage),
            LocalNetwork::new().transport(1),
            tx,
        );

        assert!(matches!(result, Err(RaftError::Decode(_))));
    }
}

// =============================================================================
// SECTION 4: SHUTDOWN AND FAILURES
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent() {
        let cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;

        cluster.shutdown();
        cluster.shutdown();

        let node = cluster.node(leader);
        assert!(node.is_shutdown());
        assert!(matches!(node.start(b"late".to_vec()), Err(RaftError::Shutdown)));
        let args = RequestVoteArgs {
            term: 99,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(matches!(node.handle_request_vote(args), Err(RaftError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_cluster_stays_quiet() {
        let cluster = Cluster::new(3);
        cluster.wait_for_leader().await;
        cluster.shutdown();
        let before: Vec<u64> = cluster.ids.iter().map(|&id| cluster.node(id).get_state().0).collect();

        sleep(Duration::from_secs(10)).await;

        let after: Vec<u64> = cluster.ids.iter().map(|&id| cluster.node(id).get_state().0).collect();
        assert_eq!(before, after, "no elections after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_persist_halts_the_node() {
        init_tracing();
        let (tx, _rx) = mpsc::channel(1);
        let node = Node::spawn(
            1,
            vec![1, 2, 3],
            RaftConfig::default(),
            Box::new(FailingStorage),
            LocalNetwork::new().transport(1),
            tx,
        )
        .unwrap();

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(args);

        assert!(matches!(result, Err(RaftError::Storage(_))));
        assert!(node.is_shutdown());
        assert!(matches!(node.start(b"x".to_vec()), Err(RaftError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_persist_during_election_halts_the_node() {
        init_tracing();
        let (tx, _rx) = mpsc::channel(1);
        let node = Node::spawn(
            1,
            vec![1],
            RaftConfig::default(),
            Box::new(FailingStorage),
            LocalNetwork::new().transport(1),
            tx,
        )
        .unwrap();

        sleep(Duration::from_secs(2)).await;

        assert!(node.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let config = staggered(900, 500);

        let result = Node::spawn(
            1,
            vec![1, 2, 3],
            config,
            Box::new(InMemoryStorage::new()),
            LocalNetwork::new().transport(1),
            tx,
        );

        assert!(matches!(result, Err(RaftError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn node_must_belong_to_its_cluster() {
        let (tx, _rx) = mpsc::channel(1);

        let result = Node::spawn(
            7,
            vec![1, 2, 3],
            RaftConfig::default(),
            Box::new(InMemoryStorage::new()),
            LocalNetwork::new().transport(7),
            tx,
        );

        assert!(matches!(result, Err(RaftError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cluster_members_are_rejected() {
        let (tx, _rx) = mpsc::channel(1);

        let result = Node::spawn(
            1,
            vec![1, 2, 2, 3],
            RaftConfig::default(),
            Box::new(InMemoryStorage::new()),
            LocalNetwork::new().transport(1),
            tx,
        );

        assert!(matches!(result, Err(RaftError::Config(msg)) if msg.contains("node 2")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_delays_but_never_loses_entries() {
        init_tracing();
        let net = LocalNetwork::new();
        // room for a single undelivered entry
        let (tx, mut rx) = mpsc::channel(1);
        let node = Node::spawn(
            1,
            vec![1],
            RaftConfig::default(),
            Box::new(InMemoryStorage::new()),
            net.transport(1),
            tx,
        )
        .unwrap();
        sleep(Duration::from_secs(2)).await;

        for i in 1..=4u8 {
            node.start(vec![i]).unwrap();
        }
        sleep(Duration::from_secs(1)).await;
        assert!(node.status().last_applied < 4);

        for i in 1..=4u64 {
            assert_eq!(rx.recv().await.unwrap().index, i);
        }
        node.shutdown();
    }
}
