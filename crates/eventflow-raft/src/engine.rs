//! Multi-group Raft engine.
//!
//! The segment server owns exactly one engine. It recovers one group per
//! surviving block, routes inbound messages to the right group task, keeps
//! the copy-on-write peer endpoint table, and hands out [`Appender`]
//! handles that replicas use to propose.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use eventflow_core::BlockId;
use eventflow_meta::{AsyncStore, SyncStore};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::group::{
    self, Applier, Cmd, EntryAppendedListener, GroupContext, GroupHandle, GroupStatus,
    LeaderChangedListener, PeerTable, SnapshotInstaller,
};
use crate::log::RaftLog;
use crate::node::RaftNode;
use crate::transport::RaftTransport;
use crate::types::{ConfChange, ConfState, Message};

/// What a group needs from its block to participate: the apply target and,
/// optionally, a snapshot installer.
pub struct GroupSeed {
    pub applier: Arc<dyn Applier>,
    pub installer: Option<Arc<dyn SnapshotInstaller>>,
}

/// Handle for proposing to one group. Clone-friendly.
#[derive(Clone)]
pub struct Appender {
    block: BlockId,
    tx: tokio::sync::mpsc::Sender<Cmd>,
}

impl Appender {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Propose a record payload; resolves to the assigned block offset
    /// once the entry commits and applies.
    pub async fn propose(&self, payload: Bytes) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Propose { payload, reply })
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn propose_conf_change(&self, cc: ConfChange) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::ProposeConfChange { cc, reply })
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Start an immediate election (leader transfer target).
    pub async fn campaign(&self) -> Result<()> {
        self.tx
            .send(Cmd::Campaign)
            .await
            .map_err(|_| RaftError::Stopped)
    }

    pub async fn status(&self) -> Result<GroupStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub async fn is_leader(&self) -> bool {
        self.status().await.map(|s| s.is_leader).unwrap_or(false)
    }
}

pub struct RaftEngineBuilder {
    local_addr: String,
    config: RaftConfig,
    meta: Arc<SyncStore>,
    hints: Arc<AsyncStore>,
    transport: Arc<dyn RaftTransport>,
    leader_changed: Option<LeaderChangedListener>,
    entry_appended: Option<EntryAppendedListener>,
}

impl RaftEngineBuilder {
    pub fn new(
        local_addr: impl Into<String>,
        meta: Arc<SyncStore>,
        hints: Arc<AsyncStore>,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            config: RaftConfig::default(),
            meta,
            hints,
            transport,
            leader_changed: None,
            entry_appended: None,
        }
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn leader_changed_listener(
        mut self,
        f: impl Fn(BlockId, u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.leader_changed = Some(Arc::new(f));
        self
    }

    pub fn entry_appended_listener(
        mut self,
        f: impl Fn(BlockId, u64) + Send + Sync + 'static,
    ) -> Self {
        self.entry_appended = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<RaftEngine> {
        Arc::new(RaftEngine {
            local_addr: self.local_addr,
            config: self.config,
            meta: self.meta,
            hints: self.hints,
            transport: self.transport,
            peers: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
            groups: Mutex::new(HashMap::new()),
            leader_changed: self.leader_changed,
            entry_appended: self.entry_appended,
        })
    }
}

pub struct RaftEngine {
    local_addr: String,
    config: RaftConfig,
    meta: Arc<SyncStore>,
    hints: Arc<AsyncStore>,
    transport: Arc<dyn RaftTransport>,
    peers: PeerTable,
    groups: Mutex<HashMap<BlockId, GroupHandle>>,
    leader_changed: Option<LeaderChangedListener>,
    entry_appended: Option<EntryAppendedListener>,
}

impl RaftEngine {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Update the peer endpoint table. Copy-on-write: readers hold a cheap
    /// snapshot, the table swaps atomically.
    pub fn register_node_record(&self, node: u64, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        let mut table = self.peers.write().unwrap();
        let mut next = HashMap::clone(&table);
        next.insert(node, endpoint);
        *table = Arc::new(next);
    }

    pub fn peer_endpoint(&self, node: u64) -> Option<String> {
        group::peer_lookup(&self.peers, node)
    }

    /// Rebuild Raft state for every recovered block. Returns appenders for
    /// blocks with Raft metadata and the ids of blocks without any — the
    /// caller decides their fate (deletion, or quarantine in debug mode).
    pub fn recover(
        self: &Arc<Self>,
        seeds: HashMap<BlockId, GroupSeed>,
    ) -> Result<(HashMap<BlockId, Appender>, Vec<BlockId>)> {
        let mut appenders = HashMap::new();
        let mut orphans = Vec::new();
        for (block, seed) in seeds {
            let log = RaftLog::recover(block, self.meta.clone(), self.hints.clone())?;
            if !log.has_state() {
                warn!(block = %block, "block has no raft metadata");
                orphans.push(block);
                continue;
            }
            let appender = self.spawn_group(log, seed, ConfState::default())?;
            appenders.insert(block, appender);
        }
        info!(
            recovered = appenders.len(),
            orphaned = orphans.len(),
            "raft engine recovered"
        );
        Ok((appenders, orphans))
    }

    /// Create a brand-new group for `block` with the given voter set (the
    /// block ids of all replicas, this one included).
    pub async fn create_group(
        self: &Arc<Self>,
        block: BlockId,
        voters: Vec<u64>,
        seed: GroupSeed,
    ) -> Result<Appender> {
        let log = RaftLog::recover(block, self.meta.clone(), self.hints.clone())?;
        let conf = ConfState {
            voters,
            learners: Vec::new(),
        };
        // Persist membership immediately so a crash before the first entry
        // still recovers a well-formed group.
        log.set_conf_state(&conf).await?;
        self.spawn_group(log, seed, conf)
    }

    fn spawn_group(
        self: &Arc<Self>,
        log: RaftLog,
        seed: GroupSeed,
        initial_conf: ConfState,
    ) -> Result<Appender> {
        let block = log.block();
        let node = RaftNode::new(block.as_u64(), log, self.config.clone(), initial_conf)?;
        let ctx = GroupContext {
            block,
            applier: seed.applier,
            installer: seed.installer,
            transport: self.transport.clone(),
            peers: self.peers.clone(),
            leader_changed: self.leader_changed.clone(),
            entry_appended: self.entry_appended.clone(),
            tick_interval: self.config.heartbeat_interval(),
            snapshot_threshold: self.config.snapshot_threshold,
        };
        let handle = group::spawn(node, ctx);
        let appender = Appender {
            block,
            tx: handle.tx.clone(),
        };
        self.groups.lock().unwrap().insert(block, handle);
        Ok(appender)
    }

    /// Route one inbound message to its group. Unknown groups are dropped
    /// with a warning: the peer may be ahead of our reconciliation.
    pub async fn handle_message(&self, msg: Message) {
        let tx = {
            let groups = self.groups.lock().unwrap();
            groups.get(&BlockId::from_u64(msg.to)).map(|g| g.tx.clone())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(Cmd::Step(msg)).await;
            }
            None => {
                warn!(
                    to = format_args!("{:016X}", msg.to),
                    "message for unknown raft group dropped"
                );
            }
        }
    }

    /// Stop one group and erase its persistent state (block removal).
    pub async fn remove_group(&self, block: BlockId) -> Result<()> {
        let handle = self.groups.lock().unwrap().remove(&block);
        if let Some(handle) = handle {
            let _ = handle.tx.send(Cmd::Stop).await;
            let _ = handle.task.await;
            let _ = handle.events.await;
        }
        let log = RaftLog::recover(block, self.meta.clone(), self.hints.clone())?;
        log.destroy().await?;
        info!(block = %block, "raft group removed");
        Ok(())
    }

    pub fn group_ids(&self) -> Vec<BlockId> {
        self.groups.lock().unwrap().keys().copied().collect()
    }

    /// Stop every group. Idempotent; the stores are closed by the caller
    /// that owns them.
    pub async fn close(&self) {
        let handles: Vec<(BlockId, GroupHandle)> =
            self.groups.lock().unwrap().drain().collect();
        for (block, handle) in handles {
            let _ = handle.tx.send(Cmd::Stop).await;
            if handle.task.await.is_err() {
                warn!(block = %block, "raft group task panicked during shutdown");
            }
            let _ = handle.events.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InboundHandler, MemoryNetwork};
    use crate::types::ConfChangeKind;
    use eventflow_meta::{AsyncStoreConfig, SyncStoreConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Applies records into a plain Vec, standing in for a VSB block.
    struct VecApplier {
        records: Mutex<Vec<Bytes>>,
        applied: AtomicU64,
    }

    impl VecApplier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
                applied: AtomicU64::new(0),
            })
        }

        fn payloads(&self) -> Vec<Bytes> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Applier for VecApplier {
        async fn apply(&self, index: u64, payload: Bytes) -> eventflow_core::Result<u64> {
            let mut records = self.records.lock().unwrap();
            records.push(payload);
            self.applied.store(index, Ordering::SeqCst);
            Ok(records.len() as u64 - 1)
        }

        fn record_count(&self) -> u64 {
            self.records.lock().unwrap().len() as u64
        }

        async fn snapshot_state(&self) -> eventflow_core::Result<(i64, u32)> {
            Ok((self.records.lock().unwrap().len() as i64 - 1, 0))
        }
    }

    struct EngineInbound(Arc<RaftEngine>);

    #[async_trait::async_trait]
    impl InboundHandler for EngineInbound {
        async fn handle_message(&self, msg: Message) {
            self.0.handle_message(msg).await;
        }

        async fn read_block(&self, _block: BlockId) -> eventflow_core::Result<Bytes> {
            Err(eventflow_core::Error::InvalidRequest("not served".into()))
        }
    }

    struct Peer {
        engine: Arc<RaftEngine>,
        applier: Arc<VecApplier>,
        appender: Appender,
        hints: Arc<AsyncStore>,
        _dir: TempDir,
    }

    async fn cluster(net: &MemoryNetwork, ids: &[u64]) -> Vec<Peer> {
        let mut peers = Vec::new();
        for &id in ids {
            let dir = TempDir::new().unwrap();
            let meta = Arc::new(
                SyncStore::recover(dir.path().join("meta"), SyncStoreConfig::default())
                    .await
                    .unwrap(),
            );
            let hints =
                AsyncStore::recover(dir.path().join("offset"), AsyncStoreConfig::default())
                    .await
                    .unwrap();
            let endpoint = format!("node-{id}");
            let config = RaftConfig {
                // Short timeouts keep the tests fast.
                election_timeout_ms: 100,
                heartbeat_interval_ms: 10,
                ..RaftConfig::default()
            };
            let engine = RaftEngineBuilder::new(
                endpoint.clone(),
                meta,
                hints.clone(),
                Arc::new(net.transport(endpoint.clone())),
            )
            .config(config)
            .build();
            net.register(endpoint, Arc::new(EngineInbound(engine.clone())));

            let applier = VecApplier::new();
            let appender = engine
                .create_group(
                    BlockId::from_u64(id),
                    ids.to_vec(),
                    GroupSeed {
                        applier: applier.clone(),
                        installer: None,
                    },
                )
                .await
                .unwrap();
            for &peer in ids {
                engine.register_node_record(peer, format!("node-{peer}"));
            }
            peers.push(Peer {
                engine,
                applier,
                appender,
                hints,
                _dir: dir,
            });
        }
        peers
    }

    async fn teardown(peers: Vec<Peer>) {
        for p in &peers {
            p.engine.close().await;
        }
        for p in &peers {
            p.hints.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_single_node_propose_applies() {
        let net = MemoryNetwork::new();
        let peers = cluster(&net, &[1]).await;
        peers[0].appender.campaign().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let offset = peers[0]
            .appender
            .propose(Bytes::from("hello"))
            .await
            .unwrap();
        assert_eq!(offset, 0);
        let offset = peers[0]
            .appender
            .propose(Bytes::from("world"))
            .await
            .unwrap();
        assert_eq!(offset, 1);
        assert_eq!(
            peers[0].applier.payloads(),
            vec![Bytes::from("hello"), Bytes::from("world")]
        );
        teardown(peers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_replication() {
        let net = MemoryNetwork::new();
        let peers = cluster(&net, &[1, 2, 3]).await;
        peers[0].appender.campaign().await.unwrap();

        // Wait for the election to settle.
        let mut elected = false;
        for _ in 0..100 {
            if peers[0].appender.is_leader().await {
                elected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(elected, "node 1 should win its own campaign");

        let mut offsets = Vec::new();
        for i in 0..10 {
            offsets.push(
                peers[0]
                    .appender
                    .propose(Bytes::from(format!("r{i}")))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(offsets, (0..10).collect::<Vec<u64>>());

        // Followers converge on the same record sequence.
        for _ in 0..200 {
            if peers.iter().all(|p| p.applier.record_count() == 10) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for p in &peers {
            assert_eq!(p.applier.payloads(), peers[0].applier.payloads());
        }
        teardown(peers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_propose_on_follower_returns_leader_hint() {
        let net = MemoryNetwork::new();
        let peers = cluster(&net, &[1, 2, 3]).await;
        peers[0].appender.campaign().await.unwrap();
        for _ in 0..100 {
            if peers[0].appender.is_leader().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let the followers learn the leader through a heartbeat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = peers[1]
            .appender
            .propose(Bytes::from("wrong node"))
            .await
            .unwrap_err();
        match err {
            RaftError::NotLeader { leader } => {
                assert_eq!(leader.as_deref(), Some("node-1"));
            }
            other => panic!("expected NotLeader, got {other}"),
        }
        teardown(peers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leader_failover_preserves_commits() {
        let net = MemoryNetwork::new();
        let peers = cluster(&net, &[1, 2, 3]).await;
        peers[0].appender.campaign().await.unwrap();
        for _ in 0..100 {
            if peers[0].appender.is_leader().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for i in 0..50 {
            peers[0]
                .appender
                .propose(Bytes::from(format!("e{i}")))
                .await
                .unwrap();
        }

        // Kill the leader outright.
        net.unregister("node-1");
        peers[0].engine.close().await;

        // A survivor takes over; its randomized timeout fires on its own.
        let mut new_leader = None;
        for _ in 0..300 {
            for p in &peers[1..] {
                if p.appender.is_leader().await {
                    new_leader = Some(p);
                }
            }
            if new_leader.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let new_leader = new_leader.expect("a new leader must emerge");

        // All 50 committed records survive on the new leader.
        for _ in 0..100 {
            if new_leader.applier.record_count() == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let payloads = new_leader.applier.payloads();
        assert_eq!(payloads.len(), 50);
        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(p, &Bytes::from(format!("e{i}")), "record {i}");
        }

        // And the new leader keeps accepting appends.
        let offset = new_leader
            .appender
            .propose(Bytes::from("after failover"))
            .await
            .unwrap();
        assert_eq!(offset, 50);
        teardown(peers).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_rebuilds_groups_and_reports_orphans() {
        let net = MemoryNetwork::new();
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(
            SyncStore::recover(dir.path().join("meta"), SyncStoreConfig::default())
                .await
                .unwrap(),
        );
        let hints = AsyncStore::recover(dir.path().join("offset"), AsyncStoreConfig::default())
            .await
            .unwrap();
        let engine = RaftEngineBuilder::new(
            "solo",
            meta.clone(),
            hints.clone(),
            Arc::new(net.transport("solo")),
        )
        .build();
        net.register("solo", Arc::new(EngineInbound(engine.clone())));
        engine.register_node_record(9, "solo");

        let applier = VecApplier::new();
        let appender = engine
            .create_group(
                BlockId::from_u64(9),
                vec![9],
                GroupSeed {
                    applier: applier.clone(),
                    installer: None,
                },
            )
            .await
            .unwrap();
        appender.campaign().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        appender.propose(Bytes::from("persisted")).await.unwrap();
        engine.close().await;

        // Reopen: block 9 has raft state, block 10 does not.
        let engine = RaftEngineBuilder::new(
            "solo",
            meta,
            hints.clone(),
            Arc::new(net.transport("solo")),
        )
        .build();
        let applier2 = VecApplier::new();
        // Replay everything: the fake block starts empty again.
        let mut seeds = HashMap::new();
        seeds.insert(
            BlockId::from_u64(9),
            GroupSeed {
                applier: applier2.clone(),
                installer: None,
            },
        );
        seeds.insert(
            BlockId::from_u64(10),
            GroupSeed {
                applier: VecApplier::new(),
                installer: None,
            },
        );
        let (appenders, orphans) = engine.recover(seeds).unwrap();
        assert_eq!(appenders.len(), 1);
        assert!(appenders.contains_key(&BlockId::from_u64(9)));
        assert_eq!(orphans, vec![BlockId::from_u64(10)]);

        // The empty applier is caught up from the recovered log.
        for _ in 0..100 {
            if applier2.record_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(applier2.payloads(), vec![Bytes::from("persisted")]);
        engine.close().await;
        hints.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_membership_add_learner_then_promote() {
        let net = MemoryNetwork::new();
        let peers = cluster(&net, &[1, 2, 3]).await;
        peers[0].appender.campaign().await.unwrap();
        for _ in 0..100 {
            if peers[0].appender.is_leader().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        peers[0]
            .appender
            .propose_conf_change(ConfChange {
                kind: ConfChangeKind::AddLearner,
                node: 4,
            })
            .await
            .unwrap();
        peers[0]
            .appender
            .propose_conf_change(ConfChange {
                kind: ConfChangeKind::AddVoter,
                node: 4,
            })
            .await
            .unwrap();
        let status = peers[0].appender.status().await.unwrap();
        assert!(status.is_leader);
        teardown(peers).await;
    }
}
