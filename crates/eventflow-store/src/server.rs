//! Segment server lifecycle.
//!
//! Startup is a strict sequence; a failure at any step aborts it:
//!
//! 1. Load the VSB engine from `volume.dir/block` and discover every
//!    block's tail state.
//! 2. Recover the meta stores from `volume.dir/meta` and
//!    `volume.dir/offset`, then build the Raft engine over them.
//! 3. Pair recovered blocks with their Raft groups; blocks without Raft
//!    metadata are deleted (kept on disk with `debug_retain_orphans`).
//! 4. Enter `Started`.
//! 5. Debug mode: allocate a test id and go straight to `Running`.
//!    Otherwise register with the controller, adopt the assigned server
//!    id, and reconcile segment assignments into the Raft peer table.
//!
//! Background work (heartbeats, liveness) attaches to the server's own
//! shutdown scope, never to a caller's deadline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{BufMut, BytesMut};
use eventflow_core::{id as core_id, BlockId, Error, Result, SegmentId, ServerId, ServerState};
use eventflow_meta::{AsyncStore, SyncStore};
use eventflow_raft::{GroupSeed, RaftEngine, RaftEngineBuilder, RaftTransport};
use eventflow_vsb::Engine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::controller::{BlockReport, ControllerClient, SegmentAssignment};
use crate::registry::{EngineKind, EngineRegistry};
use crate::replica::{BlockApplier, BlockSnapshotInstaller, Replica, ReplicaState, SharedBlock};

pub struct Server {
    config: StoreConfig,
    registry: Arc<EngineRegistry>,
    controller: Arc<dyn ControllerClient>,
    transport: Arc<dyn RaftTransport>,

    state: RwLock<ServerState>,
    id: RwLock<ServerId>,

    raft: Mutex<Option<Arc<RaftEngine>>>,
    hints: Mutex<Option<Arc<AsyncStore>>>,
    meta: Mutex<Option<Arc<SyncStore>>>,

    replicas: RwLock<HashMap<BlockId, Arc<Replica>>>,
    segments: RwLock<HashMap<SegmentId, BlockId>>,

    // Serializes the archived and entry-appended callbacks of one block.
    block_locks: Mutex<HashMap<BlockId, Arc<Mutex<()>>>>,

    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        config: StoreConfig,
        registry: Arc<EngineRegistry>,
        controller: Arc<dyn ControllerClient>,
        transport: Arc<dyn RaftTransport>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            controller,
            transport,
            state: RwLock::new(ServerState::Initializing),
            id: RwLock::new(ServerId::NONE),
            raft: Mutex::new(None),
            hints: Mutex::new(None),
            meta: Mutex::new(None),
            replicas: RwLock::new(HashMap::new()),
            segments: RwLock::new(HashMap::new()),
            block_locks: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.read().unwrap()
    }

    pub fn server_id(&self) -> ServerId {
        *self.id.read().unwrap()
    }

    pub fn local_addr(&self) -> String {
        self.config.local_addr()
    }

    pub fn replica(&self, block: BlockId) -> Option<Arc<Replica>> {
        self.replicas.read().unwrap().get(&block).cloned()
    }

    pub fn raft(&self) -> Option<Arc<RaftEngine>> {
        self.raft.lock().unwrap().clone()
    }

    fn vsb(&self) -> Result<Arc<Engine>> {
        self.registry
            .resolve(EngineKind::Vsb)
            .ok_or_else(|| Error::Fatal("vsb engine not loaded".into()))
    }

    fn block_lock(&self, block: BlockId) -> Arc<Mutex<()>> {
        self.block_locks
            .lock()
            .unwrap()
            .entry(block)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.load_vsb_engine().await?;
        self.init_raft_engine().await?;
        self.recover_replicas().await?;

        *self.state.write().unwrap() = ServerState::Started;

        if self.config.debug {
            info!("segment server debug mode enabled");
            *self.id.write().unwrap() = ServerId::from_u64(core_id::new_test_id());
            self.start(None).await?;
        } else {
            self.register_self().await?;
        }
        Ok(())
    }

    async fn load_vsb_engine(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let listener: eventflow_vsb::ArchivedListener = Box::new(move |block| {
            if let Some(server) = weak.upgrade() {
                server.on_block_archived(block);
            }
        });
        let engine = Engine::load(self.config.block_dir(), self.config.vsb.clone(), Some(listener))
            .await
            .map_err(Error::from)?;
        self.registry.insert(EngineKind::Vsb, Arc::new(engine));
        Ok(())
    }

    async fn init_raft_engine(self: &Arc<Self>) -> Result<()> {
        let meta = Arc::new(
            SyncStore::recover(self.config.meta_dir(), self.config.meta_store.clone())
                .await
                .map_err(Error::from)?,
        );
        let hints = AsyncStore::recover(self.config.offset_dir(), self.config.offset_store.clone())
            .await
            .map_err(Error::from)?;

        let leader_weak = Arc::downgrade(self);
        let append_weak = Arc::downgrade(self);
        let raft = RaftEngineBuilder::new(
            self.config.local_addr(),
            meta.clone(),
            hints.clone(),
            self.transport.clone(),
        )
        .config(self.config.raft.clone())
        .leader_changed_listener(move |block, leader, term| {
            if let Some(server) = leader_weak.upgrade() {
                server.on_leader_changed(block, leader, term);
            }
        })
        .entry_appended_listener(move |block, offset| {
            if let Some(server) = append_weak.upgrade() {
                server.on_entry_appended(block, offset);
            }
        })
        .build();

        *self.meta.lock().unwrap() = Some(meta);
        *self.hints.lock().unwrap() = Some(hints);
        *self.raft.lock().unwrap() = Some(raft);
        Ok(())
    }

    async fn recover_replicas(self: &Arc<Self>) -> Result<()> {
        let vsb = self.vsb()?;
        let raft = self.raft().ok_or_else(|| Error::Fatal("raft not initialized".into()))?;
        let raws = vsb.recover().await.map_err(Error::from)?;

        let mut seeds = HashMap::new();
        let mut shared: HashMap<BlockId, SharedBlock> = HashMap::new();
        for (id, block) in &raws {
            let handle: SharedBlock = Arc::new(RwLock::new(block.clone()));
            seeds.insert(
                *id,
                GroupSeed {
                    applier: BlockApplier::new(handle.clone()),
                    installer: Some(BlockSnapshotInstaller::new(
                        *id,
                        handle.clone(),
                        vsb.clone(),
                        self.transport.clone(),
                    )),
                },
            );
            shared.insert(*id, handle);
        }

        let (appenders, orphans) = raft.recover(seeds).map_err(eventflow_core::Error::from)?;

        for id in orphans {
            if self.config.debug_retain_orphans {
                warn!(block_id = %id, "block has no raft record, retained for inspection");
            } else {
                warn!(block_id = %id, "block has no raft record, deleting");
                if let Err(e) = vsb.remove(id).await {
                    error!(block_id = %id, error = %e, "failed to delete orphan block");
                }
            }
        }

        let mut replicas = self.replicas.write().unwrap();
        for (id, appender) in appenders {
            let handle = shared.remove(&id).expect("seed for every appender");
            let replica = Replica::new(id, handle, appender);
            replica.set_state(ReplicaState::CatchingUp);
            replicas.insert(id, replica);
        }
        info!(replicas = replicas.len(), "replicas recovered");
        Ok(())
    }

    async fn register_self(self: &Arc<Self>) -> Result<()> {
        let start = std::time::Instant::now();
        info!("connecting to controller");
        self.controller.wait_for_ready().await?;
        let resp = self
            .controller
            .register_segment_server(
                &self.config.local_addr(),
                self.config.volume.id.into(),
                self.config.volume.capacity,
            )
            .await?;
        info!(used = ?start.elapsed(), server_id = %resp.server_id, "connected to controller");
        *self.id.write().unwrap() = resp.server_id;

        if !resp.segments.is_empty() {
            self.reconcile_segments(&resp.segments);
        }
        self.quarantine_unassigned(&resp.segments);
        Ok(())
    }

    /// Map segment assignments onto local replicas and the Raft peer
    /// table.
    pub fn reconcile_segments(&self, segments: &HashMap<SegmentId, SegmentAssignment>) {
        let my_volume = eventflow_core::VolumeId::from_u64(self.config.volume.id);
        for segment in segments.values() {
            if segment.replicas.is_empty() {
                continue;
            }
            let mut my_block = BlockId::NONE;
            for (&block_id, replica) in &segment.replicas {
                // Volume id, not address, decides which replica is ours.
                if replica.volume == my_volume {
                    if !my_block.is_none() {
                        warn!(
                            block_id = %block_id,
                            other = %my_block,
                            segment_id = %segment.id,
                            "multiple blocks of the same segment on this server"
                        );
                    }
                    my_block = block_id;
                }
            }
            if my_block.is_none() {
                warn!(
                    segment_id = %segment.id,
                    "no block of the segment on this server"
                );
                continue;
            }
            self.segments.write().unwrap().insert(segment.id, my_block);
            self.register_replicas(segment);
        }
    }

    fn register_replicas(&self, segment: &SegmentAssignment) {
        let Some(raft) = self.raft() else {
            return;
        };
        let my_volume = eventflow_core::VolumeId::from_u64(self.config.volume.id);
        for (&block_id, replica) in &segment.replicas {
            let endpoint = if replica.endpoint.is_empty() {
                if replica.volume == my_volume {
                    self.config.local_addr()
                } else {
                    info!(
                        block_id = %block_id,
                        segment_id = %segment.id,
                        eventlog_id = %segment.eventlog,
                        volume_id = %replica.volume,
                        "block is offline"
                    );
                    continue;
                }
            } else {
                replica.endpoint.clone()
            };
            raft.register_node_record(block_id.as_u64(), endpoint);
        }
    }

    /// Quarantine policy for controller-forgotten blocks: a replica with
    /// Raft state but no assignment stays out of serving and out of block
    /// reports; its files are retained. The controller alone may order
    /// destruction of replicated state.
    fn quarantine_unassigned(&self, segments: &HashMap<SegmentId, SegmentAssignment>) {
        let assigned: HashSet<BlockId> = segments
            .values()
            .flat_map(|s| s.replicas.keys().copied())
            .collect();
        for (id, replica) in self.replicas.read().unwrap().iter() {
            if !assigned.contains(id) {
                warn!(
                    block_id = %id,
                    "controller does not know this block, quarantining"
                );
                replica.quarantine();
            }
        }
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Enter `Running` and start the heartbeat task. Invoked by the
    /// controller's `Start` RPC, or directly in debug mode.
    pub async fn start(self: &Arc<Self>, expected_id: Option<ServerId>) -> Result<()> {
        if let Some(expected) = expected_id {
            let id = self.server_id();
            if !id.is_none() && id != expected {
                return Err(Error::InvalidRequest(format!(
                    "server id mismatch: got {expected}, registered as {id}"
                )));
            }
        }
        {
            let mut state = self.state.write().unwrap();
            match *state {
                ServerState::Running => return Ok(()),
                ServerState::Stopping => {
                    return Err(Error::InvalidRequest("server is stopping".into()))
                }
                _ => *state = ServerState::Running,
            }
        }
        self.spawn_heartbeat();
        info!(server_id = %self.server_id(), "segment server running");
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let server = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.heartbeat_interval();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                server.heartbeat_tick().await;
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    async fn heartbeat_tick(self: &Arc<Self>) {
        let replicas: Vec<Arc<Replica>> =
            self.replicas.read().unwrap().values().cloned().collect();
        let mut reports = Vec::with_capacity(replicas.len());
        for replica in &replicas {
            replica.refresh_state().await;
            if replica.is_quarantined() {
                continue;
            }
            let stat = replica.stat();
            reports.push(BlockReport {
                block: stat.id,
                size: stat.size,
                first_offset: stat.first_offset,
                last_offset: stat.last_offset,
                archived: stat.archived,
                is_leader: replica.is_leader(),
            });
        }
        if self.config.debug {
            return;
        }
        if let Err(e) = self.controller.heartbeat(self.server_id(), reports).await {
            warn!(error = %e, "controller heartbeat failed");
        }
    }

    // ------------------------------------------------------------------
    // Block management (service layer calls these)
    // ------------------------------------------------------------------

    /// Create a block and its Raft group. `members` maps every replica's
    /// block id to its endpoint; a single-member group elects itself
    /// immediately.
    pub async fn create_block(
        self: &Arc<Self>,
        block_id: BlockId,
        capacity: u64,
        members: HashMap<u64, String>,
    ) -> Result<()> {
        if self.replica(block_id).is_some() {
            return Err(Error::InvalidRequest(format!(
                "block {block_id} already exists"
            )));
        }
        let vsb = self.vsb()?;
        let raft = self.raft().ok_or_else(|| Error::Fatal("raft not initialized".into()))?;

        let block = vsb.create(block_id, capacity).await.map_err(Error::from)?;
        let handle: SharedBlock = Arc::new(RwLock::new(block));

        let mut voters: Vec<u64> = members.keys().copied().collect();
        if voters.is_empty() {
            voters.push(block_id.as_u64());
        }
        voters.sort_unstable();
        for (&node, endpoint) in &members {
            if !endpoint.is_empty() {
                raft.register_node_record(node, endpoint.clone());
            }
        }
        raft.register_node_record(block_id.as_u64(), self.config.local_addr());

        let single = voters.len() == 1;
        let appender = raft
            .create_group(
                block_id,
                voters,
                GroupSeed {
                    applier: BlockApplier::new(handle.clone()),
                    installer: Some(BlockSnapshotInstaller::new(
                        block_id,
                        handle.clone(),
                        vsb.clone(),
                        self.transport.clone(),
                    )),
                },
            )
            .await
            .map_err(eventflow_core::Error::from)?;
        if single {
            appender
                .campaign()
                .await
                .map_err(eventflow_core::Error::from)?;
        }

        let replica = Replica::new(block_id, handle, appender);
        replica.set_state(ReplicaState::CatchingUp);
        self.replicas.write().unwrap().insert(block_id, replica);
        info!(block_id = %block_id, capacity, "block created");
        Ok(())
    }

    pub async fn remove_block(self: &Arc<Self>, block_id: BlockId) -> Result<()> {
        let Some(replica) = self.replicas.write().unwrap().remove(&block_id) else {
            return Err(Error::InvalidRequest(format!("unknown block {block_id}")));
        };
        replica.drain();
        if let Some(raft) = self.raft() {
            raft.remove_group(block_id)
                .await
                .map_err(eventflow_core::Error::from)?;
        }
        self.vsb()?.remove(block_id).await.map_err(Error::from)?;
        self.segments
            .write()
            .unwrap()
            .retain(|_, b| *b != block_id);
        info!(block_id = %block_id, "block removed");
        Ok(())
    }

    /// Make `target_leader` (a local block) lead its segment's group.
    pub async fn activate_segment(
        self: &Arc<Self>,
        segment: SegmentId,
        target_leader: BlockId,
    ) -> Result<()> {
        let mapped = self.segments.read().unwrap().get(&segment).copied();
        let block = match mapped {
            Some(block) if block == target_leader => block,
            Some(other) => {
                return Err(Error::InvalidRequest(format!(
                    "segment {segment} maps to block {other} on this server"
                )));
            }
            None => target_leader,
        };
        let Some(replica) = self.replica(block) else {
            return Err(Error::InvalidRequest(format!("unknown block {block}")));
        };
        self.segments.write().unwrap().insert(segment, block);
        replica.set_state(ReplicaState::Serving);
        replica
            .appender()
            .campaign()
            .await
            .map_err(eventflow_core::Error::from)?;
        info!(segment_id = %segment, block_id = %block, "segment activated");
        Ok(())
    }

    /// Stop accepting client appends on this segment's local replica.
    pub async fn inactivate_segment(self: &Arc<Self>, segment: SegmentId) -> Result<()> {
        let mapped = self.segments.read().unwrap().get(&segment).copied();
        let Some(block) = mapped else {
            return Err(Error::InvalidRequest(format!("unknown segment {segment}")));
        };
        let Some(replica) = self.replica(block) else {
            return Err(Error::InvalidRequest(format!("unknown block {block}")));
        };
        replica.drain();
        info!(segment_id = %segment, block_id = %block, "segment inactivated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listener callbacks (serialized per block)
    // ------------------------------------------------------------------

    fn on_block_archived(&self, block: BlockId) {
        let lock = self.block_lock(block);
        let _guard = lock.lock().unwrap();
        info!(block_id = %block, "block archived");
        // The next heartbeat reports the archived flag from the block stat.
    }

    fn on_leader_changed(&self, block: BlockId, leader: u64, term: u64) {
        let lock = self.block_lock(block);
        let _guard = lock.lock().unwrap();
        let endpoint = self.raft().and_then(|r| r.peer_endpoint(leader));
        if let Some(replica) = self.replica(block) {
            replica.on_leader_changed(leader, endpoint);
        }
        info!(
            block_id = %block,
            leader = format_args!("{leader:016X}"),
            term,
            "leader changed"
        );
    }

    fn on_entry_appended(&self, block: BlockId, offset: u64) {
        let lock = self.block_lock(block);
        let _guard = lock.lock().unwrap();
        // High-water read offset hint; async store, loss tolerated.
        if let Some(hints) = self.hints.lock().unwrap().clone() {
            let mut buf = BytesMut::with_capacity(8);
            buf.put_u64_le(offset);
            let _ = hints.set(format!("block/{block}/read"), buf.freeze());
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: cancel background tasks, drain replicas, stop
    /// Raft, flush and close the engines and stores. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.write().unwrap();
            if *state == ServerState::Stopping {
                return;
            }
            *state = ServerState::Stopping;
        }
        info!("segment server stopping");
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for replica in self.replicas.read().unwrap().values() {
            replica.drain();
        }
        if let Some(raft) = self.raft.lock().unwrap().take() {
            raft.close().await;
        }
        self.registry.close_all().await;
        if let Some(hints) = self.hints.lock().unwrap().take() {
            if let Err(e) = hints.close().await {
                warn!(error = %e, "offset store close failed");
            }
        }
        if let Some(meta) = self.meta.lock().unwrap().take() {
            if let Err(e) = meta.close().await {
                warn!(error = %e, "meta store close failed");
            }
        }
        info!("segment server stopped");
    }
}
