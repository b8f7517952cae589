//! One block bound to one Raft group.
//!
//! The replica is the unit the server reasons about: it owns the client
//! append/read semantics, the apply path from Raft into the block file,
//! and a small state machine:
//!
//! ```text
//! Recovering ──(open ok)──► CatchingUp ──(applied == committed)──► Serving
//!        │                      │                                     │
//!        ▼                      ▼                                     ▼
//!     Failed                 Failed                               Draining
//! ```
//!
//! Only a `Serving` leader accepts appends; reads are allowed from
//! `CatchingUp` on (they return whatever prefix is locally durable).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use eventflow_core::{AppendRecord, BlockId, Entry, Error, Result};
use eventflow_raft::{Appender, RaftTransport, SnapshotMeta};
use eventflow_vsb::format::FRAME_OVERHEAD;
use eventflow_vsb::{Block, Engine};
use tracing::{info, warn};

/// Shared, swappable handle to the underlying block. Snapshot installation
/// replaces the file and swaps the handle.
pub type SharedBlock = Arc<RwLock<Arc<Block>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Recovering,
    CatchingUp,
    Serving,
    Failed,
    Draining,
}

pub struct Replica {
    id: BlockId,
    block: SharedBlock,
    appender: Appender,
    state: RwLock<ReplicaState>,
    is_leader: AtomicBool,
    leader_hint: RwLock<Option<String>>,
    /// Held by the controller-forgotten quarantine policy: excluded from
    /// reports and never serves.
    quarantined: AtomicBool,
    /// Serializes client append batches so the capacity pre-check sees the
    /// true block size. A full block must be caught here, before the
    /// proposal: a `BlockFull` at apply time would poison the Raft group.
    append_gate: tokio::sync::Mutex<()>,
}

impl Replica {
    pub fn new(id: BlockId, block: SharedBlock, appender: Appender) -> Arc<Self> {
        Arc::new(Self {
            id,
            block,
            appender,
            state: RwLock::new(ReplicaState::Recovering),
            is_leader: AtomicBool::new(false),
            leader_hint: RwLock::new(None),
            quarantined: AtomicBool::new(false),
            append_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn block(&self) -> Arc<Block> {
        self.block.read().unwrap().clone()
    }

    pub fn shared_block(&self) -> SharedBlock {
        self.block.clone()
    }

    pub fn appender(&self) -> &Appender {
        &self.appender
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: ReplicaState) {
        *self.state.write().unwrap() = state;
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::Release);
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    /// Called from the leader-changed listener.
    pub fn on_leader_changed(&self, leader: u64, endpoint: Option<String>) {
        let leads = leader == self.id.as_u64();
        self.is_leader.store(leads, Ordering::Release);
        *self.leader_hint.write().unwrap() = if leads {
            None
        } else {
            endpoint
        };
    }

    /// Flip `CatchingUp` to `Serving` once applied has caught the commit
    /// index. Cheap; invoked from the heartbeat tick.
    pub async fn refresh_state(&self) {
        if self.state() != ReplicaState::CatchingUp {
            return;
        }
        if let Ok(status) = self.appender.status().await {
            if status.applied >= status.commit {
                self.set_state(ReplicaState::Serving);
                info!(block_id = %self.id, "replica caught up, now serving");
            }
        }
    }

    /// Replicated append: one Raft proposal per record, resolved to block
    /// offsets after commit + apply. Offsets come back dense and in order.
    pub async fn append(&self, records: Vec<AppendRecord>) -> Result<Vec<u64>> {
        match self.state() {
            ReplicaState::Serving => {}
            ReplicaState::Recovering | ReplicaState::CatchingUp => {
                return Err(Error::Transient("replica is catching up".into()));
            }
            ReplicaState::Failed => {
                return Err(Error::Fatal("replica has failed".into()));
            }
            ReplicaState::Draining => {
                return Err(Error::Transient("replica is draining".into()));
            }
        }
        if self.is_quarantined() {
            return Err(Error::InvalidRequest("block is quarantined".into()));
        }
        if !self.is_leader() {
            return Err(Error::NotLeader {
                leader: self.leader_hint.read().unwrap().clone(),
            });
        }
        if records.is_empty() {
            return Err(Error::InvalidRequest("no records to append".into()));
        }

        // One batch at a time: with the gate held until every offset has
        // resolved, the capacity pre-check below sees the true block size,
        // and a full block is reported here instead of failing at apply
        // time inside the Raft group.
        let _gate = self.append_gate.lock().await;
        let block = self.block();
        let stat = block.stat();
        if stat.archived {
            return Err(Error::BlockFull);
        }
        let incoming: u64 = records
            .iter()
            .map(|r| FRAME_OVERHEAD + r.encoded_len() as u64)
            .sum();
        if stat.size + incoming > stat.capacity {
            // Seal the block; the controller sees the archived flag in the
            // next report and rolls the segment.
            block.archive().await.map_err(Error::from)?;
            return Err(Error::BlockFull);
        }

        // Proposals from one task keep their order through the group's
        // command queue, so awaiting them in sequence order is safe.
        let mut pending = Vec::with_capacity(records.len());
        for record in &records {
            pending.push(self.appender.propose(record.encode()));
        }
        let mut offsets = Vec::with_capacity(records.len());
        for fut in pending {
            offsets.push(fut.await.map_err(eventflow_core::Error::from)?);
        }
        Ok(offsets)
    }

    /// Read locally durable entries from `offset`.
    pub async fn read(&self, offset: u64, max_bytes: u64) -> Result<Vec<Entry>> {
        match self.state() {
            ReplicaState::Recovering => {
                return Err(Error::Transient("replica is recovering".into()));
            }
            ReplicaState::Failed => {
                return Err(Error::Fatal("replica has failed".into()));
            }
            _ => {}
        }
        if self.is_quarantined() {
            return Err(Error::InvalidRequest("block is quarantined".into()));
        }
        let block = self.block();
        block.read(offset, max_bytes).await.map_err(Error::from)
    }

    pub fn stat(&self) -> eventflow_vsb::BlockStat {
        self.block().stat()
    }

    pub fn drain(&self) {
        self.set_state(ReplicaState::Draining);
    }
}

/// Raft apply target writing into the block file.
pub struct BlockApplier {
    block: SharedBlock,
}

impl BlockApplier {
    pub fn new(block: SharedBlock) -> Arc<Self> {
        Arc::new(Self { block })
    }

    fn current(&self) -> Arc<Block> {
        self.block.read().unwrap().clone()
    }
}

#[async_trait]
impl eventflow_raft::Applier for BlockApplier {
    async fn apply(&self, _index: u64, payload: Bytes) -> Result<u64> {
        // The committed payload is the producer's record, stored verbatim
        // so a read round-trips byte-identically.
        let record = AppendRecord::decode(payload.clone())?;
        let block = self.current();
        let offset = block
            .append_batch(std::iter::once((payload.as_ref(), record.timestamp_ns)))
            .await
            .map_err(Error::from)?;
        Ok(offset[0])
    }

    fn record_count(&self) -> u64 {
        (self.current().last_offset() + 1) as u64
    }

    async fn snapshot_state(&self) -> Result<(i64, u32)> {
        let block = self.current();
        block.flush().await.map_err(Error::from)?;
        let bytes = tokio::fs::read(block.path())
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        Ok((block.last_offset(), crc32fast::hash(&bytes)))
    }
}

/// Installs a snapshot by bulk-fetching the leader's block file and
/// renaming it into place.
pub struct BlockSnapshotInstaller {
    id: BlockId,
    block: SharedBlock,
    engine: Arc<Engine>,
    transport: Arc<dyn RaftTransport>,
}

impl BlockSnapshotInstaller {
    pub fn new(
        id: BlockId,
        block: SharedBlock,
        engine: Arc<Engine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            block,
            engine,
            transport,
        })
    }
}

#[async_trait]
impl eventflow_raft::SnapshotInstaller for BlockSnapshotInstaller {
    async fn install(&self, meta: &SnapshotMeta, leader_endpoint: Option<String>) -> Result<()> {
        let endpoint = leader_endpoint
            .ok_or_else(|| Error::Transient("leader endpoint unknown for snapshot".into()))?;
        let bytes = self
            .transport
            .fetch_block(&endpoint, self.id)
            .await
            .map_err(eventflow_core::Error::from)?;
        if meta.block_crc != 0 && crc32fast::hash(&bytes) != meta.block_crc {
            return Err(Error::Corrupt("snapshot block digest mismatch".into()));
        }

        let path = self.current_path();
        let tmp = path.with_extension("vsb.fetch");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        let fresh = self.engine.reopen(self.id).await.map_err(Error::from)?;
        if fresh.last_offset() != meta.block_offset {
            warn!(
                block_id = %self.id,
                got = fresh.last_offset(),
                want = meta.block_offset,
                "fetched block does not reach the snapshot offset"
            );
        }
        *self.block.write().unwrap() = fresh;
        info!(block_id = %self.id, last_offset = meta.block_offset, "block snapshot installed");
        Ok(())
    }
}

impl BlockSnapshotInstaller {
    fn current_path(&self) -> std::path::PathBuf {
        self.block.read().unwrap().path().to_path_buf()
    }
}
