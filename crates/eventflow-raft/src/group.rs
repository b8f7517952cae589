//! Per-block group driver.
//!
//! One tokio task per Raft group serializes everything for that block:
//! ticks, inbound messages, proposals, persistence, and apply. Listener
//! callbacks are pushed through a bounded queue drained by a second
//! dedicated task, so a slow listener backs up its queue instead of the
//! consensus loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use eventflow_core::BlockId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RaftError, Result};
use crate::node::RaftNode;
use crate::transport::RaftTransport;
use crate::types::{ConfChange, EntryKind, Message, SnapshotMeta};

/// Copy-on-write peer endpoint table shared by every group of one engine.
pub type PeerTable = Arc<RwLock<Arc<HashMap<u64, String>>>>;

pub fn peer_lookup(peers: &PeerTable, id: u64) -> Option<String> {
    let snapshot = peers.read().unwrap().clone();
    snapshot.get(&id).cloned()
}

/// Applies committed entries to the block behind this group.
#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    /// Append one committed record payload; returns the assigned offset.
    async fn apply(&self, index: u64, payload: Bytes) -> eventflow_core::Result<u64>;

    /// Number of records currently in the block (last offset + 1). Used to
    /// re-derive the applied index at recovery, since the hint store is
    /// only a lower bound.
    fn record_count(&self) -> u64;

    /// `(last_offset, crc)` of the durable block prefix, for snapshot
    /// references.
    async fn snapshot_state(&self) -> eventflow_core::Result<(i64, u32)>;
}

/// Fetches and installs block bytes when the leader sends a snapshot
/// reference instead of log entries.
#[async_trait::async_trait]
pub trait SnapshotInstaller: Send + Sync {
    async fn install(
        &self,
        meta: &SnapshotMeta,
        leader_endpoint: Option<String>,
    ) -> eventflow_core::Result<()>;
}

pub type LeaderChangedListener = Arc<dyn Fn(BlockId, u64, u64) + Send + Sync>;
pub type EntryAppendedListener = Arc<dyn Fn(BlockId, u64) + Send + Sync>;

#[derive(Debug)]
pub(crate) enum GroupEvent {
    LeaderChanged { leader: u64, term: u64 },
    EntryAppended { offset: u64 },
}

pub(crate) enum Cmd {
    Propose {
        payload: Bytes,
        reply: oneshot::Sender<Result<u64>>,
    },
    ProposeConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<Result<u64>>,
    },
    Step(Message),
    Campaign,
    Status {
        reply: oneshot::Sender<GroupStatus>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub leader: u64,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub is_leader: bool,
}

pub(crate) struct GroupHandle {
    pub tx: mpsc::Sender<Cmd>,
    pub task: JoinHandle<()>,
    pub events: JoinHandle<()>,
}

pub(crate) struct GroupContext {
    pub block: BlockId,
    pub applier: Arc<dyn Applier>,
    pub installer: Option<Arc<dyn SnapshotInstaller>>,
    pub transport: Arc<dyn RaftTransport>,
    pub peers: PeerTable,
    pub leader_changed: Option<LeaderChangedListener>,
    pub entry_appended: Option<EntryAppendedListener>,
    pub tick_interval: std::time::Duration,
    pub snapshot_threshold: u64,
}

pub(crate) fn spawn(mut node: RaftNode, ctx: GroupContext) -> GroupHandle {
    let (tx, rx) = mpsc::channel(1024);
    let (event_tx, mut event_rx) = mpsc::channel::<GroupEvent>(256);

    // Dedicated listener drain: callbacks for one block never run
    // concurrently with each other.
    let block = ctx.block;
    let leader_changed = ctx.leader_changed.clone();
    let entry_appended = ctx.entry_appended.clone();
    let events = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                GroupEvent::LeaderChanged { leader, term } => {
                    if let Some(f) = &leader_changed {
                        f(block, leader, term);
                    }
                }
                GroupEvent::EntryAppended { offset } => {
                    if let Some(f) = &entry_appended {
                        f(block, offset);
                    }
                }
            }
        }
    });

    let applied = recover_applied(&node, ctx.applier.as_ref());
    let task = tokio::spawn(async move {
        let mut driver = Driver {
            node: &mut node,
            ctx: &ctx,
            applied,
            pending: HashMap::new(),
            event_tx,
            failed: false,
        };
        driver.run(rx).await;
    });

    GroupHandle { tx, task, events }
}

/// Re-derive the applied index from the block's record count. Every Normal
/// entry appends exactly one record, so the applied index is the index of
/// the `record_count`-th Normal entry past the snapshot boundary.
fn recover_applied(node: &RaftNode, applier: &dyn Applier) -> u64 {
    let log = node.log();
    let snapshot_records = log
        .snapshot_meta()
        .ok()
        .flatten()
        .map(|s| (s.block_offset + 1) as u64)
        .unwrap_or(0);
    let block_records = applier.record_count();
    let mut records = snapshot_records;
    let mut applied = log.first_index().saturating_sub(1);
    let hint = log.applied_hint();
    for index in log.first_index()..=log.last_index().min(node.commit()) {
        if let Some(e) = log.entry(index) {
            if e.kind == EntryKind::Normal {
                if records == block_records {
                    break;
                }
                records += 1;
                applied = index;
            }
        }
    }
    // The record count is authoritative; the async hint may run ahead of a
    // block tail that was lost in a crash, in which case those entries
    // must re-apply. Non-record entries around the boundary re-apply
    // idempotently.
    debug!(
        block = %log.block(),
        applied,
        hint,
        block_records,
        "applied index recovered"
    );
    applied
}

struct Driver<'a> {
    node: &'a mut RaftNode,
    ctx: &'a GroupContext,
    applied: u64,
    pending: HashMap<u64, oneshot::Sender<Result<u64>>>,
    event_tx: mpsc::Sender<GroupEvent>,
    failed: bool,
}

impl Driver<'_> {
    async fn run(&mut self, mut rx: mpsc::Receiver<Cmd>) {
        let mut ticker = tokio::time::interval(self.ctx.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Cmd::Propose { payload, reply }) => self.on_propose(payload, reply),
                        Some(Cmd::ProposeConfChange { cc, reply }) => {
                            self.on_propose_conf(cc, reply)
                        }
                        Some(Cmd::Step(m)) => {
                            if !self.failed {
                                self.node.step(m);
                            }
                        }
                        Some(Cmd::Campaign) => {
                            if !self.failed {
                                self.node.campaign(false);
                            }
                        }
                        Some(Cmd::Status { reply }) => {
                            let _ = reply.send(GroupStatus {
                                leader: self.node.leader(),
                                term: self.node.term(),
                                commit: self.node.commit(),
                                applied: self.applied,
                                is_leader: self.node.is_leader(),
                            });
                        }
                        Some(Cmd::Stop) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !self.failed {
                        self.node.tick();
                    }
                }
            }
            if let Err(e) = self.handle_ready().await {
                // A storage failure leaves the group inoperable, loudly.
                error!(
                    block = %self.node.log().block(),
                    error = %e,
                    "raft group storage failure, group is now inoperable"
                );
                self.failed = true;
                self.fail_pending(|| RaftError::Stopped);
            }
        }
        self.fail_pending(|| RaftError::Stopped);
        info!(block = %self.node.log().block(), "raft group stopped");
    }

    fn on_propose(&mut self, payload: Bytes, reply: oneshot::Sender<Result<u64>>) {
        if self.failed {
            let _ = reply.send(Err(RaftError::Stopped));
            return;
        }
        match self.node.propose(payload) {
            Ok(index) => {
                self.pending.insert(index, reply);
            }
            Err(_) => {
                let _ = reply.send(Err(self.not_leader()));
            }
        }
    }

    fn on_propose_conf(&mut self, cc: ConfChange, reply: oneshot::Sender<Result<u64>>) {
        if self.failed {
            let _ = reply.send(Err(RaftError::Stopped));
            return;
        }
        match self.node.propose_conf_change(cc) {
            Ok(index) => {
                self.pending.insert(index, reply);
            }
            Err(RaftError::NotLeader { .. }) => {
                let _ = reply.send(Err(self.not_leader()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn not_leader(&self) -> RaftError {
        let leader = self.node.leader();
        let hint = if leader == 0 {
            None
        } else {
            peer_lookup(&self.ctx.peers, leader)
        };
        RaftError::NotLeader { leader: hint }
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    async fn handle_ready(&mut self) -> Result<()> {
        loop {
            let ready = self.node.take_ready();
            let quiet = ready.is_empty() && ready.commit <= self.applied;
            if quiet {
                return Ok(());
            }

            // 1. Persistence, entries before hard state: the durable commit
            //    index must never point past durable entries.
            if !ready.entries.is_empty() {
                self.node.log_mut().append(&ready.entries).await?;
            }
            if let Some(hs) = ready.hard_state {
                self.node.log().set_hard_state(&hs).await?;
            }

            // 2. Leadership bookkeeping.
            if let Some((leader, term)) = ready.leader_changed {
                if leader != self.node.id() {
                    let hint = self.not_leader();
                    for (_, reply) in self.pending.drain() {
                        let _ = reply.send(Err(clone_not_leader(&hint)));
                    }
                }
                let _ = self
                    .event_tx
                    .send(GroupEvent::LeaderChanged { leader, term })
                    .await;
            }

            // 3. Messages, only after persistence.
            for m in ready.messages {
                self.send_message(m).await;
            }

            // 4. Snapshot installation (follower).
            if let Some(meta) = ready.snapshot {
                self.install_snapshot(meta).await?;
            }

            // 5. Apply.
            self.apply_to(ready.commit).await?;
        }
    }

    async fn send_message(&self, m: Message) {
        let Some(endpoint) = peer_lookup(&self.ctx.peers, m.to) else {
            debug!(to = format_args!("{:016X}", m.to), "no endpoint for peer, dropping message");
            return;
        };
        if let Err(e) = self.ctx.transport.send(&endpoint, m).await {
            // Raft's own retries (heartbeats, response-driven resends) make
            // per-message delivery best effort.
            debug!(endpoint = %endpoint, error = %e, "raft send failed");
        }
    }

    async fn install_snapshot(&mut self, meta: SnapshotMeta) -> Result<()> {
        let leader = self.node.leader();
        let endpoint = peer_lookup(&self.ctx.peers, leader);
        let outcome = match &self.ctx.installer {
            Some(installer) => installer.install(&meta, endpoint).await,
            None => Err(eventflow_core::Error::InvalidRequest(
                "no snapshot installer wired".into(),
            )),
        };
        match outcome {
            Ok(()) => {
                info!(
                    block = %self.node.log().block(),
                    last_index = meta.last_index,
                    "snapshot installed"
                );
                self.node.log_mut().reset_to_snapshot(&meta).await?;
                self.applied = meta.last_index;
                self.node.log().set_applied_hint(self.applied);
                self.node.snapshot_installed(&meta, leader);
            }
            Err(e) => {
                warn!(
                    block = %self.node.log().block(),
                    error = %e,
                    "snapshot install failed"
                );
                self.node.snapshot_failed(leader);
            }
        }
        Ok(())
    }

    async fn apply_to(&mut self, commit: u64) -> Result<()> {
        while self.applied < commit {
            let index = self.applied + 1;
            let Some(entry) = self.node.log().entry(index) else {
                // Commit never outruns persistence, so a hole here is real
                // storage damage.
                return Err(RaftError::Apply(format!(
                    "committed entry {index} missing from log"
                )));
            };
            match entry.kind {
                EntryKind::Normal => {
                    let offset = self
                        .ctx
                        .applier
                        .apply(index, entry.payload.clone())
                        .await
                        .map_err(|e| RaftError::Apply(e.to_string()))?;
                    if let Some(reply) = self.pending.remove(&index) {
                        let _ = reply.send(Ok(offset));
                    }
                    let _ = self
                        .event_tx
                        .send(GroupEvent::EntryAppended { offset })
                        .await;
                }
                EntryKind::ConfChange => {
                    let cc = ConfChange::decode(entry.payload.clone())?;
                    let conf = self.node.apply_conf_change(&cc);
                    self.node.log().set_conf_state(&conf).await?;
                    if let Some(reply) = self.pending.remove(&index) {
                        let _ = reply.send(Ok(0));
                    }
                }
                EntryKind::Noop => {}
            }
            self.applied = index;
        }
        self.node.log().set_applied_hint(self.applied);
        self.maybe_compact().await
    }

    async fn maybe_compact(&mut self) -> Result<()> {
        let log = self.node.log();
        if log.bytes_since(self.applied) < self.ctx.snapshot_threshold
            || self.applied < log.first_index()
        {
            return Ok(());
        }
        let Ok((block_offset, block_crc)) = self.ctx.applier.snapshot_state().await else {
            return Ok(());
        };
        let Some(last_term) = log.term(self.applied) else {
            return Ok(());
        };
        let meta = SnapshotMeta {
            last_index: self.applied,
            last_term,
            block_offset,
            block_crc,
            conf: self.node.conf().clone(),
        };
        info!(
            block = %self.node.log().block(),
            last_index = meta.last_index,
            block_offset,
            "compacting log into snapshot reference"
        );
        self.node.log_mut().compact(&meta).await?;
        Ok(())
    }
}

fn clone_not_leader(err: &RaftError) -> RaftError {
    match err {
        RaftError::NotLeader { leader } => RaftError::NotLeader {
            leader: leader.clone(),
        },
        _ => RaftError::ProposalDropped,
    }
}
