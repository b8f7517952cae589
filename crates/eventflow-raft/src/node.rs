//! The single-group consensus state machine.
//!
//! `RaftNode` is deterministic and synchronous: feed it steps (inbound
//! messages), ticks, and proposals, then drain a [`Ready`] bundle. The
//! caller (the group driver) must:
//!
//! 1. persist `entries` and `hard_state` from the bundle,
//! 2. only then send `messages`,
//! 3. apply log entries up to `commit`,
//! 4. install `snapshot` if present before acknowledging it.
//!
//! That ordering is what makes the usual Raft durability arguments hold;
//! the node itself only mutates memory.
//!
//! Calibration: pre-vote is always on, election timeouts are randomized in
//! [1×, 2×] of the configured base, heartbeats double as the replication
//! retry mechanism.

use std::collections::HashMap;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::types::{
    ConfChange, ConfChangeKind, ConfState, EntryKind, HardState, LogEntry, Message, MessageKind,
    SnapshotMeta,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    match_index: u64,
    next_index: u64,
    pending_snapshot: bool,
}

/// Everything the driver must act on after one or more state transitions.
#[derive(Debug, Default)]
pub struct Ready {
    /// New entries to persist (append, possibly truncating a conflicting
    /// suffix).
    pub entries: Vec<LogEntry>,
    /// Hard state to persist, if it changed.
    pub hard_state: Option<HardState>,
    /// Messages to send after persistence.
    pub messages: Vec<Message>,
    /// Apply log entries up to this index.
    pub commit: u64,
    /// A snapshot to fetch and install (follower side).
    pub snapshot: Option<SnapshotMeta>,
    /// Leader change to announce: (leader id, term). Leader 0 = unknown.
    pub leader_changed: Option<(u64, u64)>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.hard_state.is_none()
            && self.messages.is_empty()
            && self.snapshot.is_none()
            && self.leader_changed.is_none()
    }
}

pub struct RaftNode {
    id: u64,
    log: RaftLog,
    config: RaftConfig,

    role: Role,
    term: u64,
    vote: u64,
    commit: u64,
    leader: u64,
    conf: ConfState,

    // Volatile mirrors of the log bounds, including not-yet-persisted
    // entries already handed out through `Ready`.
    last_index: u64,
    last_term: u64,

    progress: HashMap<u64, Progress>,
    votes: HashMap<u64, bool>,
    /// Index of an uncommitted conf change, if any; enforces one at a time.
    pending_conf_index: u64,

    elapsed: u64,
    timeout_ticks: u64,

    ready: Ready,
    hs_dirty: bool,
}

impl RaftNode {
    /// Build a node from recovered log state. `initial_conf` seeds
    /// membership for a brand-new group; an existing conf state in the log
    /// wins over it.
    pub fn new(id: u64, log: RaftLog, config: RaftConfig, initial_conf: ConfState) -> Result<Self> {
        let hs = log.hard_state()?;
        let conf = log.conf_state()?.unwrap_or(initial_conf);
        let last_index = log.last_index();
        let last_term = log.last_term();
        let timeout_ticks = randomized_timeout(&config);
        Ok(Self {
            id,
            log,
            config,
            role: Role::Follower,
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
            leader: 0,
            conf,
            last_index,
            last_term,
            progress: HashMap::new(),
            votes: HashMap::new(),
            pending_conf_index: 0,
            elapsed: 0,
            timeout_ticks,
            ready: Ready::default(),
            hs_dirty: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn commit(&self) -> u64 {
        self.commit
    }

    pub fn leader(&self) -> u64 {
        self.leader
    }

    pub fn conf(&self) -> &ConfState {
        &self.conf
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RaftLog {
        &mut self.log
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Drain pending output. The driver must handle it in the documented
    /// order before the next step.
    pub fn take_ready(&mut self) -> Ready {
        let mut ready = std::mem::take(&mut self.ready);
        ready.commit = self.commit;
        if self.hs_dirty {
            ready.hard_state = Some(HardState {
                term: self.term,
                vote: self.vote,
                commit: self.commit,
            });
            self.hs_dirty = false;
        }
        ready
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// One tick of the heartbeat interval.
    pub fn tick(&mut self) {
        self.elapsed += 1;
        match self.role {
            Role::Leader => {
                // Heartbeat every tick.
                self.broadcast_heartbeat();
                self.elapsed = 0;
            }
            _ => {
                if self.elapsed >= self.timeout_ticks && self.conf.voters.contains(&self.id) {
                    self.elapsed = 0;
                    self.campaign(true);
                }
            }
        }
    }

    /// Propose a payload. Leader only; returns the assigned log index.
    pub fn propose(&mut self, payload: Bytes) -> Result<u64> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader { leader: None });
        }
        let index = self.last_index + 1;
        let entry = LogEntry {
            term: self.term,
            index,
            kind: EntryKind::Normal,
            payload,
        };
        self.append_as_leader(entry);
        Ok(index)
    }

    /// Propose a single-step membership change. Rejected while another one
    /// is still uncommitted.
    pub fn propose_conf_change(&mut self, cc: ConfChange) -> Result<u64> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader { leader: None });
        }
        if self.pending_conf_index > self.commit {
            return Err(RaftError::ProposalDropped);
        }
        let index = self.last_index + 1;
        let entry = LogEntry {
            term: self.term,
            index,
            kind: EntryKind::ConfChange,
            payload: cc.encode(),
        };
        self.pending_conf_index = index;
        self.append_as_leader(entry);
        Ok(index)
    }

    /// Apply a committed conf change to the membership (called by the
    /// driver as part of apply).
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> ConfState {
        match cc.kind {
            ConfChangeKind::AddLearner => {
                if !self.conf.contains(cc.node) {
                    self.conf.learners.push(cc.node);
                }
            }
            ConfChangeKind::AddVoter => {
                self.conf.learners.retain(|&n| n != cc.node);
                if !self.conf.voters.contains(&cc.node) {
                    self.conf.voters.push(cc.node);
                }
            }
            ConfChangeKind::RemoveNode => {
                self.conf.voters.retain(|&n| n != cc.node);
                self.conf.learners.retain(|&n| n != cc.node);
                self.progress.remove(&cc.node);
            }
        }
        if self.role == Role::Leader && cc.kind != ConfChangeKind::RemoveNode {
            self.progress.entry(cc.node).or_insert(Progress {
                match_index: 0,
                next_index: self.last_index + 1,
                pending_snapshot: false,
            });
        }
        info!(
            node = self.id,
            change = ?cc,
            voters = ?self.conf.voters,
            learners = ?self.conf.learners,
            "membership changed"
        );
        self.conf.clone()
    }

    /// Start an election now. `pre` runs the pre-vote phase first; a leader
    /// transfer passes `pre = false` to take over immediately.
    pub fn campaign(&mut self, pre: bool) {
        if self.conf.voters.len() == 1 && self.conf.voters[0] == self.id {
            // Single-voter group: win instantly.
            self.become_candidate();
            self.become_leader();
            return;
        }
        if pre {
            self.role = Role::PreCandidate;
            self.votes.clear();
            self.votes.insert(self.id, true);
            debug!(node = self.id, term = self.term, "pre-vote started");
            for &peer in &self.conf.voters.clone() {
                if peer == self.id {
                    continue;
                }
                self.send(Message {
                    from: self.id,
                    to: peer,
                    term: self.term + 1,
                    kind: MessageKind::PreVote {
                        last_index: self.last_index,
                        last_term: self.last_term,
                    },
                });
            }
        } else {
            self.become_candidate();
            for &peer in &self.conf.voters.clone() {
                if peer == self.id {
                    continue;
                }
                self.send(Message {
                    from: self.id,
                    to: peer,
                    term: self.term,
                    kind: MessageKind::Vote {
                        last_index: self.last_index,
                        last_term: self.last_term,
                    },
                });
            }
        }
    }

    /// Feed one inbound message.
    pub fn step(&mut self, m: Message) {
        // Term bookkeeping. Pre-vote requests/responses deliberately do not
        // move our term: a partitioned node rejoining must not disrupt a
        // settled leader.
        match &m.kind {
            MessageKind::PreVote { .. } | MessageKind::PreVoteResp { .. } => {}
            _ => {
                if m.term > self.term {
                    self.become_follower(m.term, leader_of(&m));
                } else if m.term < self.term {
                    self.reject_stale(&m);
                    return;
                }
            }
        }

        match m.kind {
            MessageKind::PreVote {
                last_index,
                last_term,
            } => {
                // Grant if we'd grant a real vote at that term. The
                // disruption protection is that the pre-candidate never
                // bumps anyone's term on rejection.
                let log_ok = (last_term, last_index) >= (self.last_term, self.last_index);
                let granted = log_ok && m.term > self.term;
                self.send(Message {
                    from: self.id,
                    to: m.from,
                    term: m.term,
                    kind: MessageKind::PreVoteResp { granted },
                });
            }
            MessageKind::PreVoteResp { granted } => {
                if self.role != Role::PreCandidate || m.term != self.term + 1 {
                    return;
                }
                self.votes.insert(m.from, granted);
                if self.granted() >= self.quorum() {
                    self.campaign(false);
                } else if self.rejected() >= self.quorum() {
                    self.become_follower(self.term, 0);
                }
            }
            MessageKind::Vote {
                last_index,
                last_term,
            } => {
                let log_ok = (last_term, last_index) >= (self.last_term, self.last_index);
                let granted = log_ok && (self.vote == 0 || self.vote == m.from);
                if granted && self.vote == 0 {
                    self.vote = m.from;
                    self.hs_dirty = true;
                    self.elapsed = 0;
                }
                debug!(node = self.id, candidate = m.from, granted, "vote request");
                self.send(Message {
                    from: self.id,
                    to: m.from,
                    term: self.term,
                    kind: MessageKind::VoteResp { granted },
                });
            }
            MessageKind::VoteResp { granted } => {
                if self.role != Role::Candidate {
                    return;
                }
                self.votes.insert(m.from, granted);
                if self.granted() >= self.quorum() {
                    self.become_leader();
                } else if self.rejected() >= self.quorum() {
                    self.become_follower(self.term, 0);
                }
            }
            MessageKind::AppendEntries {
                prev_index,
                prev_term,
                commit,
                entries,
            } => {
                self.handle_append(m.from, prev_index, prev_term, commit, entries);
            }
            MessageKind::AppendResp {
                success,
                match_index,
            } => {
                if self.role != Role::Leader {
                    return;
                }
                self.handle_append_resp(m.from, success, match_index);
            }
            MessageKind::Heartbeat { commit } => {
                self.elapsed = 0;
                self.set_leader(m.from);
                if self.role != Role::Follower {
                    self.role = Role::Follower;
                }
                self.advance_commit(commit.min(self.last_index));
                self.send(Message {
                    from: self.id,
                    to: m.from,
                    term: self.term,
                    kind: MessageKind::HeartbeatResp {
                        match_index: self.last_index,
                    },
                });
            }
            MessageKind::HeartbeatResp { match_index } => {
                if self.role != Role::Leader {
                    return;
                }
                // The heartbeat response drives replication retries. It
                // never raises match_index: only a successful AppendEntries
                // exchange verifies log matching.
                let last_index = self.last_index;
                let resend = match self.progress.get_mut(&m.from) {
                    Some(p) if !p.pending_snapshot => {
                        if match_index + 1 < p.next_index {
                            // Follower is further behind than assumed;
                            // probe from its actual end.
                            p.next_index = match_index + 1;
                        }
                        p.match_index < last_index
                    }
                    _ => false,
                };
                if resend {
                    self.send_append(m.from);
                }
            }
            MessageKind::InstallSnapshot { meta } => {
                self.elapsed = 0;
                self.set_leader(m.from);
                if self.role != Role::Follower {
                    self.role = Role::Follower;
                }
                if meta.last_index <= self.commit {
                    // Already have it; tell the leader where we are.
                    self.send(Message {
                        from: self.id,
                        to: m.from,
                        term: self.term,
                        kind: MessageKind::SnapshotResp {
                            success: true,
                            last_index: self.last_index,
                        },
                    });
                } else {
                    // The driver fetches block bytes and installs, then
                    // calls `snapshot_installed`.
                    self.ready.snapshot = Some(meta);
                }
            }
            MessageKind::SnapshotResp {
                success,
                last_index,
            } => {
                if self.role != Role::Leader {
                    return;
                }
                if let Some(p) = self.progress.get_mut(&m.from) {
                    p.pending_snapshot = false;
                    if success {
                        p.match_index = p.match_index.max(last_index);
                        p.next_index = p.match_index + 1;
                    }
                }
                self.maybe_commit();
            }
        }
    }

    /// The driver finished installing a snapshot.
    pub fn snapshot_installed(&mut self, meta: &SnapshotMeta, leader: u64) {
        self.last_index = meta.last_index;
        self.last_term = meta.last_term;
        self.commit = meta.last_index;
        self.conf = meta.conf.clone();
        self.hs_dirty = true;
        self.send(Message {
            from: self.id,
            to: leader,
            term: self.term,
            kind: MessageKind::SnapshotResp {
                success: true,
                last_index: self.last_index,
            },
        });
    }

    /// The driver failed to install a snapshot (fetch error); report so the
    /// leader can retry later.
    pub fn snapshot_failed(&mut self, leader: u64) {
        self.send(Message {
            from: self.id,
            to: leader,
            term: self.term,
            kind: MessageKind::SnapshotResp {
                success: false,
                last_index: self.last_index,
            },
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn append_as_leader(&mut self, entry: LogEntry) {
        self.last_index = entry.index;
        self.last_term = entry.term;
        self.ready.entries.push(entry);
        let last_index = self.last_index;
        if let Some(p) = self.progress.get_mut(&self.id) {
            p.match_index = last_index;
            p.next_index = last_index + 1;
        }
        for peer in self.peer_ids() {
            self.send_append(peer);
        }
        // A single-voter group commits instantly.
        self.maybe_commit();
    }

    fn handle_append(
        &mut self,
        from: u64,
        prev_index: u64,
        prev_term: u64,
        commit: u64,
        entries: Vec<LogEntry>,
    ) {
        self.elapsed = 0;
        self.set_leader(from);
        if self.role != Role::Follower {
            self.role = Role::Follower;
        }

        let prev_ok = prev_index == 0
            || (prev_index <= self.last_index && self.term_at(prev_index) == Some(prev_term));
        if !prev_ok {
            debug!(
                node = self.id,
                prev_index,
                prev_term,
                last_index = self.last_index,
                "append rejected, log mismatch"
            );
            self.send(Message {
                from: self.id,
                to: from,
                term: self.term,
                kind: MessageKind::AppendResp {
                    success: false,
                    match_index: self.last_index.min(prev_index.saturating_sub(1)),
                },
            });
            return;
        }

        // Only the range the leader actually verified counts as matched; a
        // leftover divergent tail beyond it does not.
        let match_index = prev_index + entries.len() as u64;

        // Skip entries we already hold with matching terms; truncate at the
        // first divergence.
        let mut to_append = Vec::new();
        for e in entries {
            if e.index <= self.last_index {
                if self.term_at(e.index) == Some(e.term) {
                    continue;
                }
            }
            self.last_index = e.index;
            self.last_term = e.term;
            to_append.push(e);
        }
        if !to_append.is_empty() {
            self.ready.entries.extend(to_append);
        }
        self.advance_commit(commit.min(match_index));
        self.send(Message {
            from: self.id,
            to: from,
            term: self.term,
            kind: MessageKind::AppendResp {
                success: true,
                match_index,
            },
        });
    }

    fn handle_append_resp(&mut self, from: u64, success: bool, match_index: u64) {
        let last_index = self.last_index;
        let Some(p) = self.progress.get_mut(&from) else {
            return;
        };
        if success {
            p.match_index = p.match_index.max(match_index);
            p.next_index = p.match_index + 1;
            let more = p.next_index <= last_index;
            self.maybe_commit();
            if more {
                self.send_append(from);
            }
        } else {
            p.next_index = match_index + 1;
            self.send_append(from);
        }
    }

    fn send_append(&mut self, to: u64) {
        let Some(p) = self.progress.get(&to).copied() else {
            return;
        };
        if p.pending_snapshot {
            return;
        }
        let next = p.next_index.max(1);
        if next < self.log.first_index() {
            // Compacted away; ship the snapshot reference instead.
            let Ok(Some(meta)) = self.log.snapshot_meta() else {
                warn!(node = self.id, to, "entries compacted but no snapshot meta");
                return;
            };
            if let Some(p) = self.progress.get_mut(&to) {
                p.pending_snapshot = true;
            }
            let term = self.term;
            self.send(Message {
                from: self.id,
                to,
                term,
                kind: MessageKind::InstallSnapshot { meta },
            });
            return;
        }
        let prev_index = next - 1;
        let Some(prev_term) = self.term_at(prev_index) else {
            return;
        };
        // Entries still buffered in `ready` are not readable from the log
        // yet; send what is, the rest follows on the next response.
        let persisted_last = self.log.last_index();
        let entries = if next > persisted_last {
            Vec::new()
        } else {
            self.log
                .entries(next, persisted_last, self.config.max_batch_entries)
        };
        self.send(Message {
            from: self.id,
            to,
            term: self.term,
            kind: MessageKind::AppendEntries {
                prev_index,
                prev_term,
                commit: self.commit,
                entries,
            },
        });
    }

    fn broadcast_heartbeat(&mut self) {
        for peer in self.peer_ids() {
            // Per-peer commit: never advertise past what that follower has
            // verifiably replicated.
            let commit = self
                .progress
                .get(&peer)
                .map(|p| p.match_index.min(self.commit))
                .unwrap_or(0);
            self.send(Message {
                from: self.id,
                to: peer,
                term: self.term,
                kind: MessageKind::Heartbeat { commit },
            });
        }
    }

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matches: Vec<u64> = self
            .conf
            .voters
            .iter()
            .map(|v| {
                if *v == self.id {
                    self.last_index
                } else {
                    self.progress.get(v).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matches.is_empty() {
            return;
        }
        matches.sort_unstable();
        // Largest N replicated on a majority of voters.
        let candidate = matches[(matches.len() - 1) / 2];
        // Only entries of the current term commit by counting.
        if candidate > self.commit && self.term_at(candidate) == Some(self.term) {
            self.advance_commit(candidate);
            // Propagate the new commit index promptly.
            self.broadcast_heartbeat();
        }
    }

    fn advance_commit(&mut self, to: u64) {
        if to > self.commit {
            self.commit = to;
            self.hs_dirty = true;
        }
    }

    fn become_follower(&mut self, term: u64, leader: u64) {
        let was = self.role;
        if term > self.term {
            self.term = term;
            self.vote = 0;
            self.hs_dirty = true;
        }
        self.role = Role::Follower;
        self.progress.clear();
        self.votes.clear();
        self.timeout_ticks = randomized_timeout(&self.config);
        self.elapsed = 0;
        if leader != 0 {
            self.set_leader(leader);
        } else if was == Role::Leader {
            // We stepped down; leadership is unknown until contact.
            self.leader = 0;
            self.ready.leader_changed = Some((0, self.term));
        }
    }

    fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.term += 1;
        self.vote = self.id;
        self.hs_dirty = true;
        self.leader = 0;
        self.votes.clear();
        self.votes.insert(self.id, true);
        self.elapsed = 0;
        self.timeout_ticks = randomized_timeout(&self.config);
        debug!(node = self.id, term = self.term, "election started");
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = self.id;
        self.progress.clear();
        for peer in self.conf.voters.iter().chain(self.conf.learners.iter()) {
            self.progress.insert(
                *peer,
                Progress {
                    match_index: if *peer == self.id { self.last_index } else { 0 },
                    next_index: self.last_index + 1,
                    pending_snapshot: false,
                },
            );
        }
        self.pending_conf_index = 0;
        info!(node = self.id, term = self.term, "became leader");
        self.ready.leader_changed = Some((self.id, self.term));
        // Establish authority and probe follower logs immediately.
        self.broadcast_heartbeat();
        // A no-op of the new term lets prior-term entries commit by
        // counting as soon as it replicates.
        let noop = LogEntry {
            term: self.term,
            index: self.last_index + 1,
            kind: EntryKind::Noop,
            payload: Bytes::new(),
        };
        self.append_as_leader(noop);
    }

    fn set_leader(&mut self, leader: u64) {
        if self.leader != leader {
            self.leader = leader;
            self.ready.leader_changed = Some((leader, self.term));
        }
    }

    fn reject_stale(&mut self, m: &Message) {
        match m.kind {
            MessageKind::AppendEntries { .. } | MessageKind::Heartbeat { .. } => {
                // Our term in the response forces the stale leader down.
                self.send(Message {
                    from: self.id,
                    to: m.from,
                    term: self.term,
                    kind: MessageKind::AppendResp {
                        success: false,
                        match_index: 0,
                    },
                });
            }
            MessageKind::Vote { .. } => {
                self.send(Message {
                    from: self.id,
                    to: m.from,
                    term: self.term,
                    kind: MessageKind::VoteResp { granted: false },
                });
            }
            _ => {}
        }
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.last_index {
            return Some(self.last_term);
        }
        self.log.term(index)
    }

    fn peer_ids(&self) -> Vec<u64> {
        self.conf
            .voters
            .iter()
            .chain(self.conf.learners.iter())
            .copied()
            .filter(|&p| p != self.id)
            .collect()
    }

    fn quorum(&self) -> usize {
        self.conf.voters.len() / 2 + 1
    }

    fn granted(&self) -> usize {
        self.votes.values().filter(|&&g| g).count()
    }

    fn rejected(&self) -> usize {
        self.votes.values().filter(|&&g| !g).count()
    }

    fn send(&mut self, m: Message) {
        self.ready.messages.push(m);
    }
}

fn leader_of(m: &Message) -> u64 {
    match m.kind {
        MessageKind::AppendEntries { .. }
        | MessageKind::Heartbeat { .. }
        | MessageKind::InstallSnapshot { .. } => m.from,
        _ => 0,
    }
}

fn randomized_timeout(config: &RaftConfig) -> u64 {
    let base = config.election_ticks();
    rand::thread_rng().gen_range(base..base * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_core::BlockId;
    use eventflow_meta::{AsyncStore, AsyncStoreConfig, SyncStore, SyncStoreConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Cluster {
        nodes: HashMap<u64, RaftNode>,
        // Keeps the stores' backing dirs alive for the test's duration.
        _dirs: Vec<TempDir>,
        hints: Vec<Arc<AsyncStore>>,
    }

    impl Cluster {
        async fn new(ids: &[u64]) -> Cluster {
            let conf = ConfState {
                voters: ids.to_vec(),
                learners: vec![],
            };
            let mut nodes = HashMap::new();
            let mut dirs = Vec::new();
            let mut hints_vec = Vec::new();
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
                let log = RaftLog::recover(BlockId::from_u64(id), meta, hints.clone()).unwrap();
                let node = RaftNode::new(id, log, RaftConfig::default(), conf.clone()).unwrap();
                nodes.insert(id, node);
                dirs.push(dir);
                hints_vec.push(hints);
            }
            Cluster {
                nodes,
                _dirs: dirs,
                hints: hints_vec,
            }
        }

        /// Drain every node's Ready, persist it, and deliver messages to
        /// live peers until the cluster goes quiet.
        async fn pump(&mut self, down: &[u64]) {
            loop {
                let mut inflight = Vec::new();
                let ids: Vec<u64> = self.nodes.keys().copied().collect();
                for id in ids {
                    if down.contains(&id) {
                        // A dead node neither persists nor sends.
                        let node = self.nodes.get_mut(&id).unwrap();
                        let _ = node.take_ready();
                        continue;
                    }
                    let node = self.nodes.get_mut(&id).unwrap();
                    let mut ready = node.take_ready();
                    if !ready.entries.is_empty() {
                        node.log_mut().append(&ready.entries).await.unwrap();
                    }
                    if let Some(hs) = ready.hard_state {
                        node.log().set_hard_state(&hs).await.unwrap();
                    }
                    inflight.append(&mut ready.messages);
                }
                if inflight.is_empty() {
                    break;
                }
                for m in inflight {
                    if down.contains(&m.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&m.to) {
                        node.step(m);
                    }
                }
            }
        }

        async fn elect(&mut self, id: u64, down: &[u64]) {
            self.nodes.get_mut(&id).unwrap().campaign(true);
            self.pump(down).await;
        }

        fn leader_count(&self) -> usize {
            self.nodes.values().filter(|n| n.is_leader()).count()
        }

        async fn close(self) {
            for h in &self.hints {
                h.close().await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_single_node_self_elects_and_commits() {
        let mut cluster = Cluster::new(&[1]).await;
        let node = cluster.nodes.get_mut(&1).unwrap();
        // Drive ticks until the randomized timeout fires.
        for _ in 0..40 {
            node.tick();
        }
        assert!(node.is_leader());
        cluster.pump(&[]).await;

        let node = cluster.nodes.get_mut(&1).unwrap();
        let index = node.propose(Bytes::from("payload")).unwrap();
        cluster.pump(&[]).await;
        let node = &cluster.nodes[&1];
        assert!(node.commit() >= index);
        assert_eq!(node.log().entry(index).unwrap().payload, Bytes::from("payload"));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_three_node_election_and_replication() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;
        assert!(cluster.nodes[&1].is_leader());
        assert_eq!(cluster.leader_count(), 1);
        assert_eq!(cluster.nodes[&2].leader(), 1);
        assert_eq!(cluster.nodes[&3].leader(), 1);

        let index = cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("e1"))
            .unwrap();
        cluster.pump(&[]).await;

        for id in [1, 2, 3] {
            let node = &cluster.nodes[&id];
            assert!(node.commit() >= index, "node {id} commit {}", node.commit());
            assert_eq!(
                node.log().entry(index).unwrap().payload,
                Bytes::from("e1"),
                "node {id}"
            );
        }
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_propose_on_follower_fails() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;
        let err = cluster
            .nodes
            .get_mut(&2)
            .unwrap()
            .propose(Bytes::from("nope"))
            .unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_commit_survives_leader_change() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;

        let mut last = 0;
        for i in 0..50 {
            last = cluster
                .nodes
                .get_mut(&1)
                .unwrap()
                .propose(Bytes::from(format!("e{i}")))
                .unwrap();
            cluster.pump(&[]).await;
        }
        assert!(cluster.nodes[&1].commit() >= last);

        // Kill the leader, elect node 2.
        cluster.elect(2, &[1]).await;
        assert!(cluster.nodes[&2].is_leader());

        // Every committed entry survives on the new leader.
        let node = &cluster.nodes[&2];
        assert!(node.commit() >= last);
        for i in 0..50 {
            let found = (1..=node.log().last_index())
                .filter_map(|idx| node.log().entry(idx))
                .any(|e| e.payload == Bytes::from(format!("e{i}")));
            assert!(found, "entry e{i} lost after leader change");
        }
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_divergent_follower_converges() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;

        // Replicate one entry everywhere.
        cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("shared"))
            .unwrap();
        cluster.pump(&[]).await;

        // Leader appends more entries that only it sees.
        cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("lost-1"))
            .unwrap();
        {
            // Persist locally but drop all outbound traffic.
            let node = cluster.nodes.get_mut(&1).unwrap();
            let ready = node.take_ready();
            node.log_mut().append(&ready.entries).await.unwrap();
            if let Some(hs) = ready.hard_state {
                node.log().set_hard_state(&hs).await.unwrap();
            }
        }

        // New leader elected without node 1; it writes its own entries.
        cluster.elect(2, &[1]).await;
        let idx = cluster
            .nodes
            .get_mut(&2)
            .unwrap()
            .propose(Bytes::from("won"))
            .unwrap();
        cluster.pump(&[1]).await;

        // Node 1 rejoins as follower and must converge to node 2's log.
        cluster.pump(&[]).await;
        // Let heartbeats drive the repair.
        for _ in 0..3 {
            cluster.nodes.get_mut(&2).unwrap().tick();
            cluster.pump(&[]).await;
        }

        let n1 = &cluster.nodes[&1];
        assert_eq!(n1.leader(), 2);
        assert_eq!(n1.log().entry(idx).unwrap().payload, Bytes::from("won"));
        // The uncommitted divergent entry is gone.
        let has_lost = (1..=n1.log().last_index())
            .filter_map(|i| n1.log().entry(i))
            .any(|e| e.payload == Bytes::from("lost-1"));
        assert!(!has_lost, "divergent uncommitted entry must be truncated");
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_minority_partition_cannot_commit() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;
        let committed = cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("majority"))
            .unwrap();
        cluster.pump(&[]).await;
        assert!(cluster.nodes[&1].commit() >= committed);

        // Partition the leader away from both followers; its next proposal
        // must never commit.
        let solo = cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("minority"))
            .unwrap();
        cluster.pump(&[2, 3]).await;
        assert!(
            cluster.nodes[&1].commit() < solo,
            "minority side must not advance its commit"
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_prevote_rejected_when_log_behind() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;
        for i in 0..5 {
            cluster
                .nodes
                .get_mut(&1)
                .unwrap()
                .propose(Bytes::from(format!("e{i}")))
                .unwrap();
            cluster.pump(&[]).await;
        }
        let term_before = cluster.nodes[&1].term();

        // Node 3 wipes nothing but pretends to campaign with a stale log:
        // give nodes 1 and 2 an extra entry that 3 never sees.
        cluster
            .nodes
            .get_mut(&1)
            .unwrap()
            .propose(Bytes::from("fresh"))
            .unwrap();
        cluster.pump(&[3]).await;

        cluster.nodes.get_mut(&3).unwrap().campaign(true);
        cluster.pump(&[]).await;

        // Pre-vote fails against up-to-date peers and nobody's term moved.
        assert!(cluster.nodes[&1].is_leader());
        assert_eq!(cluster.nodes[&1].term(), term_before);
        assert!(!cluster.nodes[&3].is_leader());
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_conf_change_add_learner_then_promote() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;

        let leader = cluster.nodes.get_mut(&1).unwrap();
        let idx = leader
            .propose_conf_change(ConfChange {
                kind: ConfChangeKind::AddLearner,
                node: 4,
            })
            .unwrap();
        // A second change while the first is uncommitted is refused.
        let err = leader
            .propose_conf_change(ConfChange {
                kind: ConfChangeKind::AddVoter,
                node: 4,
            })
            .unwrap_err();
        assert!(matches!(err, RaftError::ProposalDropped));

        cluster.pump(&[]).await;
        let leader = cluster.nodes.get_mut(&1).unwrap();
        assert!(leader.commit() >= idx);
        // The driver applies the change; emulate it here.
        let cc = ConfChange::decode(leader.log().entry(idx).unwrap().payload).unwrap();
        let conf = leader.apply_conf_change(&cc);
        assert!(conf.learners.contains(&4));
        assert!(!conf.voters.contains(&4));

        let idx = leader
            .propose_conf_change(ConfChange {
                kind: ConfChangeKind::AddVoter,
                node: 4,
            })
            .unwrap();
        cluster.pump(&[]).await;
        let leader = cluster.nodes.get_mut(&1).unwrap();
        let cc = ConfChange::decode(leader.log().entry(idx).unwrap().payload).unwrap();
        let conf = leader.apply_conf_change(&cc);
        assert!(conf.voters.contains(&4));
        assert!(!conf.learners.contains(&4));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_leader_steps_down_on_higher_term() {
        let mut cluster = Cluster::new(&[1, 2, 3]).await;
        cluster.elect(1, &[]).await;
        assert!(cluster.nodes[&1].is_leader());

        // Force node 2 into a real (non-pre) campaign at a higher term.
        cluster.nodes.get_mut(&2).unwrap().campaign(false);
        cluster.pump(&[]).await;

        assert_eq!(cluster.leader_count(), 1);
        let leader_id = cluster
            .nodes
            .values()
            .find(|n| n.is_leader())
            .map(|n| n.id())
            .unwrap();
        assert_eq!(leader_id, 2);
        assert_eq!(cluster.nodes[&1].role(), Role::Follower);
        cluster.close().await;
    }
}
