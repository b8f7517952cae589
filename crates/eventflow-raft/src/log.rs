//! Durable log view of one Raft group over the meta stores.
//!
//! Keys in the synchronous store:
//!
//! ```text
//! raft/<block:016X>/hs                     hard state
//! raft/<block:016X>/cs                     conf state
//! raft/<block:016X>/snap                   snapshot meta (after compaction)
//! raft/<block:016X>/log/<index:020>        one entry per key
//! ```
//!
//! Applied-index hints go to the asynchronous store under
//! `raft/<block:016X>/applied`; they are lower bounds, re-established by the
//! commit index after a crash.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use eventflow_core::BlockId;
use eventflow_meta::wal::WalRecord;
use eventflow_meta::{AsyncStore, SyncStore};
use tracing::warn;

use crate::error::Result;
use crate::types::{
    decode_entry_value, encode_entry_value, ConfState, HardState, LogEntry, SnapshotMeta,
};

pub struct RaftLog {
    block: BlockId,
    meta: Arc<SyncStore>,
    hints: Arc<AsyncStore>,
    prefix: String,
    // Cached bounds; the authoritative copy is in the store.
    first_index: u64,
    last_index: u64,
    last_term: u64,
}

impl RaftLog {
    /// Load (or create empty) log state for `block`.
    pub fn recover(block: BlockId, meta: Arc<SyncStore>, hints: Arc<AsyncStore>) -> Result<Self> {
        let prefix = format!("raft/{block}/");
        let mut log = Self {
            block,
            meta,
            hints,
            prefix,
            first_index: 1,
            last_index: 0,
            last_term: 0,
        };

        if let Some(snap) = log.snapshot_meta()? {
            log.first_index = snap.last_index + 1;
            log.last_index = snap.last_index;
            log.last_term = snap.last_term;
        }
        let entries = log.meta.scan_prefix(&format!("{}log/", log.prefix));
        for (key, value) in entries {
            match decode_entry_value(value) {
                Ok(e) => {
                    log.last_index = e.index;
                    log.last_term = e.term;
                }
                Err(err) => {
                    // The sync store fsyncs every write, so this is real
                    // corruption rather than a crash artifact.
                    warn!(block = %block, key = %key, error = %err, "undecodable log entry");
                }
            }
        }
        Ok(log)
    }

    /// Whether the group has any persistent trace (entries, a vote, or a
    /// snapshot). Blocks without one are reported for deletion at recovery.
    pub fn has_state(&self) -> bool {
        self.last_index > 0
            || self.meta.get(&format!("{}hs", self.prefix)).is_some()
            || self.meta.get(&format!("{}cs", self.prefix)).is_some()
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    fn entry_key(&self, index: u64) -> String {
        format!("{}log/{index:020}", self.prefix)
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        let raw = self.meta.get(&self.entry_key(index))?;
        decode_entry_value(raw).ok()
    }

    /// Term of `index`, consulting the snapshot boundary.
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index + 1 == self.first_index {
            // The compaction point; its term is recorded in the snapshot.
            return match self.snapshot_meta().ok()? {
                Some(snap) if snap.last_index == index => Some(snap.last_term),
                _ => None,
            };
        }
        self.entry(index).map(|e| e.term)
    }

    /// Entries in `[lo, hi]`, capped at `max` items.
    pub fn entries(&self, lo: u64, hi: u64, max: usize) -> Vec<LogEntry> {
        let mut out = Vec::new();
        let mut index = lo;
        while index <= hi && out.len() < max {
            match self.entry(index) {
                Some(e) => out.push(e),
                None => break,
            }
            index += 1;
        }
        out
    }

    /// Append entries, truncating any conflicting suffix first. One fsync.
    pub async fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::new();
        // Entries past the new suffix are stale after a truncating append.
        let new_first = entries[0].index;
        for stale in new_first..=self.last_index {
            batch.push(WalRecord::delete(self.entry_key(stale)));
        }
        for e in entries {
            batch.push(WalRecord::put(self.entry_key(e.index), encode_entry_value(e)));
        }
        self.meta.apply_batch(batch).await?;
        self.last_index = entries.last().map(|e| e.index).unwrap_or(self.last_index);
        self.last_term = entries.last().map(|e| e.term).unwrap_or(self.last_term);
        if new_first < self.first_index {
            self.first_index = new_first;
        }
        Ok(())
    }

    pub fn hard_state(&self) -> Result<HardState> {
        match self.meta.get(&format!("{}hs", self.prefix)) {
            Some(raw) => Ok(HardState::decode(raw)?),
            None => Ok(HardState::default()),
        }
    }

    pub async fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        self.meta
            .set(format!("{}hs", self.prefix), hs.encode())
            .await?;
        Ok(())
    }

    pub fn conf_state(&self) -> Result<Option<ConfState>> {
        match self.meta.get(&format!("{}cs", self.prefix)) {
            Some(raw) => Ok(Some(ConfState::decode(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        self.meta
            .set(format!("{}cs", self.prefix), cs.encode())
            .await?;
        Ok(())
    }

    pub fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>> {
        match self.meta.get(&format!("{}snap", self.prefix)) {
            Some(raw) => Ok(Some(SnapshotMeta::decode(raw)?)),
            None => Ok(None),
        }
    }

    /// Record a snapshot and drop all entries at or below its last index.
    pub async fn compact(&mut self, snap: &SnapshotMeta) -> Result<()> {
        let mut batch = vec![WalRecord::put(
            format!("{}snap", self.prefix),
            snap.encode(),
        )];
        for index in self.first_index..=snap.last_index.min(self.last_index) {
            batch.push(WalRecord::delete(self.entry_key(index)));
        }
        self.meta.apply_batch(batch).await?;
        self.first_index = snap.last_index + 1;
        if self.last_index < snap.last_index {
            self.last_index = snap.last_index;
            self.last_term = snap.last_term;
        }
        Ok(())
    }

    /// Wipe the log for a snapshot installation: everything restarts at the
    /// snapshot boundary.
    pub async fn reset_to_snapshot(&mut self, snap: &SnapshotMeta) -> Result<()> {
        let mut batch = vec![WalRecord::put(
            format!("{}snap", self.prefix),
            snap.encode(),
        )];
        for (key, _) in self.meta.scan_prefix(&format!("{}log/", self.prefix)) {
            batch.push(WalRecord::delete(key));
        }
        self.meta.apply_batch(batch).await?;
        self.first_index = snap.last_index + 1;
        self.last_index = snap.last_index;
        self.last_term = snap.last_term;
        Ok(())
    }

    /// Sum of stored entry payload bytes past `applied`; drives the
    /// snapshot threshold.
    pub fn bytes_since(&self, applied: u64) -> u64 {
        let mut total = 0u64;
        for index in (applied + 1).max(self.first_index)..=self.last_index {
            if let Some(e) = self.entry(index) {
                total += e.payload.len() as u64 + 21;
            }
        }
        total
    }

    /// Remove every key of this group. Used when the block itself is
    /// removed.
    pub async fn destroy(self) -> Result<()> {
        let mut batch = Vec::new();
        for (key, _) in self.meta.scan_prefix(&self.prefix) {
            batch.push(WalRecord::delete(key));
        }
        if !batch.is_empty() {
            self.meta.apply_batch(batch).await?;
        }
        self.hints.delete(format!("raft/{}/applied", self.block)).ok();
        Ok(())
    }

    pub fn applied_hint(&self) -> u64 {
        self.hints
            .get(&format!("raft/{}/applied", self.block))
            .and_then(|raw| {
                if raw.len() == 8 {
                    let mut buf = raw;
                    Some(buf.get_u64_le())
                } else {
                    None
                }
            })
            .unwrap_or(0)
    }

    pub fn set_applied_hint(&self, applied: u64) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(applied);
        // Best effort; a lost hint only costs replay.
        let _ = self
            .hints
            .set(format!("raft/{}/applied", self.block), buf.freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use eventflow_meta::{AsyncStoreConfig, SyncStoreConfig};
    use tempfile::TempDir;

    async fn stores(dir: &TempDir) -> (Arc<SyncStore>, Arc<AsyncStore>) {
        let meta = Arc::new(
            SyncStore::recover(dir.path().join("meta"), SyncStoreConfig::default())
                .await
                .unwrap(),
        );
        let hints = AsyncStore::recover(dir.path().join("offset"), AsyncStoreConfig::default())
            .await
            .unwrap();
        (meta, hints)
    }

    fn entry(term: u64, index: u64, payload: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            kind: EntryKind::Normal,
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[tokio::test]
    async fn test_append_and_bounds() {
        let dir = TempDir::new().unwrap();
        let (meta, hints) = stores(&dir).await;
        let block = BlockId::from_u64(1);
        let mut log = RaftLog::recover(block, meta, hints.clone()).unwrap();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.first_index(), 1);
        assert!(!log.has_state());

        log.append(&[entry(1, 1, "a"), entry(1, 2, "b"), entry(2, 3, "c")])
            .await
            .unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert!(log.has_state());
        assert_eq!(log.term(2), Some(1));
        assert_eq!(log.term(3), Some(2));
        assert_eq!(log.term(0), Some(0));

        let entries = log.entries(1, 3, 10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].payload, Bytes::from("c"));
        hints.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncating_append_replaces_suffix() {
        let dir = TempDir::new().unwrap();
        let (meta, hints) = stores(&dir).await;
        let mut log = RaftLog::recover(BlockId::from_u64(2), meta, hints.clone()).unwrap();
        log.append(&[entry(1, 1, "a"), entry(1, 2, "old-2"), entry(1, 3, "old-3")])
            .await
            .unwrap();

        // A new leader overwrites from index 2.
        log.append(&[entry(2, 2, "new-2")]).await.unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(3), None);
        assert_eq!(log.entry(2).unwrap().payload, Bytes::from("new-2"));
        assert_eq!(log.entry(2).unwrap().term, 2);
        hints.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_after_reopen() {
        let dir = TempDir::new().unwrap();
        let block = BlockId::from_u64(3);
        {
            let (meta, hints) = stores(&dir).await;
            let mut log = RaftLog::recover(block, meta, hints.clone()).unwrap();
            log.append(&[entry(1, 1, "x"), entry(1, 2, "y")]).await.unwrap();
            log.set_hard_state(&HardState {
                term: 1,
                vote: block.as_u64(),
                commit: 2,
            })
            .await
            .unwrap();
            log.set_applied_hint(2);
            hints.close().await.unwrap();
        }
        let (meta, hints) = stores(&dir).await;
        let log = RaftLog::recover(block, meta, hints.clone()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.hard_state().unwrap().commit, 2);
        assert_eq!(log.applied_hint(), 2);
        hints.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compact_drops_prefix() {
        let dir = TempDir::new().unwrap();
        let (meta, hints) = stores(&dir).await;
        let mut log = RaftLog::recover(BlockId::from_u64(4), meta, hints.clone()).unwrap();
        for i in 1..=10 {
            log.append(&[entry(1, i, &format!("e{i}"))]).await.unwrap();
        }
        let snap = SnapshotMeta {
            last_index: 7,
            last_term: 1,
            block_offset: 6,
            block_crc: 0,
            conf: ConfState {
                voters: vec![4],
                learners: vec![],
            },
        };
        log.compact(&snap).await.unwrap();
        assert_eq!(log.first_index(), 8);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.entry(7), None);
        assert!(log.entry(8).is_some());
        assert_eq!(log.term(7), Some(1), "boundary term comes from the snapshot");
        hints.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let (meta, hints) = stores(&dir).await;
        let mut log = RaftLog::recover(BlockId::from_u64(5), meta, hints.clone()).unwrap();
        log.append(&[entry(1, 1, "a"), entry(1, 2, "b")]).await.unwrap();

        let snap = SnapshotMeta {
            last_index: 50,
            last_term: 3,
            block_offset: 49,
            block_crc: 1,
            conf: ConfState {
                voters: vec![5, 6, 7],
                learners: vec![],
            },
        };
        log.reset_to_snapshot(&snap).await.unwrap();
        assert_eq!(log.first_index(), 51);
        assert_eq!(log.last_index(), 50);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.entry(1), None);
        hints.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_removes_all_keys() {
        let dir = TempDir::new().unwrap();
        let (meta, hints) = stores(&dir).await;
        let block = BlockId::from_u64(6);
        let mut log = RaftLog::recover(block, meta.clone(), hints.clone()).unwrap();
        log.append(&[entry(1, 1, "a")]).await.unwrap();
        log.set_hard_state(&HardState::default()).await.unwrap();
        log.destroy().await.unwrap();

        assert!(meta.scan_prefix(&format!("raft/{block}/")).is_empty());
        let log = RaftLog::recover(block, meta, hints.clone()).unwrap();
        assert!(!log.has_state());
        hints.close().await.unwrap();
    }
}
