//! The synchronous store: every write durable before return.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::{SyncStoreConfig, MAX_VALUE_SIZE};
use crate::error::{MetaError, Result};
use crate::wal::{self, Wal, WalRecord};

/// Durable key/value store where `set`/`delete` fsync before returning.
///
/// Backs Raft hard state, conf state, and log entries; a write that
/// returned `Ok` survives any crash.
pub struct SyncStore {
    dir: PathBuf,
    config: SyncStoreConfig,
    state: Mutex<BTreeMap<String, Bytes>>,
    // Wal is accessed only while holding this async lock, which also
    // serializes snapshot rotation with appends.
    wal: tokio::sync::Mutex<Wal>,
}

impl SyncStore {
    /// Recover the store from `dir`: load the snapshot, replay the WAL,
    /// truncate a torn tail.
    pub async fn recover(dir: impl AsRef<Path>, config: SyncStoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut state = BTreeMap::new();
        wal::load_snapshot(dir.join("snap"), &mut state).await?;
        let wal = Wal::open(dir.join("wal"), &mut state).await?;
        info!(
            dir = %dir.display(),
            keys = state.len(),
            wal_bytes = wal.size(),
            "sync store recovered"
        );
        Ok(Self {
            dir,
            config,
            state: Mutex::new(state),
            wal: tokio::sync::Mutex::new(wal),
        })
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().get(key).cloned()
    }

    /// All keys with the given prefix, in order. Used to enumerate a Raft
    /// group's log entries.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let state = self.state.lock().unwrap();
        state
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn set(&self, key: impl Into<String>, value: Bytes) -> Result<()> {
        self.apply_batch(vec![WalRecord::put(key, value)]).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.apply_batch(vec![WalRecord::delete(key)]).await
    }

    /// Apply several mutations with a single fsync. The batch is atomic at
    /// the WAL level: after a crash either a prefix of it replays, record
    /// by record, or all of it.
    pub async fn apply_batch(&self, records: Vec<WalRecord>) -> Result<()> {
        for rec in &records {
            if rec.value.len() > MAX_VALUE_SIZE {
                return Err(MetaError::ValueTooLarge {
                    got: rec.value.len(),
                    limit: MAX_VALUE_SIZE,
                });
            }
        }
        let mut wal = self.wal.lock().await;
        wal.append(&records).await?;
        wal.sync().await?;
        {
            let mut state = self.state.lock().unwrap();
            for rec in &records {
                match rec.op {
                    wal::LogOp::Put => {
                        state.insert(rec.key.clone(), rec.value.clone());
                    }
                    wal::LogOp::Delete => {
                        state.remove(&rec.key);
                    }
                }
            }
        }

        if wal.size() >= self.config.snapshot_threshold {
            let snapshot = self.state.lock().unwrap().clone();
            debug!(keys = snapshot.len(), "sync store snapshotting");
            *wal = wal::rotate(self.dir.join("snap"), self.dir.join("wal"), &snapshot).await?;
        }
        Ok(())
    }

    /// Flush. All writes are already durable; this exists for interface
    /// symmetry with [`AsyncStore`](crate::AsyncStore).
    pub async fn close(&self) -> Result<()> {
        self.wal.lock().await.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
            .await
            .unwrap();

        store.set("raft/1/hs", Bytes::from("state")).await.unwrap();
        assert_eq!(store.get("raft/1/hs"), Some(Bytes::from("state")));

        store.delete("raft/1/hs").await.unwrap();
        assert_eq!(store.get("raft/1/hs"), None);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
                .await
                .unwrap();
            store.set("a", Bytes::from("1")).await.unwrap();
            store.set("b", Bytes::from("2")).await.unwrap();
            store.delete("a").await.unwrap();
            store.close().await.unwrap();
        }
        let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
            .await
            .unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_scan_prefix_ordered() {
        let dir = tempdir().unwrap();
        let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
            .await
            .unwrap();
        store
            .set("raft/7/log/00000000000000000002", Bytes::from("e2"))
            .await
            .unwrap();
        store
            .set("raft/7/log/00000000000000000001", Bytes::from("e1"))
            .await
            .unwrap();
        store.set("raft/8/hs", Bytes::from("other")).await.unwrap();

        let entries = store.scan_prefix("raft/7/log/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "raft/7/log/00000000000000000001");
        assert_eq!(entries[1].0, "raft/7/log/00000000000000000002");
    }

    #[tokio::test]
    async fn test_value_size_limit() {
        let dir = tempdir().unwrap();
        let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
            .await
            .unwrap();
        let err = store
            .set("big", Bytes::from(vec![0u8; MAX_VALUE_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::ValueTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_rotation_preserves_state() {
        let dir = tempdir().unwrap();
        let config = SyncStoreConfig {
            snapshot_threshold: 512,
        };
        {
            let store = SyncStore::recover(dir.path(), config.clone()).await.unwrap();
            for i in 0..50 {
                store
                    .set(format!("key-{i:03}"), Bytes::from(vec![b'v'; 32]))
                    .await
                    .unwrap();
            }
            // The tiny threshold guarantees at least one rotation happened.
            assert!(dir.path().join("snap").exists());
        }
        let store = SyncStore::recover(dir.path(), config).await.unwrap();
        for i in 0..50 {
            assert!(store.get(&format!("key-{i:03}")).is_some(), "key-{i:03}");
        }
    }

    #[tokio::test]
    async fn test_batch_is_single_fsync_visible() {
        let dir = tempdir().unwrap();
        let store = SyncStore::recover(dir.path(), SyncStoreConfig::default())
            .await
            .unwrap();
        store
            .apply_batch(vec![
                WalRecord::put("x", Bytes::from("1")),
                WalRecord::put("y", Bytes::from("2")),
                WalRecord::delete("x"),
            ])
            .await
            .unwrap();
        assert_eq!(store.get("x"), None);
        assert_eq!(store.get("y"), Some(Bytes::from("2")));
    }
}
