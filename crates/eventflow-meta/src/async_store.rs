//! The asynchronous store: batched writes, timer-driven flush.
//!
//! `set`/`delete` update the in-memory view immediately and buffer the WAL
//! record; a background task flushes the buffer every `flush_interval`
//! (default 100 ms) and `close()` flushes whatever remains. After a crash
//! the last unflushed batch is gone — acceptable for hints, where the
//! recovered value is a lower bound.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{AsyncStoreConfig, MAX_VALUE_SIZE};
use crate::error::{MetaError, Result};
use crate::wal::{self, Wal, WalRecord};

struct Shared {
    state: Mutex<BTreeMap<String, Bytes>>,
    pending: Mutex<Vec<WalRecord>>,
    closed: Mutex<bool>,
}

pub struct AsyncStore {
    dir: PathBuf,
    config: AsyncStoreConfig,
    shared: Arc<Shared>,
    wal: tokio::sync::Mutex<Wal>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl AsyncStore {
    /// Recover the store from `dir` and start the flush task.
    pub async fn recover(dir: impl AsRef<Path>, config: AsyncStoreConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut state = BTreeMap::new();
        wal::load_snapshot(dir.join("snap"), &mut state).await?;
        let wal = Wal::open(dir.join("wal"), &mut state).await?;
        info!(
            dir = %dir.display(),
            keys = state.len(),
            wal_bytes = wal.size(),
            "async store recovered"
        );

        let store = Arc::new(Self {
            dir,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                pending: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            }),
            wal: tokio::sync::Mutex::new(wal),
            flusher: Mutex::new(None),
            stop: Arc::new(Notify::new()),
        });

        let flusher = {
            let store = store.clone();
            let stop = store.stop.clone();
            let interval = store.config.flush_interval();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = stop.notified() => break,
                    }
                    if let Err(e) = store.flush().await {
                        // Hint loss is tolerable; hint *write* failure is
                        // noisy but not fatal.
                        error!(error = %e, "async store flush failed");
                    }
                }
            })
        };
        *store.flusher.lock().unwrap() = Some(flusher);
        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.shared.state.lock().unwrap().get(key).cloned()
    }

    /// Record a value. Visible to `get` immediately, durable on the next
    /// flush tick or `close`.
    pub fn set(&self, key: impl Into<String>, value: Bytes) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(MetaError::ValueTooLarge {
                got: value.len(),
                limit: MAX_VALUE_SIZE,
            });
        }
        if *self.shared.closed.lock().unwrap() {
            return Err(MetaError::Closed);
        }
        let key = key.into();
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(key.clone(), value.clone());
        self.shared
            .pending
            .lock()
            .unwrap()
            .push(WalRecord::put(key, value));
        Ok(())
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<()> {
        if *self.shared.closed.lock().unwrap() {
            return Err(MetaError::Closed);
        }
        let key = key.into();
        self.shared.state.lock().unwrap().remove(&key);
        self.shared
            .pending
            .lock()
            .unwrap()
            .push(WalRecord::delete(key));
        Ok(())
    }

    /// Drain the pending buffer to the WAL and fsync.
    pub async fn flush(&self) -> Result<()> {
        let batch: Vec<WalRecord> = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        let mut wal = self.wal.lock().await;
        wal.append(&batch).await?;
        wal.sync().await?;
        debug!(records = batch.len(), "async store flushed");

        if wal.size() >= self.config.snapshot_threshold {
            let snapshot = self.shared.state.lock().unwrap().clone();
            *wal = wal::rotate(self.dir.join("snap"), self.dir.join("wal"), &snapshot).await?;
        }
        Ok(())
    }

    /// Flush outstanding writes and stop the flush task. Further writes
    /// fail `Closed`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut closed = self.shared.closed.lock().unwrap();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.stop.notify_waiters();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_config() -> AsyncStoreConfig {
        AsyncStoreConfig {
            flush_interval_ms: 20,
            ..AsyncStoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_set_visible_immediately() {
        let dir = tempdir().unwrap();
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        store.set("hint", Bytes::from("42")).unwrap();
        assert_eq!(store.get("hint"), Some(Bytes::from("42")));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_flush_becomes_durable() {
        let dir = tempdir().unwrap();
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        store.set("k", Bytes::from("v")).unwrap();

        // A couple of flush ticks pass; the record reaches the WAL without
        // any explicit flush or close.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let wal_len = std::fs::metadata(dir.path().join("wal")).unwrap().len();
        assert!(wal_len > 0, "timer flush should have written the wal");
        assert!(store.shared.pending.lock().unwrap().is_empty());

        store.close().await.unwrap();
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        assert_eq!(store.get("k"), Some(Bytes::from("v")));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_pending() {
        let dir = tempdir().unwrap();
        {
            // Interval long enough that no timer tick fires during the test.
            let config = AsyncStoreConfig {
                flush_interval_ms: 60_000,
                ..AsyncStoreConfig::default()
            };
            let store = AsyncStore::recover(dir.path(), config).await.unwrap();
            store.set("only-on-close", Bytes::from("yes")).unwrap();
            store.close().await.unwrap();
        }
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        assert_eq!(store.get("only-on-close"), Some(Bytes::from("yes")));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unflushed_batch_lost_on_crash() {
        let dir = tempdir().unwrap();
        {
            let config = AsyncStoreConfig {
                flush_interval_ms: 60_000,
                ..AsyncStoreConfig::default()
            };
            let store = AsyncStore::recover(dir.path(), config).await.unwrap();
            store.set("durable", Bytes::from("1")).unwrap();
            store.flush().await.unwrap();
            store.set("volatile", Bytes::from("2")).unwrap();
            // Simulated crash: no flush, no close.
        }
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        assert_eq!(store.get("durable"), Some(Bytes::from("1")));
        assert_eq!(store.get("volatile"), None);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_after_close_fail() {
        let dir = tempdir().unwrap();
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.set("k", Bytes::from("v")).unwrap_err(),
            MetaError::Closed
        ));
        assert!(matches!(store.delete("k").unwrap_err(), MetaError::Closed));
        // close is idempotent
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_persisted() {
        let dir = tempdir().unwrap();
        {
            let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
            store.set("a", Bytes::from("1")).unwrap();
            store.set("b", Bytes::from("2")).unwrap();
            store.delete("a").unwrap();
            store.close().await.unwrap();
        }
        let store = AsyncStore::recover(dir.path(), fast_config()).await.unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), Some(Bytes::from("2")));
        store.close().await.unwrap();
    }
}
