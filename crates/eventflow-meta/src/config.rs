//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Values larger than this are rejected; the stores are for metadata, not
/// payloads.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStoreConfig {
    /// Rewrite the snapshot and reset the WAL once the WAL grows past this.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

impl Default for SyncStoreConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: default_snapshot_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncStoreConfig {
    /// How often buffered writes are flushed to the WAL.
    #[serde(default = "default_flush_interval_ms", rename = "flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Rewrite the snapshot and reset the WAL once the WAL grows past this.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

impl AsyncStoreConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for AsyncStoreConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            snapshot_threshold: default_snapshot_threshold(),
        }
    }
}

fn default_snapshot_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(SyncStoreConfig::default().snapshot_threshold, 16 << 20);
        let async_cfg = AsyncStoreConfig::default();
        assert_eq!(async_cfg.flush_interval(), Duration::from_millis(100));
    }
}
