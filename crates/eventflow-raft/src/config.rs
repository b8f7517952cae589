//! Raft tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Base election timeout; each follower randomizes in
    /// [timeout, 2 × timeout).
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Leader heartbeat interval; also the tick resolution of every group.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Compact the log into a snapshot reference once the bytes beyond the
    /// applied index exceed this.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Entries per AppendEntries message.
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Election timeout expressed in ticks of the heartbeat interval.
    pub fn election_ticks(&self) -> u64 {
        (self.election_timeout_ms / self.heartbeat_interval_ms).max(2)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: default_election_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            max_batch_entries: default_max_batch_entries(),
        }
    }
}

fn default_election_timeout_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_snapshot_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_max_batch_entries() -> usize {
    256
}
