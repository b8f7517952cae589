//! Block engine configuration.

use serde::{Deserialize, Serialize};

/// When the engine calls `fsync` on the block file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Sync once per append batch. The default: a batch of committed
    /// entries becomes durable together before the append is acknowledged.
    #[default]
    EveryBatch,

    /// Sync after every single frame. Safest, slowest.
    EveryAppend,

    /// Never sync explicitly. For tests only.
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsbConfig {
    /// Fsync cadence for appends.
    #[serde(default)]
    pub flush: FlushPolicy,

    /// Depth of the archived-listener queue.
    #[serde(default = "default_listener_queue_depth")]
    pub listener_queue_depth: usize,
}

fn default_listener_queue_depth() -> usize {
    256
}

impl Default for VsbConfig {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            listener_queue_depth: default_listener_queue_depth(),
        }
    }
}
