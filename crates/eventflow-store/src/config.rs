//! `store.yaml` configuration.
//!
//! ```yaml
//! ip: 10.0.0.5
//! port: 2148
//! controller_addresses:
//!   - 10.0.0.1:2048
//! volume:
//!   id: 1
//!   dir: /var/lib/eventflow/store
//!   capacity: 536870912000
//! vsb:
//!   flush: every_batch
//! raft:
//!   election_timeout_ms: 1000
//! meta_store:
//!   snapshot_threshold: 16777216
//! offset_store:
//!   flush_interval_ms: 100
//! observability:
//!   log_level: info
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub controller_addresses: Vec<String>,

    pub volume: VolumeConfig,

    #[serde(default)]
    pub vsb: eventflow_vsb::VsbConfig,

    #[serde(default)]
    pub raft: eventflow_raft::RaftConfig,

    #[serde(default)]
    pub meta_store: eventflow_meta::SyncStoreConfig,

    #[serde(default)]
    pub offset_store: eventflow_meta::AsyncStoreConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Heartbeat cadence towards the controller, milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Skip controller registration, allocate a test id, and go straight
    /// to `Running`.
    #[serde(default)]
    pub debug: bool,

    /// Keep on-disk files of blocks with no Raft metadata instead of
    /// deleting them at recovery.
    #[serde(default)]
    pub debug_retain_orphans: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub id: u64,
    pub dir: PathBuf,
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Advertised address, also the Raft transport endpoint.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn block_dir(&self) -> PathBuf {
        self.volume.dir.join("block")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.volume.dir.join("meta")
    }

    pub fn offset_dir(&self) -> PathBuf {
        self.volume.dir.join("offset")
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2148
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
ip: 10.1.2.3
port: 2148
controller_addresses:
  - 10.0.0.1:2048
  - 10.0.0.2:2048
volume:
  id: 7
  dir: /tmp/eventflow-store
  capacity: 1073741824
vsb:
  flush: every_append
raft:
  election_timeout_ms: 500
offset_store:
  flush_interval_ms: 50
observability:
  log_level: debug
"#;

    #[test]
    fn test_parse_full_config() {
        let config: StoreConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.ip, "10.1.2.3");
        assert_eq!(config.port, 2148);
        assert_eq!(config.local_addr(), "10.1.2.3:2148");
        assert_eq!(config.controller_addresses.len(), 2);
        assert_eq!(config.volume.id, 7);
        assert_eq!(config.volume.capacity, 1 << 30);
        assert_eq!(config.raft.election_timeout_ms, 500);
        assert_eq!(config.offset_store.flush_interval_ms, 50);
        assert_eq!(config.observability.log_level, "debug");
        assert!(!config.debug);
        assert_eq!(
            config.block_dir(),
            PathBuf::from("/tmp/eventflow-store/block")
        );
        assert_eq!(config.meta_dir(), PathBuf::from("/tmp/eventflow-store/meta"));
        assert_eq!(
            config.offset_dir(),
            PathBuf::from("/tmp/eventflow-store/offset")
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: StoreConfig = serde_yaml::from_str(
            "volume:\n  id: 1\n  dir: /data\n  capacity: 1024\n",
        )
        .unwrap();
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.port, 2148);
        assert_eq!(config.heartbeat_interval_ms, 3000);
        assert!(!config.debug_retain_orphans);
    }

    #[test]
    fn test_missing_volume_rejected() {
        assert!(serde_yaml::from_str::<StoreConfig>("ip: 1.2.3.4\n").is_err());
    }
}
