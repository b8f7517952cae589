//! Live segment-server registry.
//!
//! Keyed independently by address and by server id. Reads go against the
//! two maps without coordination; mutation of the dual index is serialized
//! by one mutex so the maps stay consistent.
//!
//! A background scan (default every second) probes each server's `Status`
//! RPC through the [`ServerProbe`] seam; a server that is not `running` —
//! or whose probe exceeds the timeout — is dropped from both indices and
//! its connection closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use eventflow_core::{Error, Result, ServerId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Probe into one segment server. Production wires an RPC client; tests
/// inject fakes.
#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// The server's `Status` response, e.g. `"running"`.
    async fn status(&self) -> Result<String>;

    /// Close the underlying connection. Errors are logged, not propagated.
    async fn close(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SegmentServerInfo {
    pub id: ServerId,
    pub address: String,
    pub probe: Arc<dyn ServerProbe>,
}

impl std::fmt::Debug for SegmentServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentServerInfo")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Liveness scan tick.
    pub tick_interval: Duration,

    /// Per-probe timeout; a hung probe counts as inactive. Keep it at
    /// about 3× the tick interval.
    pub probe_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ServerRegistry {
    config: RegistryConfig,
    by_address: RwLock<HashMap<String, SegmentServerInfo>>,
    by_id: RwLock<HashMap<ServerId, SegmentServerInfo>>,
    // Serializes mutation of the dual index.
    mutate: Mutex<()>,
    stop: watch::Sender<bool>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            config,
            by_address: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            mutate: Mutex::new(()),
            stop,
            scan: Mutex::new(None),
        })
    }

    /// Add a server. Re-adding the same id at the same address is
    /// idempotent; a different id behind an already-known address is a
    /// duplicate and rejected.
    pub fn add_server(&self, server: SegmentServerInfo) -> Result<()> {
        let _guard = self.mutate.lock().unwrap();
        if let Some(existing) = self.by_address.read().unwrap().get(&server.address) {
            if existing.id == server.id {
                return Ok(());
            }
            return Err(Error::InvalidRequest(format!(
                "segment server at {} already added with id {}",
                server.address, existing.id
            )));
        }
        self.by_address
            .write()
            .unwrap()
            .insert(server.address.clone(), server.clone());
        self.by_id.write().unwrap().insert(server.id, server.clone());
        info!(
            server_id = %server.id,
            addr = %server.address,
            online = self.by_id.read().unwrap().len(),
            "segment server added"
        );
        Ok(())
    }

    /// Remove a server from both indices. Idempotent.
    pub fn remove_server(&self, server: &SegmentServerInfo) {
        let _guard = self.mutate.lock().unwrap();
        self.by_address.write().unwrap().remove(&server.address);
        self.by_id.write().unwrap().remove(&server.id);
        info!(
            server_id = %server.id,
            addr = %server.address,
            online = self.by_id.read().unwrap().len(),
            "segment server removed"
        );
    }

    pub fn get_by_address(&self, address: &str) -> Option<SegmentServerInfo> {
        self.by_address.read().unwrap().get(address).cloned()
    }

    pub fn get_by_id(&self, id: ServerId) -> Option<SegmentServerInfo> {
        self.by_id.read().unwrap().get(&id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.by_id.read().unwrap().len()
    }

    /// True iff at least `replica_num` servers are currently registered
    /// and answering their probes.
    pub async fn can_create_eventbus(&self, replica_num: usize) -> bool {
        let servers: Vec<SegmentServerInfo> =
            self.by_id.read().unwrap().values().cloned().collect();
        let mut active = 0;
        for server in servers {
            if self.is_active(&server).await {
                active += 1;
            }
        }
        active >= replica_num
    }

    async fn is_active(&self, server: &SegmentServerInfo) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, server.probe.status()).await {
            Ok(Ok(status)) => status == "running",
            Ok(Err(e)) => {
                warn!(addr = %server.address, error = %e, "segment server probe failed");
                false
            }
            Err(_) => {
                warn!(
                    addr = %server.address,
                    timeout = ?self.config.probe_timeout,
                    "segment server probe timed out"
                );
                false
            }
        }
    }

    /// Start the periodic liveness scan. The scan owns its own lifetime
    /// through the registry's stop channel; it never inherits a caller's
    /// deadline.
    pub fn run(self: &Arc<Self>) {
        let registry = self.clone();
        let mut stop = self.stop.subscribe();
        let tick = self.config.tick_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = stop.changed() => break,
                }
                registry.scan_once().await;
            }
        });
        *self.scan.lock().unwrap() = Some(task);
    }

    async fn scan_once(&self) {
        let servers: Vec<SegmentServerInfo> =
            self.by_address.read().unwrap().values().cloned().collect();
        for server in servers {
            if !self.is_active(&server).await {
                info!(
                    server_id = %server.id,
                    addr = %server.address,
                    "segment server is not active, evicting"
                );
                self.remove_server(&server);
                if let Err(e) = server.probe.close().await {
                    warn!(addr = %server.address, error = %e, "close probe connection failed");
                }
            }
        }
    }

    /// Stop the scan and close every connection. Close failures are
    /// logged, never propagated.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let task = self.scan.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let servers: Vec<SegmentServerInfo> =
            self.by_address.read().unwrap().values().cloned().collect();
        for server in servers {
            if let Err(e) = server.probe.close().await {
                warn!(
                    server_id = %server.id,
                    addr = %server.address,
                    error = %e,
                    "close connection to segment server failed"
                );
            }
        }
    }
}
