//! The `store` binary: one segment server.
//!
//! Exit codes: 0 normal, -1 config or listen failure, -2 initialization
//! failure, -3 id-generator failure.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use eventflow_core::{id, BlockId, ServiceKind};
use eventflow_raft::{InboundHandler, Message, RaftListener, TcpTransport};
use eventflow_store::{EngineKind, EngineRegistry, Server, StoreConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "store", about = "EventFlow segment server")]
struct Args {
    /// Path to the store configuration file.
    #[arg(short, long, default_value = "./config/store.yaml")]
    config: PathBuf,
}

/// Routes transport frames into the engine and serves block bytes for
/// snapshot fetches.
struct StoreInbound {
    server: Arc<Server>,
}

#[async_trait]
impl InboundHandler for StoreInbound {
    async fn handle_message(&self, msg: Message) {
        if let Some(raft) = self.server.raft() {
            raft.handle_message(msg).await;
        }
    }

    async fn read_block(&self, block: BlockId) -> eventflow_core::Result<Bytes> {
        let replica = self.server.replica(block).ok_or_else(|| {
            eventflow_core::Error::InvalidRequest(format!("unknown block {block}"))
        })?;
        let handle = replica.block();
        handle
            .flush()
            .await
            .map_err(eventflow_core::Error::from)?;
        tokio::fs::read(handle.path())
            .await
            .map(Bytes::from)
            .map_err(|e| eventflow_core::Error::Transient(e.to_string()))
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match StoreConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("initialize store config failed: {e}");
            exit(-1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.observability.log_level.clone())),
        )
        .init();

    let registry = Arc::new(EngineRegistry::new());
    let transport = Arc::new(TcpTransport::new());
    let controller: Arc<dyn eventflow_store::ControllerClient> =
        match controller_client(&config) {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "controller client setup failed");
                exit(-1);
            }
        };

    let server = Server::new(config.clone(), registry.clone(), controller, transport);

    // The raft transport must be listening before peers are reconciled.
    let mut listener = match RaftListener::bind(
        &config.local_addr(),
        Arc::new(StoreInbound {
            server: server.clone(),
        }),
    )
    .await
    {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.local_addr(), "listen failed");
            exit(-1);
        }
    };

    if let Err(e) = server.initialize().await {
        error!(error = %e, "segment server initialization failed");
        exit(-2);
    }

    info!(
        listen_ip = %config.ip,
        listen_port = config.port,
        "segment server ready to work"
    );

    if let Err(e) = id::init(ServiceKind::Store, (config.volume.id & 0x3FF) as u16) {
        error!(error = %e, "init id generator failed");
        exit(-3);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received system signal, preparing exit"),
        Err(e) => error!(error = %e, "signal handler failed"),
    }

    server.stop().await;
    listener.shutdown().await;
    registry.close_all().await;
    id::destroy();
    info!("segment server has been shutdown");
}

/// Placeholder wiring for the controller RPC client. The concrete client
/// (gRPC scaffolding) lives outside the store core; a deployment links one
/// in here.
fn controller_client(
    config: &StoreConfig,
) -> anyhow::Result<Arc<dyn eventflow_store::ControllerClient>> {
    if !config.debug && config.controller_addresses.is_empty() {
        anyhow::bail!("controller_addresses must not be empty outside debug mode");
    }
    Ok(Arc::new(NullController))
}

/// Controller stub used in debug mode, where registration is skipped
/// entirely.
struct NullController;

#[async_trait]
impl eventflow_store::ControllerClient for NullController {
    async fn wait_for_ready(&self) -> eventflow_core::Result<()> {
        Ok(())
    }

    async fn register_segment_server(
        &self,
        _address: &str,
        _volume: eventflow_core::VolumeId,
        _capacity: u64,
    ) -> eventflow_core::Result<eventflow_store::RegisterResponse> {
        Err(eventflow_core::Error::Transient(
            "no controller client linked".into(),
        ))
    }

    async fn heartbeat(
        &self,
        _server: eventflow_core::ServerId,
        _reports: Vec<eventflow_store::BlockReport>,
    ) -> eventflow_core::Result<()> {
        Ok(())
    }
}
