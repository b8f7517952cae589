//! Pluggable Raft transport.
//!
//! The wire is a plain length-prefixed TCP stream:
//!
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | Payload          |
//! +------------------+------------------+
//! ```
//!
//! The first payload byte tags the frame: a routed Raft message, a bulk
//! block-fetch request, or its response. Consensus messages are fire and
//! forget — Raft's heartbeats and response-driven resends are the real
//! retry mechanism — while connection setup retries with jittered backoff.
//!
//! [`MemoryNetwork`] provides an in-process loopback with the same
//! semantics for multi-node tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use eventflow_core::BlockId;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, warn};

use crate::error::{RaftError, Result};
use crate::types::Message;

/// Maximum frame size (128 MiB): bulk block fetches ride the same framing.
const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

const FRAME_MESSAGE: u8 = 0;
const FRAME_FETCH_REQ: u8 = 1;
const FRAME_FETCH_RESP: u8 = 2;

/// How the engine hands inbound traffic to its groups, and how the bulk
/// fetch finds block bytes to serve.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_message(&self, msg: Message);

    /// Serve the durable bytes of a local block for snapshot fetch.
    async fn read_block(&self, block: BlockId) -> eventflow_core::Result<Bytes>;
}

#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    /// Best-effort delivery of one consensus message.
    async fn send(&self, endpoint: &str, msg: Message) -> Result<()>;

    /// Fetch the full byte image of `block` from a peer.
    async fn fetch_block(&self, endpoint: &str, block: BlockId) -> Result<Bytes>;
}

// ---------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------

struct RaftCodec;

impl Decoder for RaftCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<BytesMut>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = (&src[..4]).get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame size {length} exceeds maximum {MAX_FRAME_SIZE}"),
            ));
        }
        let total = 4 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for RaftCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame size {} exceeds maximum {MAX_FRAME_SIZE}", item.len()),
            ));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------

/// Client side: one persistent connection per peer endpoint, re-dialed on
/// failure with jittered backoff.
#[derive(Clone, Default)]
pub struct TcpTransport {
    conns: Arc<Mutex<HashMap<String, mpsc::Sender<Bytes>>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, endpoint: &str) -> mpsc::Sender<Bytes> {
        let mut conns = self.conns.lock().unwrap();
        if let Some(tx) = conns.get(endpoint) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel::<Bytes>(1024);
        conns.insert(endpoint.to_string(), tx.clone());
        let this = self.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            this.drive_connection(endpoint, rx).await;
        });
        tx
    }

    async fn drive_connection(self, endpoint: String, mut rx: mpsc::Receiver<Bytes>) {
        let stream = match dial_with_backoff(&endpoint, 3).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "peer dial failed, dropping queued messages");
                self.conns.lock().unwrap().remove(&endpoint);
                return;
            }
        };
        let mut framed = Framed::new(stream, RaftCodec);
        while let Some(frame) = rx.recv().await {
            if let Err(e) = framed.send(frame).await {
                debug!(endpoint = %endpoint, error = %e, "peer connection broken");
                break;
            }
        }
        self.conns.lock().unwrap().remove(&endpoint);
    }
}

#[async_trait::async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, endpoint: &str, msg: Message) -> Result<()> {
        let mut frame = BytesMut::new();
        frame.put_u8(FRAME_MESSAGE);
        frame.extend_from_slice(&msg.encode());
        let tx = self.sender_for(endpoint);
        tx.send(frame.freeze())
            .await
            .map_err(|_| RaftError::Transport(format!("connection to {endpoint} closed")))
    }

    async fn fetch_block(&self, endpoint: &str, block: BlockId) -> Result<Bytes> {
        // Bulk fetches get their own short-lived connection so a large
        // transfer never blocks consensus traffic.
        let stream = dial_with_backoff(endpoint, 3).await?;
        let mut framed = Framed::new(stream, RaftCodec);
        let mut req = BytesMut::with_capacity(9);
        req.put_u8(FRAME_FETCH_REQ);
        req.put_u64_le(block.as_u64());
        framed
            .send(req.freeze())
            .await
            .map_err(|e| RaftError::Transport(e.to_string()))?;

        match framed.next().await {
            Some(Ok(mut frame)) => {
                if frame.len() < 2 || frame[0] != FRAME_FETCH_RESP {
                    return Err(RaftError::Codec("bad fetch response frame".into()));
                }
                frame.advance(1);
                let ok = frame.get_u8() != 0;
                if !ok {
                    return Err(RaftError::Transport(format!(
                        "peer {endpoint} has no block {block}"
                    )));
                }
                Ok(frame.freeze())
            }
            Some(Err(e)) => Err(RaftError::Transport(e.to_string())),
            None => Err(RaftError::Transport("connection closed mid-fetch".into())),
        }
    }
}

async fn dial_with_backoff(endpoint: &str, attempts: u32) -> Result<TcpStream> {
    let mut delay = Duration::from_millis(50);
    let mut last = None;
    for attempt in 0..attempts {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last = Some(e);
                if attempt + 1 < attempts {
                    let jitter = rand::thread_rng().gen_range(0..delay.as_millis().max(1) as u64);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(RaftError::Transport(format!(
        "dial {endpoint} failed: {}",
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Server side: accepts peer connections and feeds frames to the handler.
pub struct RaftListener {
    local_addr: std::net::SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RaftListener {
    pub async fn bind(addr: &str, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RaftError::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RaftError::Transport(e.to_string()))?;
        info!(addr = %local_addr, "raft transport listening");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let handler = handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(stream, handler).await {
                                        debug!(peer = %peer, error = %e, "raft connection ended");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "raft accept failed");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("raft transport shutting down");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, RaftCodec);
    while let Some(frame) = framed.next().await {
        let mut frame = frame?;
        if frame.is_empty() {
            continue;
        }
        let tag = frame[0];
        frame.advance(1);
        match tag {
            FRAME_MESSAGE => match Message::decode(frame.freeze()) {
                Ok(msg) => handler.handle_message(msg).await,
                Err(e) => warn!(error = %e, "undecodable raft message"),
            },
            FRAME_FETCH_REQ => {
                if frame.len() != 8 {
                    warn!("malformed fetch request");
                    continue;
                }
                let block = BlockId::from_u64(frame.get_u64_le());
                let mut resp = BytesMut::new();
                resp.put_u8(FRAME_FETCH_RESP);
                match handler.read_block(block).await {
                    Ok(bytes) => {
                        resp.put_u8(1);
                        resp.extend_from_slice(&bytes);
                    }
                    Err(e) => {
                        warn!(block = %block, error = %e, "block fetch refused");
                        resp.put_u8(0);
                    }
                }
                framed.send(resp.freeze()).await?;
            }
            t => warn!(tag = t, "unknown frame tag"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// In-memory loopback for tests
// ---------------------------------------------------------------------

/// Registry of in-process endpoints. Cloneable; all clones share the same
/// address space.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    handlers: Arc<Mutex<HashMap<String, Arc<dyn InboundHandler>>>>,
    partitions: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn InboundHandler>) {
        self.handlers
            .lock()
            .unwrap()
            .insert(endpoint.into(), handler);
    }

    pub fn unregister(&self, endpoint: &str) {
        self.handlers.lock().unwrap().remove(endpoint);
    }

    /// Cut traffic in both directions between two endpoints.
    pub fn partition(&self, a: impl Into<String>, b: impl Into<String>) {
        self.partitions.lock().unwrap().push((a.into(), b.into()));
    }

    pub fn heal(&self) {
        self.partitions.lock().unwrap().clear();
    }

    fn blocked(&self, from: &str, to: &str) -> bool {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .any(|(a, b)| (a == from && b == to) || (a == to && b == from))
    }

    /// A transport bound to `local` as its source endpoint.
    pub fn transport(&self, local: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: local.into(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: String,
}

#[async_trait::async_trait]
impl RaftTransport for MemoryTransport {
    async fn send(&self, endpoint: &str, msg: Message) -> Result<()> {
        if self.network.blocked(&self.local, endpoint) {
            return Err(RaftError::Transport("partitioned".into()));
        }
        let handler = self.network.handlers.lock().unwrap().get(endpoint).cloned();
        match handler {
            Some(handler) => {
                // Deliver on a fresh task: a handler is free to send more
                // messages from inside its own delivery.
                tokio::spawn(async move {
                    handler.handle_message(msg).await;
                });
                Ok(())
            }
            None => Err(RaftError::Transport(format!("no endpoint {endpoint}"))),
        }
    }

    async fn fetch_block(&self, endpoint: &str, block: BlockId) -> Result<Bytes> {
        if self.network.blocked(&self.local, endpoint) {
            return Err(RaftError::Transport("partitioned".into()));
        }
        let handler = self.network.handlers.lock().unwrap().get(endpoint).cloned();
        match handler {
            Some(handler) => handler
                .read_block(block)
                .await
                .map_err(|e| RaftError::Transport(e.to_string())),
            None => Err(RaftError::Transport(format!("no endpoint {endpoint}"))),
        }
    }
}
