//! Raft replication for EventFlow blocks.
//!
//! Every block is one member of a per-segment Raft group; the member ID is
//! the block's ID. This crate runs one consensus state machine per local
//! block: leader election with pre-vote, log replication, single-step
//! membership change (learner first, then promotion), and snapshots that
//! reference the underlying block instead of copying it.
//!
//! Persistent state lives in the synchronous meta store (hard state, conf
//! state, log entries) and the asynchronous offset store (applied-index
//! hints). The transport is pluggable: a framed TCP implementation for
//! production and an in-memory loopback for tests.
//!
//! Layering, bottom up:
//!
//! - [`types`] — wire messages, log entries, persistent state, codecs.
//! - [`log`] — the durable log view over the meta store.
//! - [`node`] — the single-group consensus state machine, pure and
//!   deterministic: inputs are steps/ticks/proposals, outputs are a
//!   [`Ready`](node::Ready) bundle of persistence, messages, and commits.
//! - [`group`] — the per-block driver task that owns a node, persists its
//!   output, talks to the transport, and applies committed entries.
//! - [`engine`] — the multi-group facade the segment server uses.

pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod log;
pub mod node;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use engine::{Appender, GroupSeed, RaftEngine, RaftEngineBuilder};
pub use error::{RaftError, Result};
pub use group::{
    Applier, EntryAppendedListener, GroupStatus, LeaderChangedListener, SnapshotInstaller,
};
pub use transport::{
    InboundHandler, MemoryNetwork, MemoryTransport, RaftListener, RaftTransport, TcpTransport,
};
pub use types::{
    ConfChange, ConfChangeKind, ConfState, HardState, LogEntry, Message, SnapshotMeta,
};
