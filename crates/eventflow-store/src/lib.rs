//! The EventFlow segment server.
//!
//! Binds the block engine ([`eventflow_vsb`]) to the replication engine
//! ([`eventflow_raft`]) and to cluster metadata from the controller:
//!
//! - [`replica`] — one block + one Raft group, with the apply path and the
//!   per-replica state machine.
//! - [`server`] — the strict startup sequence (recover blocks → recover
//!   Raft → pair replicas → register → reconcile), heartbeats with block
//!   reports, and shutdown.
//! - [`service`] — the typed RPC surface (`Append`, `Read`, `Start`,
//!   `Stop`, `Status`, `CreateBlock`, `RemoveBlock`, `ActivateSegment`,
//!   `InactivateSegment`). Transport scaffolding lives outside this crate.
//! - [`controller`] — the client contract the store consumes from the
//!   controller, behind a trait so tests inject fakes.
//! - [`config`] — the `store.yaml` file.

pub mod config;
pub mod controller;
pub mod registry;
pub mod replica;
pub mod server;
pub mod service;

pub use config::StoreConfig;
pub use controller::{
    BlockReport, ControllerClient, RegisterResponse, ReplicaInfo, SegmentAssignment,
};
pub use registry::{EngineKind, EngineRegistry};
pub use replica::{Replica, ReplicaState};
pub use server::Server;
pub use service::{CreateBlockRequest, SegmentRecord, SegmentService};
