//! Contract consumed from the controller.
//!
//! The controller owns segment metadata; the store only registers itself,
//! heartbeats with block reports, and receives segment assignments. The
//! trait keeps the RPC plumbing out of this crate and lets tests inject a
//! fake.

use std::collections::HashMap;

use async_trait::async_trait;
use eventflow_core::{BlockId, EventlogId, Result, SegmentId, ServerId, VolumeId};

/// One replica of a segment as the controller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub volume: VolumeId,
    /// Empty when the controller has not seen the hosting server yet.
    pub endpoint: String,
}

/// A segment and its replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAssignment {
    pub id: SegmentId,
    pub eventlog: EventlogId,
    pub replicas: HashMap<BlockId, ReplicaInfo>,
}

#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub server_id: ServerId,
    pub segments: HashMap<SegmentId, SegmentAssignment>,
}

/// Per-block state reported in each heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub block: BlockId,
    pub size: u64,
    pub first_offset: u64,
    pub last_offset: i64,
    pub archived: bool,
    pub is_leader: bool,
}

#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Block until a quorum of controller replicas responds.
    async fn wait_for_ready(&self) -> Result<()>;

    async fn register_segment_server(
        &self,
        address: &str,
        volume: VolumeId,
        capacity: u64,
    ) -> Result<RegisterResponse>;

    async fn heartbeat(&self, server: ServerId, reports: Vec<BlockReport>) -> Result<()>;
}
