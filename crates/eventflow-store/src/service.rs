//! Typed RPC surface of the segment server.
//!
//! Transport scaffolding (gRPC codegen, listeners) stays outside the core;
//! this is the handler layer it calls into. Every operation validates its
//! input, resolves the replica, and maps lower-layer errors onto the
//! client-visible kinds.

use std::collections::HashMap;

use bytes::Bytes;
use eventflow_core::{AppendRecord, BlockId, Error, Result, SegmentId, ServerId};
use std::sync::Arc;

use crate::server::Server;

/// A record as returned by `Read`: the entry's offset plus the decoded
/// producer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub timestamp_ns: u64,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct CreateBlockRequest {
    pub block: BlockId,
    pub capacity: u64,
    /// Block id → endpoint for every replica of the segment, this one
    /// included (its endpoint may be empty).
    pub members: HashMap<u64, String>,
}

#[derive(Clone)]
pub struct SegmentService {
    server: Arc<Server>,
}

impl SegmentService {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub async fn append(
        &self,
        block: BlockId,
        records: Vec<AppendRecord>,
    ) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Err(Error::InvalidRequest("no records".into()));
        }
        let replica = self
            .server
            .replica(block)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown block {block}")))?;
        replica.append(records).await
    }

    pub async fn read(
        &self,
        block: BlockId,
        offset: u64,
        max_bytes: u64,
    ) -> Result<Vec<SegmentRecord>> {
        let replica = self
            .server
            .replica(block)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown block {block}")))?;
        let entries = replica.read(offset, max_bytes).await?;
        entries
            .into_iter()
            .map(|entry| {
                let record = AppendRecord::decode(entry.payload)
                    .map_err(|e| Error::Corrupt(format!("undecodable record: {e}")))?;
                Ok(SegmentRecord {
                    offset: entry.offset,
                    key: record.key,
                    timestamp_ns: record.timestamp_ns,
                    value: record.value,
                })
            })
            .collect()
    }

    pub async fn start(&self, server_id: ServerId) -> Result<()> {
        self.server.start(Some(server_id)).await
    }

    pub async fn stop(&self) {
        self.server.stop().await;
    }

    pub fn status(&self) -> String {
        self.server.state().as_str().to_string()
    }

    pub async fn create_block(&self, req: CreateBlockRequest) -> Result<()> {
        if req.block.is_none() {
            return Err(Error::InvalidRequest("block id must not be zero".into()));
        }
        if req.capacity == 0 {
            return Err(Error::InvalidRequest("capacity must be positive".into()));
        }
        self.server
            .create_block(req.block, req.capacity, req.members)
            .await
    }

    pub async fn remove_block(&self, block: BlockId) -> Result<()> {
        self.server.remove_block(block).await
    }

    pub async fn activate_segment(
        &self,
        segment: SegmentId,
        target_leader: BlockId,
    ) -> Result<()> {
        self.server.activate_segment(segment, target_leader).await
    }

    pub async fn inactivate_segment(&self, segment: SegmentId) -> Result<()> {
        self.server.inactivate_segment(segment).await
    }
}
