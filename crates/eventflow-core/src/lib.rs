//! Core types shared across the EventFlow segment store.
//!
//! This crate holds the pieces every other crate needs: the 64-bit ID
//! scheme, the record types that flow from producers through Raft into
//! block files, the client-visible error taxonomy, and the server state
//! machine.

pub mod error;
pub mod id;
pub mod record;
pub mod state;

pub use error::{Error, ErrorKind, Result};
pub use id::{BlockId, EventlogId, SegmentId, ServerId, ServiceKind, VolumeId};
pub use record::{AppendRecord, Entry};
pub use state::ServerState;
