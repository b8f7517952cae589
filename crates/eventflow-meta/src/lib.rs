//! Durable key/value stores for small values (≤ 64 KiB).
//!
//! Two flavors over the same WAL + snapshot machinery:
//!
//! - [`SyncStore`] — every `set` is fsync'd before returning. Holds Raft
//!   hard state, conf state, log entries, and block archival markers;
//!   losing a write here would violate consensus, so it never happens
//!   silently.
//! - [`AsyncStore`] — writes are batched and flushed on a timer (default
//!   100 ms) and on clean shutdown. Holds hints (applied indexes, read
//!   high-water marks) where losing the last batch only costs replay work:
//!   the recovered value is a lower bound and Raft's commit index
//!   re-establishes the truth.
//!
//! Recovery loads the snapshot (itself a compacted WAL), replays the live
//! WAL on top, validates each record's CRC, and truncates at the first bad
//! record.

pub mod async_store;
pub mod config;
pub mod error;
pub mod sync_store;
pub mod wal;

pub use async_store::AsyncStore;
pub use config::{AsyncStoreConfig, SyncStoreConfig};
pub use error::{MetaError, Result};
pub use sync_store::SyncStore;
