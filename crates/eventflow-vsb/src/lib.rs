//! VSB: the append-only block file format.
//!
//! A VSB file holds the records of a single block, one replica of a
//! segment. The format is self-describing and crash-safe: a torn tail
//! frame is detected by CRC and truncated away on open.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (4 KiB, written once at create)                      │
//! │ - Magic bytes: "VSB0" (4 bytes)                             │
//! │ - Version (2 bytes)                                         │
//! │ - Flags (2 bytes)                                           │
//! │ - Block ID (8 bytes)                                        │
//! │ - Capacity (8 bytes)                                        │
//! │ - Created at, nanoseconds (8 bytes)                         │
//! │ - Zero fill to 4096                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Frame 0                                                     │
//! │ - Length (4 bytes, excludes itself and the CRC)             │
//! │ - Offset (8 bytes, dense, previous + 1)                     │
//! │ - Timestamp, nanoseconds (8 bytes)                          │
//! │ - Payload length (4 bytes)                                  │
//! │ - Payload bytes                                             │
//! │ - CRC32 (4 bytes, over the whole frame except itself)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │ ...                                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index (written at archival)                                 │
//! │ - For each frame: offset (8 bytes), file position (8 bytes) │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (20 bytes, written at archival)                      │
//! │ - Entry count (8 bytes)                                     │
//! │ - Index start position (8 bytes)                            │
//! │ - Trailer magic: "VSBT" (4 bytes)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. A block with no footer is `Working`; a
//! block with a footer is `Archived` and sealed read-only.
//!
//! ## Concurrency
//!
//! One writer, many readers. The writer holds a short mutex only around the
//! tail-position update; readers snapshot the tail under the same mutex and
//! then read from their own file handle without locking.

pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;

pub use block::{Block, BlockState, BlockStat};
pub use config::VsbConfig;
pub use engine::{ArchivedListener, Engine};
pub use error::{Result, VsbError};
