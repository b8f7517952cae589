//! Controller-side pieces the segment store interacts with.
//!
//! - [`registry`] — the live view of segment servers: dual index by
//!   address and id, a periodic liveness scan probing each server's
//!   `Status` RPC, and the capacity check used when creating an eventbus.
//! - [`filter`] — the subscription filter tree as a tagged variant, with
//!   the one-dialect-per-node validation rule.

pub mod filter;
pub mod registry;

pub use filter::{Filter, FilterSpec};
pub use registry::{RegistryConfig, SegmentServerInfo, ServerProbe, ServerRegistry};
