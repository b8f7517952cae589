//! Segment server lifecycle states.

use std::fmt;

/// Lifecycle of a segment server. Transitions are linear:
/// `Initializing → Started → Running → Stopping`. `Running` is entered only
/// after a successful controller registration, or immediately in debug mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initializing,
    Started,
    Running,
    Stopping,
}

impl ServerState {
    /// Textual form used by the `Status` RPC. The controller registry
    /// compares against `"running"` exactly.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Initializing => "initializing",
            ServerState::Started => "started",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
