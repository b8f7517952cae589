//! Raft engine errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error)]
pub enum RaftError {
    /// Propose reached a non-leader. Carries the endpoint of the current
    /// leader when known.
    #[error("not leader (leader hint: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("unknown raft group for block {0}")]
    UnknownGroup(u64),

    /// Meta store write failed; the group is inoperable until operator
    /// action. Never retried silently.
    #[error("raft storage failure: {0}")]
    Storage(#[from] eventflow_meta::MetaError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("group is shutting down")]
    Stopped,

    /// The proposal was superseded by a leader change before commit; the
    /// entry may or may not survive. Safe to retry with an idempotency key.
    #[error("proposal dropped by leader change")]
    ProposalDropped,

    #[error("wire decode failure: {0}")]
    Codec(String),

    /// Applying a committed entry to the block failed; the group is
    /// inoperable pending operator action.
    #[error("apply failure: {0}")]
    Apply(String),
}

impl From<RaftError> for eventflow_core::Error {
    fn from(e: RaftError) -> Self {
        use eventflow_core::Error as Core;
        match e {
            RaftError::NotLeader { leader } => Core::NotLeader { leader },
            RaftError::UnknownGroup(id) => {
                Core::InvalidRequest(format!("unknown block {id:016X}"))
            }
            RaftError::Storage(err) => err.into(),
            RaftError::Transport(msg) => Core::Transient(msg),
            RaftError::Stopped => Core::Transient("raft group stopped".into()),
            RaftError::ProposalDropped => Core::Transient("proposal dropped".into()),
            RaftError::Codec(msg) => Core::Corrupt(msg),
            RaftError::Apply(msg) => Core::Fatal(msg),
        }
    }
}
