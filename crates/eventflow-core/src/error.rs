//! Client-visible error taxonomy.
//!
//! Lower layers (block engine, meta stores, Raft) each carry their own
//! error enums; the server layer maps everything onto these kinds before a
//! response leaves the process. The kinds, not the type names, are the
//! contract: clients branch on [`ErrorKind`] to decide whether to retry,
//! redirect, or give up.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or an unknown block; not retryable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Append reached a follower. `leader` carries the latest known leader
    /// endpoint when we have one, so the client can redirect.
    #[error("not leader (leader hint: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// Read past the end of a block.
    #[error("offset {offset} out of range, last offset is {last}")]
    OffsetOutOfRange { offset: u64, last: i64 },

    /// Append would exceed the block's capacity; the controller rolls the
    /// segment in response.
    #[error("block is full")]
    BlockFull,

    /// Bad CRC or header. Fatal to the affected block; it is quarantined.
    #[error("corrupt block data: {0}")]
    Corrupt(String),

    /// Transport timeout or temporary disk error; retried internally with
    /// backoff before it ever surfaces.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable process-level failure (e.g. meta store write failed).
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Discriminant of [`Error`] for mapping and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    NotLeader,
    OffsetOutOfRange,
    BlockFull,
    Corrupt,
    Transient,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::NotLeader { .. } => ErrorKind::NotLeader,
            Error::OffsetOutOfRange { .. } => ErrorKind::OffsetOutOfRange,
            Error::BlockFull => ErrorKind::BlockFull,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a client may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotLeader | ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::InvalidRequest("x".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            Error::NotLeader { leader: None }.kind(),
            ErrorKind::NotLeader
        );
        assert_eq!(
            Error::OffsetOutOfRange { offset: 5, last: 2 }.kind(),
            ErrorKind::OffsetOutOfRange
        );
        assert_eq!(Error::BlockFull.kind(), ErrorKind::BlockFull);
        assert_eq!(Error::Corrupt("crc".into()).kind(), ErrorKind::Corrupt);
        assert_eq!(Error::Transient("t".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Fatal("f".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NotLeader { leader: None }.is_retryable());
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(!Error::BlockFull.is_retryable());
        assert!(!Error::Corrupt("bad".into()).is_retryable());
    }

    #[test]
    fn test_not_leader_hint_display() {
        let with_hint = Error::NotLeader {
            leader: Some("10.0.0.2:2148".into()),
        };
        assert!(with_hint.to_string().contains("10.0.0.2:2148"));

        let without = Error::NotLeader { leader: None };
        assert!(without.to_string().contains("unknown"));
    }
}
