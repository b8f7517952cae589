//! Block engine errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VsbError>;

#[derive(Debug, Error)]
pub enum VsbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic or version mismatch in the 4 KiB header.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// Structural damage past the header (bad index, impossible positions).
    #[error("corrupt block: {0}")]
    Corrupt(String),

    #[error("offset {offset} out of range, last offset is {last}")]
    OffsetOutOfRange { offset: u64, last: i64 },

    #[error("block is full")]
    Full,

    #[error("block has been deleted")]
    Deleted,
}

impl From<VsbError> for eventflow_core::Error {
    fn from(e: VsbError) -> Self {
        use eventflow_core::Error as Core;
        match e {
            VsbError::Io(err) => Core::Transient(err.to_string()),
            VsbError::CorruptHeader(msg) | VsbError::Corrupt(msg) => Core::Corrupt(msg),
            VsbError::OffsetOutOfRange { offset, last } => {
                Core::OffsetOutOfRange { offset, last }
            }
            VsbError::Full => Core::BlockFull,
            VsbError::Deleted => Core::InvalidRequest("block has been deleted".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_core::ErrorKind;

    #[test]
    fn test_mapping_to_client_kinds() {
        let cases: Vec<(VsbError, ErrorKind)> = vec![
            (VsbError::CorruptHeader("magic".into()), ErrorKind::Corrupt),
            (VsbError::Corrupt("index".into()), ErrorKind::Corrupt),
            (
                VsbError::OffsetOutOfRange { offset: 9, last: 3 },
                ErrorKind::OffsetOutOfRange,
            ),
            (VsbError::Full, ErrorKind::BlockFull),
            (VsbError::Deleted, ErrorKind::InvalidRequest),
        ];
        for (err, kind) in cases {
            let core: eventflow_core::Error = err.into();
            assert_eq!(core.kind(), kind);
        }
    }
}
