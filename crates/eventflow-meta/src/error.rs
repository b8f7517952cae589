//! Meta store errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("value of {got} bytes exceeds the {limit}-byte limit")]
    ValueTooLarge { got: usize, limit: usize },

    #[error("store is closed")]
    Closed,
}

impl From<MetaError> for eventflow_core::Error {
    fn from(e: MetaError) -> Self {
        use eventflow_core::Error as Core;
        match e {
            // A failed durable write in the meta store is fatal to the
            // process, not retryable.
            MetaError::Io(err) => Core::Fatal(format!("meta store io: {err}")),
            MetaError::ValueTooLarge { got, limit } => {
                Core::InvalidRequest(format!("value of {got} bytes exceeds {limit}"))
            }
            MetaError::Closed => Core::Fatal("meta store closed".into()),
        }
    }
}
