//! Error taxonomy for conversion requests.
//!
//! Only [`Error::InvalidInput`], [`Error::InvalidScore`] and [`Error::ResourceExceeded`] ever
//! abort a whole request. Backend failures are contained per batch/row and surface as record
//! markers; cancellation is not an error at all (the engine returns a `sampled` partial result).

use thiserror::Error;

/// Coarse classification of an [`Error`], for callers that only need to branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ResourceExceeded,
    Backend,
    Storage,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed identifiers, dangling relationship endpoints, inconsistent vectors.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A confidence score or factor outside `[0, 1]`.
    #[error("invalid confidence score: {value} (must be within [0, 1])")]
    InvalidScore { value: f64 },

    /// Input cardinality above the configured hard cap. No partial attempt is made.
    #[error("{operation}: {n} items exceeds the configured hard cap of {cap}")]
    ResourceExceeded {
        operation: &'static str,
        n: usize,
        cap: usize,
    },

    /// An embedding backend call failed. Never fatal to a conversion request.
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::InvalidScore { .. } => ErrorKind::InvalidInput,
            Self::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
