//! Error taxonomy for the cancellation engine.
//!
//! Everything here is returned to the caller unchanged. Numeric faults inside
//! the filter are not errors: they are recovered in place and reported through
//! the `degraded` flag of a chunk result.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AncError>;

#[derive(Error, Debug)]
pub enum AncError {
    #[error("chunk of {len} samples exceeds the limit of {max}")]
    ChunkSize { len: usize, max: usize },

    #[error("chunk sample rate {actual}Hz does not match session rate {expected}Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("chunk sequence {got} is not after last accepted sequence {last}")]
    OutOfOrderChunk { last: u64, got: u64 },

    #[error("{field} cannot change on a live session")]
    ImmutableConfig { field: &'static str },

    #[error("session {id} already exists")]
    DuplicateSession { id: String },

    #[error("unknown session {id}")]
    UnknownSession { id: String },

    #[error("session {id} has ended")]
    SessionEnded { id: String },

    #[error("invalid session configuration: {details}")]
    InvalidConfig { details: String },

    #[error("engine configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AncError {
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    pub fn unknown_session(id: &str) -> Self {
        Self::UnknownSession { id: id.to_string() }
    }

    pub fn session_ended(id: &str) -> Self {
        Self::SessionEnded { id: id.to_string() }
    }

    /// True for errors caused by the request itself. These never mutate
    /// session state and must not be retried unchanged.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Io(_))
    }
}
