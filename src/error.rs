//! Crate-wide error kinds.
//!
//! Every fallible operation in the core surfaces one of these kinds to its
//! caller. Internal plumbing (storage, codecs) is free to use
//! `anyhow::Result` and collapse into `CoreError::Internal` at the
//! subsystem boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("write target is authoritative: {0}")]
    Authoritative(String),

    #[error("max size reached: {0}")]
    MaxSizeReached(String),

    #[error("max num score reached: {0}")]
    MaxNumScoreReached(String),

    #[error("write outside active session duration: {0}")]
    OutsideDuration(String),

    #[error("join required: {0}")]
    JoinRequired(String),

    #[error("invalid operator: {0}")]
    InvalidOperator(String),

    #[error("invalid channel id: {0}")]
    ChannelIdInvalid(String),

    #[error("channel group not found: {0}")]
    ChannelGroupNotFound(String),

    #[error("runtime function raised an exception: {message}")]
    RuntimeFunctionException { message: String, status: Option<i32> },

    #[error("runtime function not found: {0}")]
    RuntimeFunctionNotFound(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// A coarse status code, the way a host would report to a remote caller.
    /// Kept internal to the core (spec explicitly excludes the HTTP/gRPC
    /// boundary) but still useful for logging and for the Extension
    /// Runtime's `RuntimeFunctionException` status field.
    pub fn status_code(&self) -> i32 {
        match self {
            CoreError::BadInput(_) => 3,
            CoreError::NotFound(_) => 5,
            CoreError::Unauthenticated(_) => 16,
            CoreError::PermissionDenied(_) => 7,
            CoreError::InvalidCursor(_) => 3,
            CoreError::Authoritative(_) => 7,
            CoreError::MaxSizeReached(_) => 8,
            CoreError::MaxNumScoreReached(_) => 8,
            CoreError::OutsideDuration(_) => 9,
            CoreError::JoinRequired(_) => 9,
            CoreError::InvalidOperator(_) => 3,
            CoreError::ChannelIdInvalid(_) => 3,
            CoreError::ChannelGroupNotFound(_) => 5,
            CoreError::RuntimeFunctionException { status, .. } => status.unwrap_or(13),
            CoreError::RuntimeFunctionNotFound(_) => 5,
            CoreError::Internal(_) => 13,
        }
    }
}
