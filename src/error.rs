//! Error types for the tether client.
//!
//! Nothing here is fatal to the embedding application: every failure maps to
//! "try again on a later tick" at the client layer. The variants exist so
//! tests and integrators can tell the failure classes apart.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect, redirect or HTTP status failure on either connection.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request body encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Session provider has no usable identity yet.
    #[error("session not ready")]
    AuthNotReady,

    #[error("channel index {index} out of range (capacity {capacity})")]
    ChannelRange { index: usize, capacity: usize },

    #[error("value exceeds {max} bytes")]
    ValueTooLong { max: usize },

    /// Invalid job definition, rejected at install time.
    #[error("schedule rejected: {0}")]
    ScheduleRejected(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
