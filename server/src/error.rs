//! Error types for the server crate.

use shared::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors: startup, configuration and transport setup.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single message's handler. Captured at the dispatch boundary
/// and never propagated past that message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload did not decode; the sender is kicked for a protocol violation.
    #[error("malformed payload: {0}")]
    Malformed(#[from] ProtocolError),
    /// Message was well-formed but refers to state that does not allow it.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("connection {0} is not in the table")]
    UnknownConnection(u64),
    #[error("{0} is not permitted for this connection")]
    NotPermitted(&'static str),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }

    /// Protocol violations end the session of the offending connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, HandlerError::Malformed(_))
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A hook could not complete a lifecycle step.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(reason: impl Into<String>) -> Self {
        HookError(reason.into())
    }
}

/// The envelope pool has no free capacity.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("envelope pool exhausted ({outstanding} of {capacity} checked out)")]
pub struct PoolExhausted {
    pub outstanding: usize,
    pub capacity: usize,
}
