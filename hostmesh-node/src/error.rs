//! Transport and adapter errors.

use hostmesh_core::{PresenceError, TextFrameError};

/// Failure of the underlying medium or stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediumError {
    /// The operation did not complete in time; worth retrying.
    #[error("transport timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("not connected")]
    NotConnected,
    /// The medium refused this one message (bad channel name, too large). The connection
    /// itself is fine.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl MediumError {
    /// Transient errors are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, MediumError::Timeout)
    }

    /// Fatal errors mean the connection is gone and stop the adapter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MediumError::Disconnected(_) | MediumError::NotConnected)
    }

    pub(crate) fn from_io(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MediumError::Timeout,
            _ => MediumError::Disconnected(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter is not started")]
    NotStarted,
    #[error("adapter is already started")]
    AlreadyStarted,
    #[error("no streams attached")]
    StreamsMissing,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error(transparent)]
    Medium(#[from] MediumError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Frame(#[from] TextFrameError),
}
