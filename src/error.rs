//! Error types for the session synchronizer.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur while synchronizing a quiz session.
///
/// Backend failures are reported by [`SessionStore`](crate::store::SessionStore)
/// implementations and handled inside the session loop; the
/// [`SessionClient`](crate::client::SessionClient) handle itself only fails with
/// [`SyncError::ClientShutDown`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Failed to deliver a partial write to the backend.
    #[error("store write error: {0}")]
    StoreWrite(String),

    /// Failed to receive a snapshot from the backend.
    #[error("store receive error: {0}")]
    StoreReceive(String),

    /// The store connection has already been closed.
    #[error("store connection closed")]
    StoreClosed,

    /// The backend reported an error.
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable error message from the backend.
        message: String,
        /// Structured error code, if provided by the backend.
        error_code: Option<ErrorCode>,
    },

    /// Failed to serialize or deserialize a document or gateway message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client handle was used after its session loop stopped.
    #[error("session client has shut down")]
    ClientShutDown,

    /// The audio output refused to start playback.
    #[error("playback error: {0}")]
    Playback(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for session synchronization.
pub type Result<T> = std::result::Result<T, SyncError>;
