//! RPC-level error types.

use std::io;
use thiserror::Error;

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur on one connection to the query server.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Failed to serialize a request to JSON.
    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Failed to deserialize a response payload.
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// Failed to write to the server's stdin.
    #[error("failed to write to query server: {0}")]
    Write(#[source] io::Error),

    /// Operation attempted on a dead or never-started connection.
    #[error("connection to query server is closed")]
    ConnectionClosed,

    /// The server process exited while the request was pending.
    #[error("query server process crashed")]
    WorkerCrashed,

    /// The request was cancelled. A normal outcome, not a failure.
    #[error("request was cancelled")]
    Cancelled,

    /// The server returned an error response.
    #[error("query server error: {message} (code {code})")]
    Remote {
        /// Numeric error code from the server.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
}

impl RpcError {
    /// Check whether this error means the connection is unusable and must be
    /// restarted before retrying.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::WorkerCrashed)
    }
}
