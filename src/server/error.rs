//! Client-level error types.

use thiserror::Error;

use crate::process::{ExitInfo, ProcessError};
use crate::rpc::RpcError;

/// Result type for query server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during a query server operation.
///
/// Compile diagnostics and evaluation failures are NOT errors at this level:
/// a live server reporting them is the operation working as intended, and
/// they travel in the operation's outcome type instead.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The server process could not be started.
    #[error(transparent)]
    Spawn(#[from] ProcessError),

    /// No server executable is configured or discoverable.
    #[error("no query server executable configured or discoverable")]
    NoExecutable,

    /// Operation attempted on a dead or never-started connection. Recoverable
    /// by an explicit restart.
    #[error("connection to query server is closed; restart the server")]
    ConnectionClosed,

    /// The server process exited mid-operation. The connection is torn down
    /// and is not restarted automatically.
    #[error("query server process crashed")]
    WorkerCrashed {
        /// Exit status, when the supervisor observed it.
        exit: Option<ExitInfo>,
    },

    /// The operation was cancelled. A normal outcome, not a failure.
    #[error("operation was cancelled")]
    Cancelled,

    /// Request parameters could not be encoded.
    #[error("failed to encode request parameters: {0}")]
    Encode(#[source] serde_json::Error),

    /// Malformed or unexpected traffic from the server.
    #[error("query server protocol error: {0}")]
    Protocol(String),

    /// The server reported an operation-level error.
    #[error("query server error: {message} (code {code})")]
    Remote {
        /// Numeric error code from the server.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
}

impl From<RpcError> for ServerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::ConnectionClosed => Self::ConnectionClosed,
            RpcError::WorkerCrashed => Self::WorkerCrashed { exit: None },
            RpcError::Cancelled => Self::Cancelled,
            RpcError::Remote { code, message } => Self::Remote { code, message },
            RpcError::Serialize(e) => Self::Encode(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
