//! Wire envelopes for the query server protocol.
//!
//! Three message shapes travel over the transport: requests (`id`, `method`,
//! `params`), responses (`id`, then `result` or `error`), and notifications
//! (`method`, `params`, no `id`). The client only ever receives responses and
//! notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Envelopes
// ============================================================================

/// Request envelope sent to the server.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation. Monotonically assigned per
    /// connection, never reused.
    pub id: u64,
    /// Method name (e.g., "query.compile").
    pub method: String,
    /// Method-specific parameters.
    pub params: Value,
}

/// Response envelope received from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub id: u64,
    /// Result payload (present on success).
    #[serde(default)]
    pub result: Option<Value>,
    /// Error information (present on failure).
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Notification envelope, in either direction. Fire-and-forget: no ID, no
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Method name (e.g., "progress.update").
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    pub params: Value,
}

/// Error information in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Numeric error code. See [`codes`].
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

/// An incoming message: a response to a pending request, or an unsolicited
/// notification. Distinguished by the presence of an `id` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(ResponseEnvelope),
    Notification(NotificationEnvelope),
}

// ============================================================================
// Notification Parameters
// ============================================================================

/// Parameters of a `progress.update` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    /// Token correlating this update to one in-flight request.
    pub token: u64,
    /// Completion percentage, 0-100.
    pub percentage: u32,
    /// Human-readable step description.
    #[serde(default)]
    pub message: String,
}

/// Parameters of a `log.line` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogParams {
    pub line: String,
}

/// Parameters of a `request.cancel` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    /// ID of the request to cancel.
    pub id: u64,
}

// ============================================================================
// Method and Code Constants
// ============================================================================

/// Core protocol method names.
pub mod methods {
    /// Server-to-client progress stream, keyed by progress token.
    pub const PROGRESS: &str = "progress.update";
    /// Server-to-client evaluator log line.
    pub const LOG: &str = "log.line";
    /// Client-to-server best-effort cancellation, keyed by request id.
    pub const CANCEL: &str = "request.cancel";
}

/// Well-known response error codes.
pub mod codes {
    /// The request was cancelled before completion. Not an alarming outcome.
    pub const CANCELLED: i64 = -32800;
}
