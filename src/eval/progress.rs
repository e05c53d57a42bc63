//! Progress bridge between the RPC layer and per-operation surfaces.
//!
//! The server streams `progress.update` notifications keyed by an opaque
//! token; the bridge forwards each update to the stream registered for that
//! token. Every concurrent operation gets an independent stream, so progress
//! (like cancellation) targets exactly one operation and never a sibling.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::rpc::protocol::ProgressParams;

/// One progress update for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Completion percentage, 0-100.
    pub percentage: u32,
    /// Human-readable step description.
    pub message: String,
}

/// Sending half of an operation's progress surface.
pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Token -> surface routing table.
#[derive(Default)]
pub struct ProgressRegistry {
    streams: std::sync::Mutex<HashMap<u64, ProgressSender>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route updates for `token` to `sink` until unregistered.
    pub fn register(&self, token: u64, sink: ProgressSender) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(token, sink);
        }
    }

    /// Stop routing for `token`. The token is dead once its operation has
    /// resolved; late updates for it are dropped.
    pub fn unregister(&self, token: u64) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&token);
        }
    }

    /// Notification handler entry point for `progress.update`.
    pub fn dispatch(&self, params: Value) {
        let update: ProgressParams = match serde_json::from_value(params) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed progress notification");
                return;
            }
        };

        let Ok(streams) = self.streams.lock() else {
            return;
        };
        match streams.get(&update.token) {
            Some(sink) => {
                let _ = sink.send(ProgressUpdate {
                    percentage: update.percentage,
                    message: update.message,
                });
            }
            None => tracing::debug!(token = update.token, "progress for unknown token"),
        }
    }
}
