//! # Quarry
//!
//! A client and evaluation pipeline for a long-lived, out-of-process query
//! server that compiles and evaluates declarative analysis queries against a
//! selected database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │             Caller (CLI command, editor host)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [eval]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Evaluator (per-run state machine + history)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [server]
//! ┌─────────────────────────────────────────────────────────┐
//! │     QueryServerClient (typed operations, lifecycle)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [rpc]
//! ┌─────────────────────────────────────────────────────────┐
//! │   RpcConnection (id correlation, notification dispatch)  │
//! │   over Content-Length framed JSON on child stdio         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [process]
//! ┌─────────────────────────────────────────────────────────┐
//! │      Query server (long-running child process)           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands flow down; results, progress and log notifications flow back up.
//! The process supervisor sits below the RPC layer and is consulted whenever
//! the channel is unusable.

pub mod config;
pub mod database;
pub mod dist;
pub mod eval;
pub mod process;
pub mod rpc;
pub mod server;
pub mod session;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{QueryServerConfig, Settings};
    pub use crate::database::{DatabaseItem, DatabaseManager, DatabaseRegistry, UpgradeStatus};
    pub use crate::eval::{
        EvaluationHistory, EvaluationInfo, EvaluationOutcome, Evaluator, QueryRunRequest,
        ResultDisplay, RunFailure,
    };
    pub use crate::server::{QueryServer, QueryServerClient, ServerError, ServerEvent};
    pub use crate::session::{ExtensionSession, SessionState};
}
