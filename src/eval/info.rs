//! The immutable record of one evaluation run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use crate::database::DatabaseItem;
use crate::process::ExitInfo;
use crate::server::protocol::{Diagnostic, ResultLocation};

/// Why an execution did not produce results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunFailure {
    /// A live server reported an evaluation failure (including a
    /// server-side timeout).
    Evaluation(String),
    /// The server process died mid-run. Distinct from a failure a live
    /// server reports.
    ServerDied(Option<ExitInfo>),
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evaluation(message) => write!(f, "{message}"),
            Self::ServerDied(Some(exit)) => write!(f, "query server died ({exit})"),
            Self::ServerDied(None) => write!(f, "query server died"),
        }
    }
}

/// Terminal state of one run. Every call site handles every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EvaluationOutcome {
    /// Evaluation completed; results are at the given location.
    Succeeded { results: ResultLocation },
    /// The query did not compile. This is the query's result, not a system
    /// failure.
    CompileFailed { diagnostics: Vec<Diagnostic> },
    /// Execution started but did not produce results.
    RuntimeFailed { failure: RunFailure },
    /// The user cancelled and the server confirmed it stopped.
    Cancelled,
}

impl EvaluationOutcome {
    /// Short human-readable label for logs and the CLI.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::CompileFailed { .. } => "compile failed",
            Self::RuntimeFailed { .. } => "runtime failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable record of one completed, failed, or cancelled run.
///
/// Held by history and display collaborators by shared reference until
/// evicted; never mutated after finalization.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationInfo {
    /// Display name of the query.
    pub query_name: String,
    /// Path of the query file, when the run came from one.
    pub query_path: Option<PathBuf>,
    /// Whether this was a quick evaluation of a selected fragment.
    pub quick_eval: bool,
    /// Snapshot of the target database taken when the run started.
    pub database: DatabaseItem,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub outcome: EvaluationOutcome,
    /// Server log output for this run, when the server produced one.
    pub log: Option<PathBuf>,
}

/// A run that has started but not yet reached a terminal state.
///
/// Finalization consumes the pending record, so each run is finalized exactly
/// once and the resulting [`EvaluationInfo`] can never change again.
pub struct PendingEvaluation {
    query_name: String,
    query_path: Option<PathBuf>,
    quick_eval: bool,
    database: DatabaseItem,
    started_at: SystemTime,
}

impl PendingEvaluation {
    pub fn begin(
        query_name: impl Into<String>,
        query_path: Option<PathBuf>,
        quick_eval: bool,
        database: DatabaseItem,
    ) -> Self {
        Self {
            query_name: query_name.into(),
            query_path,
            quick_eval,
            database,
            started_at: SystemTime::now(),
        }
    }

    /// The database snapshot this run operates on.
    pub fn database(&self) -> &DatabaseItem {
        &self.database
    }

    /// Record a mid-run change the server made to the snapshot (an upgrade).
    pub fn set_database(&mut self, database: DatabaseItem) {
        self.database = database;
    }

    pub fn finish(self, outcome: EvaluationOutcome, log: Option<PathBuf>) -> Arc<EvaluationInfo> {
        Arc::new(EvaluationInfo {
            query_name: self.query_name,
            query_path: self.query_path,
            quick_eval: self.quick_eval,
            database: self.database,
            started_at: self.started_at,
            finished_at: SystemTime::now(),
            outcome,
            log,
        })
    }
}
