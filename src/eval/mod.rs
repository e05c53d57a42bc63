//! Evaluation orchestration.
//!
//! Drives the steps of "run a query" -- resolve the active database, compile,
//! execute, collect the outcome -- as an explicit per-run state machine, and
//! keeps the immutable record of every finished run.

pub mod history;
pub mod info;
pub mod orchestrator;
pub mod progress;

mod display;

pub use display::{LoggingDisplay, ResultDisplay};
pub use history::EvaluationHistory;
pub use info::{EvaluationInfo, EvaluationOutcome, PendingEvaluation, RunFailure};
pub use orchestrator::{EvalError, Evaluator, QueryRunRequest, RunState};
pub use progress::{ProgressRegistry, ProgressSender, ProgressUpdate};
