//! The per-run evaluation state machine.
//!
//! Each run moves `Idle -> Resolving -> Compiling -> Executing` and ends in
//! exactly one terminal outcome: succeeded, compile failed, runtime failed,
//! or cancelled. Cancellation is cooperative from any state -- the server is
//! asked to stop and the run finalizes only once the server's terminal
//! response arrives. A server crash mid-run is a runtime failure with a
//! distinguishable "server died" cause, never confused with an evaluation
//! error a live server reports.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::display::ResultDisplay;
use super::history::EvaluationHistory;
use super::info::{EvaluationInfo, EvaluationOutcome, PendingEvaluation, RunFailure};
use super::progress::ProgressSender;
use crate::database::{DatabaseManager, UpgradeStatus};
use crate::server::protocol::{CompileOutcome, Fragment, ResourceLimits, RunOutcome};
use crate::server::{QueryServer, ServerError, ServerEvent};

/// Non-terminal states of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Resolving,
    Compiling,
    Executing,
}

/// Failures that abort a run before it produces an evaluation record.
///
/// Terminal outcomes (compile errors, evaluation failures, cancellation, a
/// mid-run crash) are not errors here -- they finalize into an
/// [`EvaluationInfo`] instead.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// No active database; the server is never contacted.
    #[error("no database selected")]
    NoDatabaseSelected,

    /// System-level failure reaching the server (spawn failure, dead
    /// connection, protocol error). Reported once, never retried silently.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// One request to evaluate a query.
#[derive(Debug, Clone)]
pub struct QueryRunRequest {
    /// Display name for the run.
    pub name: String,
    /// Path of the query file, when the run came from one.
    pub path: Option<PathBuf>,
    /// Full query source text.
    pub source: String,
    /// When present, quick-evaluate only this fragment.
    pub fragment: Option<Fragment>,
    /// Per-run progress surface.
    pub progress: Option<ProgressSender>,
}

impl QueryRunRequest {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            source: source.into(),
            fragment: None,
            progress: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Quick evaluation: compile only the selected fragment as an ad-hoc
    /// query against the same database.
    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragment = Some(fragment);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Sequences query evaluation runs against the active database.
pub struct Evaluator {
    server: Arc<dyn QueryServer>,
    databases: Arc<dyn DatabaseManager>,
    history: Arc<EvaluationHistory>,
    display: Arc<dyn ResultDisplay>,
    limits: ResourceLimits,
    events: Option<broadcast::Sender<ServerEvent>>,
}

impl Evaluator {
    pub fn new(
        server: Arc<dyn QueryServer>,
        databases: Arc<dyn DatabaseManager>,
        history: Arc<EvaluationHistory>,
        display: Arc<dyn ResultDisplay>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            server,
            databases,
            history,
            display,
            limits,
            events: None,
        }
    }

    /// Emit `EvaluationFinished` on the given lifecycle channel.
    pub fn with_events(mut self, events: broadcast::Sender<ServerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one query to a terminal outcome.
    ///
    /// Returns the finalized record, already appended to history and handed
    /// to the display collaborator. Fails fast with `NoDatabaseSelected`
    /// before contacting the server when nothing is selected.
    pub async fn run_query(
        &self,
        request: QueryRunRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<EvaluationInfo>, EvalError> {
        // Resolving: snapshot the selection. The snapshot never changes
        // mid-run, even if the user switches databases.
        let database = self
            .databases
            .active_database()
            .ok_or(EvalError::NoDatabaseSelected)?;

        let mut pending = PendingEvaluation::begin(
            request.name.clone(),
            request.path.clone(),
            request.fragment.is_some(),
            database,
        );

        let (outcome, log) = self.drive(&request, &mut pending, cancel).await?;
        let info = pending.finish(outcome, log);

        self.history.record(info.clone());
        self.display.display(&info);
        if let Some(events) = &self.events {
            let _ = events.send(ServerEvent::EvaluationFinished(info.clone()));
        }
        tracing::info!(query = %info.query_name, outcome = info.outcome.label(), "run finished");
        Ok(info)
    }

    async fn drive(
        &self,
        request: &QueryRunRequest,
        pending: &mut PendingEvaluation,
        cancel: &CancellationToken,
    ) -> Result<(EvaluationOutcome, Option<PathBuf>), EvalError> {
        // Resolving: settle the snapshot's upgrade status, upgrading first
        // when the database needs it.
        let mut state = RunState::Resolving;
        tracing::debug!(query = %request.name, ?state, "resolving database");
        let mut database = pending.database().clone();
        match self.server.resolve_upgrades(&database, cancel).await {
            Ok(status) => database.upgrade_status = status,
            Err(ServerError::Cancelled) => return Ok((EvaluationOutcome::Cancelled, None)),
            Err(e) => return Err(e.into()),
        }
        if database.upgrade_status == UpgradeStatus::NeedsUpgrade {
            tracing::info!(database = %database.path.display(), "upgrading database before run");
            match self
                .server
                .run_upgrade(&database, request.progress.clone(), cancel)
                .await
            {
                Ok(()) => database.upgrade_status = UpgradeStatus::Current,
                Err(ServerError::Cancelled) => return Ok((EvaluationOutcome::Cancelled, None)),
                Err(e) => return Err(e.into()),
            }
        }
        pending.set_database(database.clone());

        // Compiling: diagnostics stop the run; a partially-compiled plan is
        // never executed.
        state = RunState::Compiling;
        tracing::debug!(query = %request.name, ?state, quick_eval = request.fragment.is_some(), "compiling");
        let handle = match self
            .server
            .compile_query(
                &database,
                &request.source,
                request.fragment.clone(),
                request.progress.clone(),
                cancel,
            )
            .await
        {
            Ok(CompileOutcome::Compiled(handle)) => handle,
            Ok(CompileOutcome::Failed(diagnostics)) => {
                return Ok((EvaluationOutcome::CompileFailed { diagnostics }, None));
            }
            Err(ServerError::Cancelled) => return Ok((EvaluationOutcome::Cancelled, None)),
            Err(ServerError::WorkerCrashed { exit }) => {
                return Ok((
                    EvaluationOutcome::RuntimeFailed {
                        failure: RunFailure::ServerDied(exit),
                    },
                    None,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        // Executing: progress notifications feed the surface but never alter
        // the state machine.
        state = RunState::Executing;
        tracing::debug!(query = %request.name, ?state, "executing compiled plan");
        match self
            .server
            .run_compiled_query(
                &handle,
                &database,
                self.limits,
                request.progress.clone(),
                cancel,
            )
            .await
        {
            Ok(RunOutcome::Completed { results, log }) => {
                Ok((EvaluationOutcome::Succeeded { results }, log))
            }
            Ok(RunOutcome::Failed { message }) => Ok((
                EvaluationOutcome::RuntimeFailed {
                    failure: RunFailure::Evaluation(message),
                },
                None,
            )),
            Err(ServerError::Cancelled) => Ok((EvaluationOutcome::Cancelled, None)),
            Err(ServerError::WorkerCrashed { exit }) => Ok((
                EvaluationOutcome::RuntimeFailed {
                    failure: RunFailure::ServerDied(exit),
                },
                None,
            )),
            Err(e) => Err(e.into()),
        }
    }
}
