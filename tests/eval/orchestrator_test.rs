//! Evaluation state machine, driven against a scripted query server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use quarry::database::{DatabaseItem, DatabaseRegistry, UpgradeStatus};
use quarry::eval::{
    EvalError, EvaluationHistory, EvaluationOutcome, Evaluator, LoggingDisplay, ProgressSender,
    QueryRunRequest, RunFailure,
};
use quarry::process::ExitInfo;
use quarry::server::protocol::{
    ClearCacheResult, CompileOutcome, CompiledQueryHandle, Diagnostic, Fragment, QueryMetadata,
    ResourceLimits, ResultLocation, RunOutcome, Severity,
};
use quarry::server::{QueryServer, ServerError, ServerResult};

/// Scripted stand-in for the query server client. Counts calls and yields
/// pre-seeded outcomes.
struct MockServer {
    compile_calls: AtomicUsize,
    run_calls: AtomicUsize,
    upgrade_calls: AtomicUsize,
    upgrade_status: Mutex<UpgradeStatus>,
    compile_outcome: Mutex<Option<ServerResult<CompileOutcome>>>,
    run_outcome: Mutex<Option<ServerResult<RunOutcome>>>,
    /// Progress updates emitted while "executing".
    run_progress: Mutex<Vec<(u32, &'static str)>>,
}

impl MockServer {
    fn new() -> Self {
        Self {
            compile_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            upgrade_calls: AtomicUsize::new(0),
            upgrade_status: Mutex::new(UpgradeStatus::Current),
            compile_outcome: Mutex::new(None),
            run_outcome: Mutex::new(None),
            run_progress: Mutex::new(Vec::new()),
        }
    }

    fn script_compile(&self, outcome: ServerResult<CompileOutcome>) {
        *self.compile_outcome.lock().unwrap() = Some(outcome);
    }

    fn script_run(&self, outcome: ServerResult<RunOutcome>) {
        *self.run_outcome.lock().unwrap() = Some(outcome);
    }

    fn compiled() -> ServerResult<CompileOutcome> {
        Ok(CompileOutcome::Compiled(CompiledQueryHandle(
            "plan-1".to_string(),
        )))
    }

    fn completed() -> ServerResult<RunOutcome> {
        Ok(RunOutcome::Completed {
            results: ResultLocation(PathBuf::from("/tmp/run-1/results.bin")),
            log: Some(PathBuf::from("/tmp/run-1/evaluator.log")),
        })
    }
}

#[async_trait]
impl QueryServer for MockServer {
    async fn compile_query(
        &self,
        _database: &DatabaseItem,
        _source: &str,
        _fragment: Option<Fragment>,
        _progress: Option<ProgressSender>,
        _cancel: &CancellationToken,
    ) -> ServerResult<CompileOutcome> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        self.compile_outcome
            .lock()
            .unwrap()
            .take()
            .expect("compile was not scripted")
    }

    async fn run_compiled_query(
        &self,
        _handle: &CompiledQueryHandle,
        _database: &DatabaseItem,
        _limits: ResourceLimits,
        progress: Option<ProgressSender>,
        _cancel: &CancellationToken,
    ) -> ServerResult<RunOutcome> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = progress {
            for (percentage, message) in self.run_progress.lock().unwrap().iter() {
                let _ = sink.send(quarry::eval::ProgressUpdate {
                    percentage: *percentage,
                    message: message.to_string(),
                });
            }
        }
        self.run_outcome
            .lock()
            .unwrap()
            .take()
            .expect("run was not scripted")
    }

    async fn resolve_upgrades(
        &self,
        _database: &DatabaseItem,
        _cancel: &CancellationToken,
    ) -> ServerResult<UpgradeStatus> {
        Ok(*self.upgrade_status.lock().unwrap())
    }

    async fn run_upgrade(
        &self,
        _database: &DatabaseItem,
        _progress: Option<ProgressSender>,
        _cancel: &CancellationToken,
    ) -> ServerResult<()> {
        self.upgrade_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_cache(
        &self,
        _database: &DatabaseItem,
        _cancel: &CancellationToken,
    ) -> ServerResult<ClearCacheResult> {
        Ok(ClearCacheResult::default())
    }

    async fn resolve_metadata(
        &self,
        _query_path: &Path,
        _cancel: &CancellationToken,
    ) -> ServerResult<QueryMetadata> {
        Ok(QueryMetadata::default())
    }
}

struct Harness {
    server: Arc<MockServer>,
    databases: Arc<DatabaseRegistry>,
    history: Arc<EvaluationHistory>,
    evaluator: Evaluator,
}

fn harness() -> Harness {
    let server = Arc::new(MockServer::new());
    let databases = Arc::new(DatabaseRegistry::new());
    let history = Arc::new(EvaluationHistory::new(16));
    let evaluator = Evaluator::new(
        server.clone(),
        databases.clone(),
        history.clone(),
        Arc::new(LoggingDisplay),
        ResourceLimits {
            threads: 2,
            memory_mb: 1024,
            timeout_secs: 60,
        },
    );
    Harness {
        server,
        databases,
        history,
        evaluator,
    }
}

fn request(name: &str) -> QueryRunRequest {
    QueryRunRequest::new(name, "from thing select thing")
}

#[tokio::test]
async fn test_no_database_fails_fast_without_contacting_server() {
    let h = harness();

    let result = h
        .evaluator
        .run_query(request("q"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(EvalError::NoDatabaseSelected)));
    assert_eq!(h.server.compile_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.server.run_calls.load(Ordering::SeqCst), 0);
    assert!(h.history.is_empty());
}

#[tokio::test]
async fn test_compile_diagnostics_stop_the_run() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));
    h.server.script_compile(Ok(CompileOutcome::Failed(vec![Diagnostic {
        severity: Severity::Error,
        message: "unresolved predicate `thing`".to_string(),
        line: Some(3),
        column: Some(8),
    }])));

    let info = h
        .evaluator
        .run_query(request("broken"), &CancellationToken::new())
        .await
        .unwrap();

    let EvaluationOutcome::CompileFailed { diagnostics } = &info.outcome else {
        panic!("expected CompileFailed, got {:?}", info.outcome);
    };
    assert_eq!(diagnostics.len(), 1);
    // A partially-compiled plan is never executed.
    assert_eq!(h.server.run_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.history.len(), 1);
}

#[tokio::test]
async fn test_successful_run_with_ordered_progress() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(MockServer::completed());
    *h.server.run_progress.lock().unwrap() = vec![(10, "evaluating"), (100, "done")];

    let (tx, mut rx) = mpsc::unbounded_channel();
    let info = h
        .evaluator
        .run_query(request("works").with_progress(tx), &CancellationToken::new())
        .await
        .unwrap();

    let EvaluationOutcome::Succeeded { results } = &info.outcome else {
        panic!("expected Succeeded, got {:?}", info.outcome);
    };
    assert!(!results.is_empty());
    assert_eq!(info.log, Some(PathBuf::from("/tmp/run-1/evaluator.log")));

    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!((first.percentage, second.percentage), (10, 100));

    assert_eq!(h.history.len(), 1);
    assert_eq!(h.server.compile_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.server.run_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_needs_upgrade_runs_upgrade_first() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/old.qdb")));
    *h.server.upgrade_status.lock().unwrap() = UpgradeStatus::NeedsUpgrade;
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(MockServer::completed());

    let info = h
        .evaluator
        .run_query(request("q"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.server.upgrade_calls.load(Ordering::SeqCst), 1);
    // The record carries the post-upgrade snapshot.
    assert_eq!(info.database.upgrade_status, UpgradeStatus::Current);
}

#[tokio::test]
async fn test_server_crash_is_distinct_from_evaluation_failure() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));

    // Crash mid-execution.
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(Err(ServerError::WorkerCrashed {
        exit: Some(ExitInfo {
            code: Some(1),
            signal: None,
        }),
    }));
    let crashed = h
        .evaluator
        .run_query(request("q1"), &CancellationToken::new())
        .await
        .unwrap();
    let EvaluationOutcome::RuntimeFailed {
        failure: RunFailure::ServerDied(exit),
    } = &crashed.outcome
    else {
        panic!("expected ServerDied, got {:?}", crashed.outcome);
    };
    assert_eq!(
        *exit,
        Some(ExitInfo {
            code: Some(1),
            signal: None
        })
    );

    // Failure reported by a live server.
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(Ok(RunOutcome::Failed {
        message: "tuple limit exceeded".to_string(),
    }));
    let failed = h
        .evaluator
        .run_query(request("q2"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        &failed.outcome,
        EvaluationOutcome::RuntimeFailed {
            failure: RunFailure::Evaluation(_)
        }
    ));

    assert_eq!(h.history.len(), 2);
}

#[tokio::test]
async fn test_cancellation_is_a_terminal_outcome_not_an_error() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));
    h.server.script_compile(Err(ServerError::Cancelled));

    let info = h
        .evaluator
        .run_query(request("q"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(info.outcome, EvaluationOutcome::Cancelled);
    assert_eq!(h.server.run_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.history.len(), 1);
}

#[tokio::test]
async fn test_terminal_runs_emit_evaluation_finished() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(MockServer::completed());

    let (events, mut observer) = tokio::sync::broadcast::channel(8);
    let evaluator = Evaluator::new(
        h.server.clone(),
        h.databases.clone(),
        h.history.clone(),
        Arc::new(LoggingDisplay),
        ResourceLimits {
            threads: 1,
            memory_mb: 512,
            timeout_secs: 30,
        },
    )
    .with_events(events);

    let info = evaluator
        .run_query(request("q"), &CancellationToken::new())
        .await
        .unwrap();

    let quarry::server::ServerEvent::EvaluationFinished(emitted) = observer.recv().await.unwrap()
    else {
        panic!("expected EvaluationFinished");
    };
    assert_eq!(emitted.query_name, info.query_name);
}

#[tokio::test]
async fn test_quick_eval_is_flagged_on_the_record() {
    let h = harness();
    h.databases.set_active(Some(DatabaseItem::new("/data/app.qdb")));
    h.server.script_compile(MockServer::compiled());
    h.server.script_run(MockServer::completed());

    let info = h
        .evaluator
        .run_query(
            request("snippet").with_fragment(Fragment {
                text: "thing.size()".to_string(),
                line: 12,
                column: 4,
            }),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(info.quick_eval);
    assert!(matches!(info.outcome, EvaluationOutcome::Succeeded { .. }));
}
