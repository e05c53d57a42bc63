//! Supervisor behavior against real child processes.
#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry::process::{self, ProcessError};

#[tokio::test]
async fn test_spawn_missing_executable_fails() {
    let result = process::spawn(
        Path::new("/nonexistent/quarry-server"),
        &[],
        &[],
        Box::new(|_| {}),
    );
    assert!(matches!(result, Err(ProcessError::Spawn(_))));
}

#[tokio::test]
async fn test_terminate_tree_kills_and_reports_exit() {
    let exited_by_signal = Arc::new(AtomicBool::new(false));
    let mut child = process::spawn(
        Path::new("/bin/cat"),
        &[],
        &[],
        Box::new({
            let exited_by_signal = exited_by_signal.clone();
            move |info| {
                exited_by_signal.store(info.signal == Some(9), Ordering::SeqCst);
            }
        }),
    )
    .unwrap();

    // Hold the stdio pair so cat does not exit on stdin EOF.
    let stdio = child.take_stdio();
    assert!(stdio.is_some());
    assert!(child.take_stdio().is_none(), "stdio is taken exactly once");
    assert!(child.is_alive());
    assert!(child.pid() > 0);

    child.terminate_tree();
    assert!(child.wait_exited(Duration::from_secs(5)).await);
    assert!(!child.is_alive());
    // The exit callback ran before the waiters woke, with the kill signal.
    assert!(exited_by_signal.load(Ordering::SeqCst));
    assert_eq!(child.exit_info().map(|info| info.signal), Some(Some(9)));

    // Terminating an already-dead process is a no-op, not an error.
    child.terminate_tree();
    drop(stdio);
}

#[tokio::test]
async fn test_clean_exit_reports_code() {
    let mut child = process::spawn(Path::new("/bin/cat"), &[], &[], Box::new(|_| {})).unwrap();

    // Closing stdin lets cat finish normally.
    let (stdin, stdout) = child.take_stdio().unwrap();
    drop(stdin);
    drop(stdout);

    assert!(child.wait_exited(Duration::from_secs(5)).await);
    assert_eq!(child.exit_info().map(|info| info.code), Some(Some(0)));
}
