//! Client lifecycle against a fake server process.
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;

use quarry::config::QueryServerConfig;
use quarry::database::DatabaseItem;
use quarry::dist::ConfiguredDistribution;
use quarry::server::{QueryServer, QueryServerClient, ServerError, ServerEvent};
use tokio_util::sync::CancellationToken;

/// A stand-in server binary: ignores its arguments and echoes frames back,
/// which the protocol layer reads as an empty-result response to every
/// request. Exits on stdin EOF like the real server.
fn fake_server(dir: &tempfile::TempDir) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-server");
    std::fs::write(&path, "#!/bin/sh\nexec cat\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config(server_path: PathBuf) -> QueryServerConfig {
    QueryServerConfig {
        server_path: Some(server_path),
        threads: 1,
        memory_mb: 256,
        timeout_secs: 10,
        debug: false,
    }
}

fn client(server_path: PathBuf) -> QueryServerClient {
    let dist = Arc::new(ConfiguredDistribution::new(None));
    QueryServerClient::new(config(server_path), dist)
}

#[tokio::test]
async fn test_start_and_graceful_stop_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(fake_server(&dir));
    let mut events = client.subscribe();

    assert!(!client.is_connected().await);
    client.start().await.unwrap();
    assert!(client.is_connected().await);
    assert!(matches!(events.recv().await.unwrap(), ServerEvent::ConnectionStarted));

    // Starting a started client changes nothing.
    client.start().await.unwrap();
    assert!(client.is_connected().await);

    client.stop().await.unwrap();
    assert!(!client.is_connected().await);

    // Stopping a stopped client is a no-op, not an error.
    client.stop().await.unwrap();

    // A requested stop is not a connection death.
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_operation_lazily_starts_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(fake_server(&dir));
    let database = DatabaseItem::new("/data/app.qdb");

    // No explicit start. The echoed upgrade request reads as an empty
    // success response, which is all run_upgrade needs.
    client
        .run_upgrade(&database, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(client.is_connected().await);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_surfaces_as_error() {
    let client = client(PathBuf::from("/nonexistent/quarry-server"));
    let result = client.start().await;
    assert!(matches!(result, Err(ServerError::Spawn(_))));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_missing_executable_without_config() {
    let dist = Arc::new(ConfiguredDistribution::new(None));
    let client = QueryServerClient::new(
        QueryServerConfig {
            server_path: None,
            threads: 1,
            memory_mb: 256,
            timeout_secs: 10,
            debug: false,
        },
        dist,
    );
    // Unless a quarry-server binary happens to be installed on this machine,
    // starting must fail cleanly rather than hang.
    match client.start().await {
        Ok(()) => client.stop().await.unwrap(),
        Err(ServerError::NoExecutable) | Err(ServerError::Spawn(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_restart_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(fake_server(&dir));

    client.start().await.unwrap();
    client.restart().await.unwrap();
    assert!(client.is_connected().await);
    client.stop().await.unwrap();
}
