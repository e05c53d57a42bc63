//! Connection behavior when the server process goes away.

mod stub;

use std::sync::Arc;

use quarry::rpc::RpcError;
use serde_json::json;

#[tokio::test]
async fn test_server_exit_fails_every_pending_request_once() {
    let (conn, mut server) = stub::connect();
    let conn = Arc::new(conn);

    // A compile and a run request, both pending.
    let compile = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send("query.compile", json!({ "op": 1 })).await }
    });
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send("query.run", json!({ "op": 2 })).await }
    });

    // Make sure both are on the wire before the "crash".
    server.read_message().await;
    server.read_message().await;
    drop(server);

    let (compile_result, run_result) = futures::future::join(compile, run).await;
    assert!(matches!(compile_result.unwrap(), Err(RpcError::WorkerCrashed)));
    assert!(matches!(run_result.unwrap(), Err(RpcError::WorkerCrashed)));

    // The connection reports dead, and a send without a restart fails
    // immediately instead of hanging.
    assert!(!conn.is_open());
    let after = conn.send("query.compile", json!({})).await;
    assert!(matches!(after, Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn test_clean_eof_with_nothing_pending_just_closes() {
    let (conn, server) = stub::connect();
    drop(server);

    // Give the dispatch task a chance to observe the EOF.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (conn, _server) = stub::connect();
    conn.close().await;
    conn.close().await;
    assert!(!conn.is_open());
}
