//! End-to-end progress flow: server notification -> registry -> surface.

#[path = "../rpc/stub.rs"]
mod stub;

use std::sync::Arc;

use quarry::eval::ProgressRegistry;
use quarry::rpc::protocol::methods;
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_progress_notifications_reach_the_registered_surface_in_order() {
    let (conn, mut server) = stub::connect();
    let conn = Arc::new(conn);

    let registry = Arc::new(ProgressRegistry::new());
    conn.on_notification(methods::PROGRESS, {
        let registry = registry.clone();
        move |params| registry.dispatch(params)
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register(1, tx);

    // A request is in flight; the server streams progress for its token and
    // then answers.
    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send("query.run", json!({ "progress_token": 1 })).await }
    });
    let request = server.read_message().await;
    let id = request["id"].as_u64().unwrap();

    server
        .notify(methods::PROGRESS, json!({ "token": 1, "percentage": 10, "message": "compiling" }))
        .await;
    server
        .notify(methods::PROGRESS, json!({ "token": 1, "percentage": 100, "message": "done" }))
        .await;
    // Progress for a token nobody registered is dropped quietly.
    server
        .notify(methods::PROGRESS, json!({ "token": 42, "percentage": 50, "message": "" }))
        .await;
    server.respond_ok(id, json!({ "result_location": "/tmp/r" })).await;

    pending.await.unwrap().unwrap();
    registry.unregister(1);

    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!(first.percentage, 10);
    assert_eq!(first.message, "compiling");
    assert_eq!(second.percentage, 100);
    assert!(rx.try_recv().is_err(), "no updates beyond the token's own");
}

#[tokio::test]
async fn test_concurrent_operations_have_independent_surfaces() {
    let (conn, mut server) = stub::connect();
    let conn = Arc::new(conn);

    let registry = Arc::new(ProgressRegistry::new());
    conn.on_notification(methods::PROGRESS, {
        let registry = registry.clone();
        move |params| registry.dispatch(params)
    })
    .await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    registry.register(1, tx_a);
    registry.register(2, tx_b);

    let ping = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send("query.run", json!({})).await }
    });
    let request = server.read_message().await;
    let id = request["id"].as_u64().unwrap();

    server
        .notify(methods::PROGRESS, json!({ "token": 2, "percentage": 30, "message": "b" }))
        .await;
    server
        .notify(methods::PROGRESS, json!({ "token": 1, "percentage": 70, "message": "a" }))
        .await;
    server.respond_ok(id, json!({})).await;
    ping.await.unwrap().unwrap();

    assert_eq!(rx_a.try_recv().unwrap().percentage, 70);
    assert_eq!(rx_b.try_recv().unwrap().percentage, 30);
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}
