//! Domain operations over a scripted connection.

#[path = "../rpc/stub.rs"]
mod stub;

use std::sync::Arc;

use quarry::database::DatabaseItem;
use quarry::server::protocol::{methods, ClearCacheParams, ClearCacheResult, DatabaseParams};
use serde_json::json;

#[tokio::test]
async fn test_clear_cache_is_idempotent() {
    let (conn, mut server) = stub::connect();
    let conn = Arc::new(conn);

    let database = DatabaseItem::new("/data/app.qdb");
    let params = serde_json::to_value(ClearCacheParams {
        database: DatabaseParams::from(&database),
    })
    .unwrap();

    // Issue the operation twice in sequence; the server acknowledges both
    // the same way, with no error on the repeat.
    let mut acks = Vec::new();
    for _ in 0..2 {
        let pending = tokio::spawn({
            let conn = conn.clone();
            let params = params.clone();
            async move { conn.send(methods::CLEAR_CACHE, params).await }
        });

        let request = server.read_message().await;
        assert_eq!(request["method"], methods::CLEAR_CACHE);
        assert_eq!(request["params"]["database"], "/data/app.qdb");
        let id = request["id"].as_u64().unwrap();
        server.respond_ok(id, json!({ "message": "cache cleared" })).await;

        let value = pending.await.unwrap().unwrap();
        let ack: ClearCacheResult = serde_json::from_value(value).unwrap();
        acks.push(ack);
    }

    assert_eq!(acks[0], acks[1]);
    assert_eq!(acks[0].message.as_deref(), Some("cache cleared"));
}

#[tokio::test]
async fn test_request_ids_are_monotonic_and_never_reused() {
    let (conn, mut server) = stub::connect();
    let conn = Arc::new(conn);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(methods::RESOLVE_UPGRADES, json!({ "database": "/d" })).await }
        });
        let request = server.read_message().await;
        let id = request["id"].as_u64().unwrap();
        server.respond_ok(id, json!({ "status": "current" })).await;
        pending.await.unwrap().unwrap();
        seen.push(id);
    }

    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "ids must grow: {seen:?}");
}
