//! Admin HTTP API tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use minishard::catalog::{ConfigServer, LocalDistLockManager};
use minishard::node::{create_router, NodeState};
use minishard::sharding::{ShardIdentity, ShardService, ShardingState};
use minishard::storage::Storage;
use minishard::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn router(initialized: bool) -> (Router, Arc<ShardService>) {
    let state = Arc::new(ShardingState::new());
    if initialized {
        state.set_initialized_for_test(ShardIdentity {
            shard_name: "shard0000".to_string(),
            cluster_id: Uuid::new_v4(),
            config_server: "local".to_string(),
        });
    }
    let config_server = Arc::new(ConfigServer::new());
    let service = Arc::new(
        ShardService::new(
            Config::default(),
            state,
            Arc::new(Storage::new()),
            config_server.clone(),
            Arc::new(LocalDistLockManager::new()),
            None,
        )
        .unwrap(),
    );
    let router = create_router(NodeState {
        service: service.clone(),
        config_server: Some(config_server),
    });
    (router, service)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn shard(router: &Router, ns: &str, split_points: Value) -> String {
    let (status, body) = send(
        router,
        "POST",
        &format!("/config/collections/{}/shard", ns),
        Some(json!({ "key_pattern": ["_id"], "split_points": split_points })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["epoch"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_status() {
    let (router, _) = router(true);
    let (status, body) = send(&router, "GET", "/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "initialized");
    assert_eq!(body["shard_name"], "shard0000");
    assert_eq!(body["pending_range_deletions"], 0);
}

#[tokio::test]
async fn test_uninitialized_node_rejects_sharded_commands() {
    let (router, _) = router(false);

    let (status, body) = send(&router, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "new");
    assert!(body["shard_name"].is_null());

    let (status, body) = send(&router, "GET", "/collections/foo.bar/metadata", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "ShardingStateNotInitialized");
}

#[tokio::test]
async fn test_shard_refresh_and_split() {
    let (router, _) = router(true);
    let epoch = shard(&router, "foo.bar", json!([{ "_id": 100 }])).await;

    let (status, body) = send(&router, "POST", "/collections/foo.bar/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["sharded"], true);
    assert_eq!(body["metadata"]["chunks"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.bar/split",
        Some(json!({
            "key_pattern": ["_id"],
            "min": { "_id": 100 },
            "max": { "_id": { "$maxKey": 1 } },
            "split_keys": [{ "_id": 200 }, { "_id": 300 }],
            "epoch": epoch,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["ok"], true);

    let (_, body) = send(&router, "GET", "/collections/foo.bar/metadata", None).await;
    let chunks = body["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[1]["min"], json!({ "_id": 100 }));
    assert_eq!(chunks[1]["max"], json!({ "_id": 200 }));
}

#[tokio::test]
async fn test_split_errors_map_to_codes() {
    let (router, _) = router(true);
    let epoch = shard(&router, "foo.bar", json!([])).await;

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.bar/split",
        Some(json!({
            "key_pattern": ["_id"],
            "min": { "_id": { "$minKey": 1 } },
            "max": { "_id": { "$maxKey": 1 } },
            "split_keys": [{ "_id": 5 }],
            "epoch": Uuid::new_v4(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "StaleEpoch");

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.bar/split",
        Some(json!({
            "key_pattern": ["_id"],
            "min": { "_id": { "$minKey": 1 } },
            "max": { "_id": { "$maxKey": 1 } },
            "split_keys": [{ "_id": 5 }],
            "epoch": epoch,
            "txn_number": 3,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "OperationNotSupportedInTransaction");
}

#[tokio::test]
async fn test_range_deletion_and_cleanup() {
    let (router, service) = router(true);

    for id in 0..5 {
        let (status, _) = send(
            &router,
            "POST",
            "/collections/foo.orphans/documents",
            Some(json!({ "_id": id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.orphans/range_deletions",
        Some(json!({ "key_pattern": ["_id"], "min": { "_id": 0 }, "max": { "_id": 3 } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["id"].as_u64().is_some());

    let (_, body) = send(&router, "GET", "/collections/foo.orphans/range_deletions", None).await;
    assert_eq!(body["pending"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.orphans/cleanup",
        Some(json!({ "max_docs": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidOptions");

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.orphans/cleanup",
        Some(json!({ "max_docs": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["work_attempted"], true);
    assert_eq!(body["pending"], 0);

    let (_, body) = send(&router, "POST", "/collections/foo.orphans/cleanup", None).await;
    assert_eq!(body["work_attempted"], false);

    assert_eq!(service.storage().get_collection("foo.orphans").unwrap().len(), 2);
}

#[tokio::test]
async fn test_move_chunk_schedules_deletion() {
    let (router, _) = router(true);
    let epoch = shard(&router, "foo.bar", json!([{ "_id": 10 }])).await;

    for id in [1, 20, 30] {
        let (status, _) = send(
            &router,
            "POST",
            "/collections/foo.bar/documents",
            Some(json!({ "_id": id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.bar/move",
        Some(json!({
            "min": { "_id": 10 },
            "max": { "_id": { "$maxKey": 1 } },
            "to_shard": "shard0001",
            "epoch": epoch,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (_, body) = send(&router, "GET", "/collections/foo.bar/range_deletions", None).await;
    let pending = body["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["epoch"], epoch);

    // Documents in the donated range now belong elsewhere
    let (status, body) = send(
        &router,
        "POST",
        "/collections/foo.bar/documents",
        Some(json!({ "_id": 50 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "StaleConfig");
}

#[tokio::test]
async fn test_drop_collection_releases_local_state() {
    let (router, service) = router(true);
    shard(&router, "foo.bar", json!([])).await;
    let (status, _) = send(&router, "POST", "/collections/foo.bar/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &router,
        "POST",
        "/collections/foo.bar/documents",
        Some(json!({ "_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(service.metadata().namespaces(), vec!["foo.bar"]);

    let (status, body) = send(&router, "DELETE", "/collections/foo.bar", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dropped"], true);
    assert!(service.storage().get_collection("foo.bar").is_none());
    assert!(service.storage().lock_manager().is_empty());
    assert!(service.metadata().namespaces().is_empty());

    let (_, body) = send(&router, "DELETE", "/collections/foo.bar", None).await;
    assert_eq!(body["dropped"], false);
}
