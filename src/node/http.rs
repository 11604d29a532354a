//! HTTP admin API of a shard node
//!
//! The single adapter between command errors and the transport: every
//! handler returns `Result<_, Error>` and [`Error`] renders as a status code
//! plus `{ "error": code, "message": .. }`.

use crate::catalog::{ChunkRange, ConfigServer, Epoch, KeyPattern, ShardKey};
use crate::common::{Error, OperationContext, Result};
use crate::sharding::{
    donate_chunk, split_chunk, MoveChunkRequest, ShardService, SplitChunkRequest,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Deadline applied to every admin request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared router state
#[derive(Clone)]
pub struct NodeState {
    pub service: Arc<ShardService>,
    /// Set when the node runs the config service in-process
    pub config_server: Option<Arc<ConfigServer>>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (
            status,
            Json(json!({ "error": self.code(), "message": self.to_string() })),
        )
            .into_response()
    }
}

fn request_context(name: &str) -> OperationContext {
    OperationContext::new(format!("http:{}", name)).with_timeout(REQUEST_TIMEOUT)
}

/// Creates the admin router
pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/collections/:ns", delete(drop_collection))
        .route("/collections/:ns/metadata", get(collection_metadata))
        .route("/collections/:ns/refresh", post(refresh))
        .route("/collections/:ns/split", post(split))
        .route("/collections/:ns/move", post(move_chunk))
        .route(
            "/collections/:ns/range_deletions",
            get(list_range_deletions).post(add_range_deletion),
        )
        .route("/collections/:ns/cleanup", post(cleanup))
        .route("/collections/:ns/documents", post(insert_document))
        .route("/config/collections/:ns/shard", post(shard_collection))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn status(State(state): State<NodeState>) -> impl IntoResponse {
    let svc = &state.service;
    let sharding = svc.sharding().state();
    let identity = svc.sharding().identity().ok();

    Json(json!({
        "node_id": svc.config().node_id,
        "state": sharding.name(),
        "shard_name": identity.as_ref().map(|i| i.shard_name.clone()),
        "cluster_id": identity.as_ref().map(|i| i.cluster_id.to_string()),
        "config_server": identity.as_ref().map(|i| i.config_server.clone()),
        "cached_collections": svc.metadata().namespaces(),
        "collections": svc.storage().list_collections(),
        "pending_range_deletions": svc.range_deleters().total_pending(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn metadata_json(svc: &ShardService, ns: &str) -> Value {
    let metadata = svc.metadata().get_metadata(ns);
    let chunks: Vec<Value> = match metadata.key_pattern() {
        Some(pattern) => metadata
            .chunks()
            .map(|c| {
                json!({
                    "min": pattern.to_bound(c.range.min()),
                    "max": pattern.to_bound(c.range.max()),
                    "version": c.version.to_string(),
                })
            })
            .collect(),
        None => Vec::new(),
    };

    json!({
        "ns": ns,
        "sharded": metadata.is_sharded(),
        "key_pattern": metadata.key_pattern().map(|p| p.fields().to_vec()),
        "epoch": metadata.epoch().to_string(),
        "collection_version": metadata.collection_version().to_string(),
        "shard_version": metadata.shard_version().to_string(),
        "chunks": chunks,
    })
}

async fn collection_metadata(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
) -> Result<Json<Value>> {
    state.service.sharding().can_accept_sharded_commands()?;
    Ok(Json(metadata_json(&state.service, &ns)))
}

async fn refresh(State(state): State<NodeState>, Path(ns): Path<String>) -> Result<Json<Value>> {
    let ctx = request_context("refresh");
    let version = state
        .service
        .metadata()
        .refresh_metadata_now(&ctx, &ns)
        .await?;
    Ok(Json(json!({
        "shard_version": version.to_string(),
        "metadata": metadata_json(&state.service, &ns),
    })))
}

/// Key pattern of a sharded collection, refreshing once if not cached
async fn key_pattern_for(ctx: &OperationContext, svc: &ShardService, ns: &str) -> Result<KeyPattern> {
    if let Some(pattern) = svc.metadata().get_metadata(ns).key_pattern() {
        return Ok(pattern.clone());
    }
    svc.metadata().refresh_metadata_now(ctx, ns).await?;
    svc.metadata()
        .get_metadata(ns)
        .key_pattern()
        .cloned()
        .ok_or_else(|| Error::NamespaceNotFound(format!("{} is not sharded", ns)))
}

fn parse_range(pattern: &KeyPattern, min: &Value, max: &Value) -> Result<ChunkRange> {
    ChunkRange::new(pattern.parse_bound(min)?, pattern.parse_bound(max)?)
}

#[derive(Debug, Deserialize)]
struct SplitBody {
    key_pattern: Vec<String>,
    min: Value,
    max: Value,
    split_keys: Vec<Value>,
    epoch: Uuid,
    #[serde(default)]
    from_shard: Option<String>,
    #[serde(default)]
    txn_number: Option<u64>,
}

async fn split(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    Json(body): Json<SplitBody>,
) -> Result<Json<Value>> {
    let svc = &state.service;
    let mut ctx = request_context("split");
    if let Some(txn) = body.txn_number {
        ctx = ctx.with_txn_number(txn);
    }

    let key_pattern = KeyPattern::new(body.key_pattern)?;
    let range = parse_range(&key_pattern, &body.min, &body.max)?;
    let split_keys = body
        .split_keys
        .iter()
        .map(|k| key_pattern.parse_bound(k))
        .collect::<Result<Vec<ShardKey>>>()?;
    let from_shard = match body.from_shard {
        Some(shard) => shard,
        None => svc.sharding().shard_name()?,
    };

    let req = SplitChunkRequest {
        ns,
        key_pattern: key_pattern.clone(),
        range,
        split_keys,
        expected_epoch: Epoch::from(body.epoch),
        from_shard,
    };
    let res = split_chunk(&ctx, svc, &req).await?;

    Ok(Json(json!({
        "ok": true,
        "top_chunk": res.top_chunk.map(|c| json!({
            "min": key_pattern.to_bound(c.min()),
            "max": key_pattern.to_bound(c.max()),
        })),
    })))
}

#[derive(Debug, Deserialize)]
struct MoveBody {
    min: Value,
    max: Value,
    to_shard: String,
    epoch: Uuid,
    #[serde(default)]
    txn_number: Option<u64>,
}

async fn move_chunk(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Json<Value>> {
    let svc = &state.service;
    let mut ctx = request_context("move");
    if let Some(txn) = body.txn_number {
        ctx = ctx.with_txn_number(txn);
    }

    let key_pattern = key_pattern_for(&ctx, svc, &ns).await?;
    let req = MoveChunkRequest {
        range: parse_range(&key_pattern, &body.min, &body.max)?,
        ns,
        to_shard: body.to_shard,
        expected_epoch: Epoch::from(body.epoch),
    };
    let res = donate_chunk(&ctx, svc, &req).await?;

    Ok(Json(json!({
        "ok": true,
        "shard_version": res.shard_version.to_string(),
        "range_deletion_task": res.range_deletion_task,
    })))
}

async fn list_range_deletions(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
) -> Result<Json<Value>> {
    let tasks: Vec<Value> = state
        .service
        .range_deleters()
        .pending(&ns)
        .into_iter()
        .map(|t| {
            json!({
                "id": t.id,
                "min": t.key_pattern.to_bound(t.range.min()),
                "max": t.key_pattern.to_bound(t.range.max()),
                "epoch": t.epoch.map(|e| e.to_string()),
                "enqueued_at": t.enqueued_at,
            })
        })
        .collect();
    Ok(Json(json!({ "ns": ns, "pending": tasks })))
}

#[derive(Debug, Deserialize)]
struct RangeDeletionBody {
    #[serde(default)]
    key_pattern: Option<Vec<String>>,
    min: Value,
    max: Value,
    #[serde(default)]
    epoch: Option<Uuid>,
}

async fn add_range_deletion(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    Json(body): Json<RangeDeletionBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let svc = &state.service;
    svc.sharding().can_accept_sharded_commands()?;
    let ctx = request_context("range_deletion");

    let key_pattern = match body.key_pattern {
        Some(fields) => KeyPattern::new(fields)?,
        None => key_pattern_for(&ctx, svc, &ns).await?,
    };
    let range = parse_range(&key_pattern, &body.min, &body.max)?;

    let registry = svc.range_deleters();
    let id = match body.epoch {
        Some(epoch) => registry.add_with_epoch(&ns, &key_pattern, range, Epoch::from(epoch))?,
        None => registry.add(&ns, &key_pattern, range)?,
    };
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupBody {
    #[serde(default)]
    max_docs: Option<usize>,
}

async fn cleanup(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<Value>> {
    let svc = &state.service;
    svc.sharding().can_accept_sharded_commands()?;
    let ctx = request_context("cleanup");

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let max_docs = body
        .max_docs
        .unwrap_or(svc.config().range_deleter.batch_size);
    let attempted = svc
        .range_deleters()
        .clean_up_next_range(&ctx, &ns, max_docs)
        .await?;

    Ok(Json(json!({
        "work_attempted": attempted,
        "pending": svc.range_deleters().pending(&ns).len(),
    })))
}

async fn insert_document(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    Json(doc): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let ctx = request_context("insert");
    let rid = state.service.insert_document(&ctx, &ns, doc).await?;
    Ok((StatusCode::CREATED, Json(json!({ "record_id": rid.0 }))))
}

async fn drop_collection(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
) -> Result<Json<Value>> {
    let ctx = request_context("drop");
    let dropped = state.service.drop_collection(&ctx, &ns).await?;
    Ok(Json(json!({ "dropped": dropped })))
}

#[derive(Debug, Deserialize)]
struct ShardCollectionBody {
    key_pattern: Vec<String>,
    #[serde(default)]
    split_points: Vec<Value>,
    /// Initial owner; defaults to this shard
    #[serde(default)]
    shard: Option<String>,
}

/// Shard a collection on the embedded config service
async fn shard_collection(
    State(state): State<NodeState>,
    Path(ns): Path<String>,
    Json(body): Json<ShardCollectionBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let config_server = state
        .config_server
        .as_ref()
        .ok_or_else(|| Error::InvalidOptions("this node does not run a config service".into()))?;

    let key_pattern = KeyPattern::new(body.key_pattern)?;
    let split_points = body
        .split_points
        .iter()
        .map(|k| key_pattern.parse_bound(k))
        .collect::<Result<Vec<ShardKey>>>()?;
    let shard = match body.shard {
        Some(shard) => shard,
        None => state.service.sharding().shard_name()?,
    };

    let epoch = config_server.shard_collection(&ns, key_pattern, &shard, &split_points)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ns": ns, "epoch": epoch.to_string() })),
    ))
}
