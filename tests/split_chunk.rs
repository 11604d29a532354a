//! Split coordinator tests against an embedded config service

use async_trait::async_trait;
use minishard::catalog::{
    ChunkRange, ChunkVersion, CommitMigrationRequest, CommitSplitRequest, ConfigClient,
    ConfigServer, DistLockManager, Epoch, KeyPattern, LocalDistLockManager, ReadPreference,
    RoutingTable, ShardKey,
};
use minishard::sharding::{
    split_chunk, ShardIdentity, ShardService, ShardingState, SplitChunkRequest,
};
use minishard::storage::Storage;
use minishard::{Config, Error, OperationContext, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const NS: &str = "foo.bar";
const SHARD: &str = "shard0000";

/// Applies the first split commit but reports a network failure for it
struct LostSplitResponse {
    inner: Arc<ConfigServer>,
    dropped: AtomicBool,
    commits: AtomicUsize,
}

#[async_trait]
impl ConfigClient for LostSplitResponse {
    async fn list_chunks(
        &self,
        ns: &str,
        shard: &str,
        read_preference: ReadPreference,
    ) -> Result<RoutingTable> {
        self.inner.list_chunks(ns, shard, read_preference).await
    }

    async fn list_collections(&self, shard: &str) -> Result<Vec<String>> {
        self.inner.list_collections(shard).await
    }

    async fn commit_chunk_split(&self, request: &CommitSplitRequest) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit_chunk_split(request).await?;
        if !self.dropped.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("connection reset by peer".into()));
        }
        Ok(())
    }

    async fn commit_chunk_migration(
        &self,
        request: &CommitMigrationRequest,
    ) -> Result<ChunkVersion> {
        self.inner.commit_chunk_migration(request).await
    }
}

/// Never reaches the config service on commit
struct Unreachable {
    inner: Arc<ConfigServer>,
}

#[async_trait]
impl ConfigClient for Unreachable {
    async fn list_chunks(
        &self,
        ns: &str,
        shard: &str,
        read_preference: ReadPreference,
    ) -> Result<RoutingTable> {
        self.inner.list_chunks(ns, shard, read_preference).await
    }

    async fn list_collections(&self, shard: &str) -> Result<Vec<String>> {
        self.inner.list_collections(shard).await
    }

    async fn commit_chunk_split(&self, _request: &CommitSplitRequest) -> Result<()> {
        Err(Error::ConnectionFailed("no route to host".into()))
    }

    async fn commit_chunk_migration(
        &self,
        _request: &CommitMigrationRequest,
    ) -> Result<ChunkVersion> {
        Err(Error::ConnectionFailed("no route to host".into()))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.split.lock_timeout_ms = 50;
    config.split.retry_delay_ms = 1;
    config
}

fn initialized_state() -> Arc<ShardingState> {
    let state = Arc::new(ShardingState::new());
    state.set_initialized_for_test(ShardIdentity {
        shard_name: SHARD.to_string(),
        cluster_id: Uuid::new_v4(),
        config_server: "local".to_string(),
    });
    state
}

struct Cluster {
    ctx: OperationContext,
    config_server: Arc<ConfigServer>,
    dist_lock: Arc<LocalDistLockManager>,
    svc: ShardService,
    epoch: Epoch,
}

impl Cluster {
    fn new() -> Self {
        let config_server = Arc::new(ConfigServer::new());
        Self::with_client(config_server.clone(), config_server)
    }

    fn with_client(config_server: Arc<ConfigServer>, client: Arc<dyn ConfigClient>) -> Self {
        let epoch = config_server
            .shard_collection(NS, KeyPattern::single("_id"), SHARD, &[])
            .unwrap();
        let dist_lock = Arc::new(LocalDistLockManager::new());
        let svc = ShardService::new(
            test_config(),
            initialized_state(),
            Arc::new(Storage::new()),
            client,
            dist_lock.clone(),
            None,
        )
        .unwrap();
        Self {
            ctx: OperationContext::new("test"),
            config_server,
            dist_lock,
            svc,
            epoch,
        }
    }

    async fn insert(&self, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.svc
                .storage()
                .insert(&self.ctx, NS, json!({ "_id": id }))
                .await
                .unwrap();
        }
    }

    fn request(&self, range: ChunkRange, split_keys: &[i64]) -> SplitChunkRequest {
        SplitChunkRequest {
            ns: NS.to_string(),
            key_pattern: KeyPattern::single("_id"),
            range,
            split_keys: split_keys.iter().copied().map(ShardKey::from).collect(),
            expected_epoch: self.epoch,
            from_shard: SHARD.to_string(),
        }
    }

    fn owned(&self) -> Vec<(ChunkRange, ChunkVersion)> {
        self.svc
            .metadata()
            .get_metadata(NS)
            .chunks()
            .map(|c| (c.range.clone(), c.version))
            .collect()
    }
}

fn whole() -> ChunkRange {
    let pattern = KeyPattern::single("_id");
    ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap()
}

fn range(min: i64, max: i64) -> ChunkRange {
    ChunkRange::new(ShardKey::from(min), ShardKey::from(max)).unwrap()
}

#[tokio::test]
async fn test_split_commits_new_chunks() {
    let cluster = Cluster::new();
    let req = cluster.request(whole(), &[0, 100]);

    split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();

    let owned = cluster.owned();
    assert_eq!(owned.len(), 3);
    assert_eq!(owned[0].0.max(), &ShardKey::from(0));
    assert_eq!(owned[1].0, range(0, 100));
    assert_eq!(owned[2].0.min(), &ShardKey::from(100));
    assert!(owned.iter().all(|(_, v)| v.epoch == cluster.epoch));

    let metadata = cluster.svc.metadata().get_metadata(NS);
    assert_eq!(metadata.collection_version(), ChunkVersion::new(1, 2, cluster.epoch));
    assert_eq!(cluster.config_server.all_chunks(NS).len(), 3);
    assert!(!cluster.dist_lock.is_locked(NS));
}

#[tokio::test]
async fn test_repeated_split_is_idempotent() {
    let cluster = Cluster::new();
    let req = cluster.request(whole(), &[50]);

    split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();
    let first = cluster.owned();

    split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();
    assert_eq!(cluster.owned(), first);
}

#[tokio::test]
async fn test_split_with_wrong_epoch() {
    let cluster = Cluster::new();
    let mut req = cluster.request(whole(), &[50]);
    req.expected_epoch = Epoch::generate();

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::StaleEpoch { .. }));
    assert_eq!(cluster.config_server.all_chunks(NS).len(), 1);
}

#[tokio::test]
async fn test_split_of_unowned_range() {
    let cluster = Cluster::new();
    let req = cluster.request(range(0, 100), &[50]);

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::StaleConfig { .. }));
    assert_eq!(cluster.config_server.all_chunks(NS).len(), 1);
}

#[tokio::test]
async fn test_split_when_shard_owns_nothing() {
    let config_server = Arc::new(ConfigServer::new());
    config_server
        .shard_collection("foo.elsewhere", KeyPattern::single("_id"), "shard0001", &[])
        .unwrap();
    let cluster = Cluster::with_client(config_server.clone(), config_server);

    let mut req = cluster.request(whole(), &[50]);
    req.ns = "foo.elsewhere".to_string();

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::StaleConfig { .. }));
}

#[tokio::test]
async fn test_split_rejects_bad_split_keys() {
    let cluster = Cluster::new();

    for keys in [vec![], vec![100, 50], vec![50, 50]] {
        let req = cluster.request(range(0, 100), &keys);
        let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)), "keys {:?}", keys);
    }

    // Split key on the range boundary
    let req = cluster.request(range(0, 100), &[0]);
    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
    let req = cluster.request(range(0, 100), &[100]);
    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[tokio::test]
async fn test_split_rejects_other_shard_key() {
    let cluster = Cluster::new();
    let mut req = cluster.request(whole(), &[50]);
    req.key_pattern = KeyPattern::single("user");

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[tokio::test]
async fn test_split_addressed_to_other_shard() {
    let cluster = Cluster::new();
    let mut req = cluster.request(whole(), &[50]);
    req.from_shard = "shard0001".to_string();

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[tokio::test]
async fn test_split_inside_transaction() {
    let cluster = Cluster::new();
    let req = cluster.request(whole(), &[50]);
    let ctx = OperationContext::new("test").with_txn_number(7);

    let err = split_chunk(&ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::OperationNotSupportedInTransaction(_)));
}

#[tokio::test]
async fn test_split_before_sharding_initialized() {
    let config_server = Arc::new(ConfigServer::new());
    let epoch = config_server
        .shard_collection(NS, KeyPattern::single("_id"), SHARD, &[])
        .unwrap();
    let svc = ShardService::new(
        test_config(),
        Arc::new(ShardingState::new()),
        Arc::new(Storage::new()),
        config_server,
        Arc::new(LocalDistLockManager::new()),
        None,
    )
    .unwrap();

    let req = SplitChunkRequest {
        ns: NS.to_string(),
        key_pattern: KeyPattern::single("_id"),
        range: whole(),
        split_keys: vec![ShardKey::from(50)],
        expected_epoch: epoch,
        from_shard: SHARD.to_string(),
    };
    let err = split_chunk(&OperationContext::new("test"), &svc, &req)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardingNotInitialized));
}

#[tokio::test]
async fn test_split_while_lock_is_held() {
    let cluster = Cluster::new();
    let _held = cluster
        .dist_lock
        .lock(&cluster.ctx, NS, "migrating", Duration::from_millis(50))
        .await
        .unwrap();

    let req = cluster.request(whole(), &[50]);
    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::LockBusy { .. }));
    assert_eq!(cluster.config_server.all_chunks(NS).len(), 1);
}

#[tokio::test]
async fn test_lost_commit_response_is_reconciled() {
    let config_server = Arc::new(ConfigServer::new());
    let client = Arc::new(LostSplitResponse {
        inner: config_server.clone(),
        dropped: AtomicBool::new(false),
        commits: AtomicUsize::new(0),
    });
    let cluster = Cluster::with_client(config_server, client.clone());
    let req = cluster.request(whole(), &[50]);

    split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();

    // The retry finds the chunk already split; the refreshed metadata decides
    assert!(client.commits.load(Ordering::SeqCst) >= 2);
    let owned = cluster.owned();
    assert_eq!(owned.len(), 2);
    assert_eq!(owned[0].0.max(), &ShardKey::from(50));
}

#[tokio::test]
async fn test_failed_commit_is_reported() {
    let config_server = Arc::new(ConfigServer::new());
    let client = Arc::new(Unreachable {
        inner: config_server.clone(),
    });
    let cluster = Cluster::with_client(config_server, client);
    let req = cluster.request(whole(), &[50]);

    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)));
    assert_eq!(cluster.owned().len(), 1);
    assert!(!cluster.dist_lock.is_locked(NS));
}

#[tokio::test]
async fn test_top_chunk_hint_at_max_end() {
    let cluster = Cluster::new();
    cluster.insert(0..=10).await;

    let req = cluster.request(whole(), &[10]);
    let resp = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();

    let pattern = KeyPattern::single("_id");
    let expected = ChunkRange::new(ShardKey::from(10), pattern.global_max()).unwrap();
    assert_eq!(resp.top_chunk, Some(expected));
}

#[tokio::test]
async fn test_top_chunk_hint_at_min_end() {
    let cluster = Cluster::new();
    cluster.insert(0..=20).await;

    let req = cluster.request(whole(), &[1]);
    let resp = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();

    let pattern = KeyPattern::single("_id");
    let expected = ChunkRange::new(pattern.global_min(), ShardKey::from(1)).unwrap();
    assert_eq!(resp.top_chunk, Some(expected));
}

#[tokio::test]
async fn test_no_top_chunk_hint_for_inner_split() {
    let cluster = Cluster::new();
    cluster.insert(0..100).await;

    let req = cluster.request(whole(), &[50]);
    let resp = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();
    assert_eq!(resp.top_chunk, None);
}

#[tokio::test]
async fn test_range_ending_inside_owned_chunk_is_stale() {
    let cluster = Cluster::new();
    let req = cluster.request(whole(), &[50]);
    split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap();

    let req = cluster.request(range(50, 1_000), &[60]);
    let err = split_chunk(&cluster.ctx, &cluster.svc, &req).await.unwrap_err();
    assert!(err.is_stale_view());
}
