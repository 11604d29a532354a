//! Chunk split coordinator
//!
//! Splits one owned chunk into contiguous sub-chunks under the collection's
//! distributed lock. The outcome is decided by the metadata refreshed after
//! the commit, not by the commit response alone: a commit whose response was
//! lost but whose effect is visible counts as a success.

use crate::catalog::{validate_split_keys, ChunkRange, CommitSplitRequest, Epoch, KeyPattern, ShardKey, WriteConcern};
use crate::common::{retry_idempotent, Error, OperationContext, Result};
use crate::sharding::service::ShardService;
use serde::{Deserialize, Serialize};

/// An extreme sub-chunk is suggested for migration right after a split only
/// when it holds exactly this many documents. Moving a near-empty chunk at
/// the edge of the key space is cheap, and monotonically increasing keys keep
/// landing there, so moving it early amortizes later migrations.
pub const TOP_CHUNK_DOC_THRESHOLD: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitChunkRequest {
    pub ns: String,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    pub split_keys: Vec<ShardKey>,
    pub expected_epoch: Epoch,
    pub from_shard: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitChunkResponse {
    /// Sub-chunk worth migrating right away, if any
    pub top_chunk: Option<ChunkRange>,
}

fn validate(svc: &ShardService, ctx: &OperationContext, req: &SplitChunkRequest) -> Result<()> {
    if ctx.txn_number().is_some() {
        return Err(Error::OperationNotSupportedInTransaction(
            "splitChunk".into(),
        ));
    }
    svc.sharding().can_accept_sharded_commands()?;

    let shard_name = svc.sharding().shard_name()?;
    if req.from_shard != shard_name {
        return Err(Error::InvalidOptions(format!(
            "split requested for shard {} but this is shard {}",
            req.from_shard, shard_name
        )));
    }
    if req.range.min().len() != req.key_pattern.len() {
        return Err(Error::InvalidOptions(format!(
            "range {} does not match shard key {}",
            req.range, req.key_pattern
        )));
    }
    validate_split_keys(&req.range, &req.split_keys)
}

/// Split `req.range` at `req.split_keys`
pub async fn split_chunk(
    ctx: &OperationContext,
    svc: &ShardService,
    req: &SplitChunkRequest,
) -> Result<SplitChunkResponse> {
    validate(svc, ctx, req)?;
    let shard_name = svc.sharding().shard_name()?;
    let split_config = &svc.config().split;

    let why = format!("splitting chunk {} in {}", req.range, req.ns);
    let _lock = svc
        .dist_lock()
        .lock(ctx, &req.ns, &why, split_config.lock_timeout())
        .await?;

    let shard_version = svc.metadata().refresh_metadata_now(ctx, &req.ns).await?;
    let metadata = svc.metadata().get_metadata(&req.ns);

    if shard_version.major == 0 {
        return Err(Error::StaleConfig {
            ns: req.ns.clone(),
            reason: "shard does not own any chunks of the collection".into(),
        });
    }
    if metadata.epoch() != req.expected_epoch {
        return Err(Error::StaleEpoch {
            ns: req.ns.clone(),
            expected: req.expected_epoch.to_string(),
            actual: metadata.epoch().to_string(),
        });
    }
    if metadata.key_pattern() != Some(&req.key_pattern) {
        return Err(Error::InvalidOptions(format!(
            "shard key {} does not match the collection shard key",
            req.key_pattern
        )));
    }
    if !metadata.has_chunk(&req.range) {
        if metadata.reflects_split(&req.range, &req.split_keys) {
            tracing::info!(ns = %req.ns, range = %req.range, "Chunk is already split at the requested keys");
            let top_chunk = top_chunk_hint(ctx, svc, req).await;
            return Ok(SplitChunkResponse { top_chunk });
        }
        return Err(Error::StaleConfig {
            ns: req.ns.clone(),
            reason: format!(
                "chunk {} is not owned at shard version {}",
                req.range, shard_version
            ),
        });
    }

    let commit = CommitSplitRequest {
        ns: req.ns.clone(),
        shard: shard_name,
        epoch: req.expected_epoch,
        range: req.range.clone(),
        split_keys: req.split_keys.clone(),
        write_concern: WriteConcern::Majority,
    };
    let committed = retry_idempotent(
        ctx,
        split_config.commit_retries,
        split_config.retry_delay(),
        || svc.config_client().commit_chunk_split(&commit),
    )
    .await;

    let refreshed = svc.metadata().refresh_metadata_now(ctx, &req.ns).await;
    if let Err(e) = &refreshed {
        tracing::warn!(ns = %req.ns, "Metadata refresh after split commit failed: {}", e);
    }

    match committed {
        Ok(()) => {}
        Err(e @ Error::StaleEpoch { .. }) => return Err(e),
        Err(e) => {
            let visible = refreshed.is_ok()
                && svc
                    .metadata()
                    .get_metadata(&req.ns)
                    .reflects_split(&req.range, &req.split_keys);
            if !visible {
                return Err(e);
            }
            tracing::info!(
                ns = %req.ns,
                range = %req.range,
                "Split commit reported {} but metadata reflects the split",
                e.code()
            );
        }
    }

    tracing::info!(
        ns = %req.ns,
        range = %req.range,
        split_keys = req.split_keys.len(),
        "Split chunk"
    );

    let top_chunk = top_chunk_hint(ctx, svc, req).await;
    Ok(SplitChunkResponse { top_chunk })
}

/// Back sub-chunk first, then the front one
async fn top_chunk_hint(
    ctx: &OperationContext,
    svc: &ShardService,
    req: &SplitChunkRequest,
) -> Option<ChunkRange> {
    let (first, last) = (req.split_keys.first()?, req.split_keys.last()?);
    let back = ChunkRange::new(last.clone(), req.range.max().clone()).ok()?;
    let front = ChunkRange::new(req.range.min().clone(), first.clone()).ok()?;

    let candidates = [
        (back.max() == &req.key_pattern.global_max()).then_some(back.clone()),
        (front.min() == &req.key_pattern.global_min()).then_some(front.clone()),
    ];

    for candidate in candidates.into_iter().flatten() {
        match svc
            .storage()
            .count_in_range(ctx, &req.ns, &req.key_pattern, &candidate)
            .await
        {
            Ok(count) if count == TOP_CHUNK_DOC_THRESHOLD => return Some(candidate),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(ns = %req.ns, range = %candidate, "Top chunk check failed: {}", e);
                return None;
            }
        }
    }
    None
}
