//! Donor side of a chunk migration commit
//!
//! Hands a chunk to another shard on the config service and schedules the
//! orphaned range for deletion here. Cloning documents to the recipient is
//! not part of this module.

use crate::catalog::{ChunkRange, ChunkVersion, CommitMigrationRequest, Epoch, WriteConcern};
use crate::common::{retry_idempotent, Error, OperationContext, Result};
use crate::sharding::service::ShardService;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveChunkRequest {
    pub ns: String,
    pub range: ChunkRange,
    pub to_shard: String,
    pub expected_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveChunkResponse {
    /// This shard's version once the migration is visible
    pub shard_version: ChunkVersion,
    /// Range deletion task scheduled for the donated range
    pub range_deletion_task: u64,
}

/// Commit the migration of `req.range` to `req.to_shard`
pub async fn donate_chunk(
    ctx: &OperationContext,
    svc: &ShardService,
    req: &MoveChunkRequest,
) -> Result<MoveChunkResponse> {
    if ctx.txn_number().is_some() {
        return Err(Error::OperationNotSupportedInTransaction("moveChunk".into()));
    }
    svc.sharding().can_accept_sharded_commands()?;

    let shard_name = svc.sharding().shard_name()?;
    if req.to_shard.is_empty() || req.to_shard == shard_name {
        return Err(Error::InvalidOptions(format!(
            "invalid recipient shard '{}' for a chunk on {}",
            req.to_shard, shard_name
        )));
    }

    let split_config = &svc.config().split;
    let why = format!("migrating chunk {} in {} to {}", req.range, req.ns, req.to_shard);
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
    if !metadata.has_chunk(&req.range) {
        return Err(Error::StaleConfig {
            ns: req.ns.clone(),
            reason: format!(
                "chunk {} is not owned at shard version {}",
                req.range, shard_version
            ),
        });
    }
    let key_pattern = metadata
        .key_pattern()
        .cloned()
        .ok_or_else(|| Error::Fatal(format!("sharded metadata of {} has no shard key", req.ns)))?;

    let commit = CommitMigrationRequest {
        ns: req.ns.clone(),
        epoch: req.expected_epoch,
        range: req.range.clone(),
        from_shard: shard_name,
        to_shard: req.to_shard.clone(),
        write_concern: WriteConcern::Majority,
    };
    let committed = retry_idempotent(
        ctx,
        split_config.commit_retries,
        split_config.retry_delay(),
        || svc.config_client().commit_chunk_migration(&commit),
    )
    .await;

    let refreshed = svc.metadata().refresh_metadata_now(ctx, &req.ns).await;

    let shard_version = match (committed, refreshed) {
        (Ok(_), Ok(version)) => version,
        (Ok(version), Err(e)) => {
            tracing::warn!(ns = %req.ns, "Metadata refresh after migration commit failed: {}", e);
            version
        }
        (Err(e @ Error::StaleEpoch { .. }), _) => return Err(e),
        (Err(e), Ok(version)) => {
            let after = svc.metadata().get_metadata(&req.ns);
            if after.epoch() != req.expected_epoch || after.range_overlaps_owned(&req.range) {
                return Err(e);
            }
            tracing::info!(
                ns = %req.ns,
                range = %req.range,
                "Migration commit reported {} but the chunk is no longer owned",
                e.code()
            );
            version
        }
        (Err(e), Err(_)) => return Err(e),
    };

    let task = svc.range_deleters().add_with_epoch(
        &req.ns,
        &key_pattern,
        req.range.clone(),
        req.expected_epoch,
    )?;

    tracing::info!(
        ns = %req.ns,
        range = %req.range,
        to = %req.to_shard,
        %shard_version,
        "Donated chunk"
    );
    Ok(MoveChunkResponse {
        shard_version,
        range_deletion_task: task,
    })
}
