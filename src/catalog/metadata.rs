//! Immutable per-collection routing snapshot held by a shard
//!
//! Snapshots are built by metadata refreshes and shared as `Arc`s; readers
//! may keep one alive after the cache has moved on to a newer snapshot.

use crate::catalog::chunk::{ChunkRange, ChunkVersion, Epoch};
use crate::catalog::key::{KeyPattern, ShardKey};
use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::ops::Bound;

/// An owned chunk: `[min, max)` plus the version it was last placed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedChunk {
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

#[derive(Debug, Clone)]
struct ShardedInfo {
    key_pattern: KeyPattern,
    collection_version: ChunkVersion,
    shard_version: ChunkVersion,
    /// Owned chunks keyed by range min
    chunks: BTreeMap<ShardKey, OwnedChunk>,
}

/// Collection metadata snapshot
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    ns: String,
    sharded: Option<ShardedInfo>,
}

impl CollectionMetadata {
    /// Snapshot of a collection the shard has no routing information for
    pub fn unsharded(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            sharded: None,
        }
    }

    /// Build a sharded snapshot from the chunks this shard owns.
    ///
    /// The shard version is the highest version among `chunks`. Owned ranges
    /// must not overlap, and the collection version must dominate the shard
    /// version.
    pub fn sharded(
        ns: impl Into<String>,
        key_pattern: KeyPattern,
        collection_version: ChunkVersion,
        chunks: Vec<OwnedChunk>,
    ) -> Result<Self> {
        let ns = ns.into();
        let epoch = collection_version.epoch;
        let mut shard_version = ChunkVersion::new(0, 0, epoch);
        let mut by_min = BTreeMap::new();

        for chunk in chunks {
            if chunk.version.epoch != epoch {
                return Err(Error::Fatal(format!(
                    "chunk {} of {} has epoch {} but collection epoch is {}",
                    chunk.range, ns, chunk.version.epoch, epoch
                )));
            }
            if shard_version.is_older_than(&chunk.version) {
                shard_version = chunk.version;
            }
            by_min.insert(chunk.range.min().clone(), chunk);
        }

        let mut previous: Option<&OwnedChunk> = None;
        for chunk in by_min.values() {
            if let Some(prev) = previous {
                if prev.range.overlaps(&chunk.range) {
                    return Err(Error::Fatal(format!(
                        "owned chunks {} and {} of {} overlap",
                        prev.range, chunk.range, ns
                    )));
                }
            }
            previous = Some(chunk);
        }

        if collection_version.is_older_than(&shard_version) {
            return Err(Error::Fatal(format!(
                "collection version {} of {} is older than shard version {}",
                collection_version, ns, shard_version
            )));
        }
        if shard_version.major > 0 && by_min.is_empty() {
            return Err(Error::Fatal(format!(
                "shard version {} of {} is set but no chunks are owned",
                shard_version, ns
            )));
        }

        Ok(Self {
            ns,
            sharded: Some(ShardedInfo {
                key_pattern,
                collection_version,
                shard_version,
                chunks: by_min,
            }),
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is_sharded(&self) -> bool {
        self.sharded.is_some()
    }

    pub fn key_pattern(&self) -> Option<&KeyPattern> {
        self.sharded.as_ref().map(|s| &s.key_pattern)
    }

    pub fn epoch(&self) -> Epoch {
        self.sharded
            .as_ref()
            .map(|s| s.collection_version.epoch)
            .unwrap_or_else(Epoch::unsharded)
    }

    pub fn collection_version(&self) -> ChunkVersion {
        self.sharded
            .as_ref()
            .map(|s| s.collection_version)
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    pub fn shard_version(&self) -> ChunkVersion {
        self.sharded
            .as_ref()
            .map(|s| s.shard_version)
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    pub fn num_chunks(&self) -> usize {
        self.sharded.as_ref().map(|s| s.chunks.len()).unwrap_or(0)
    }

    /// Owned chunks in key order
    pub fn chunks(&self) -> impl Iterator<Item = &OwnedChunk> {
        self.sharded.iter().flat_map(|s| s.chunks.values())
    }

    /// Owned chunk whose min is exactly `start_key`
    pub fn get_next_chunk(&self, start_key: &ShardKey) -> Option<&OwnedChunk> {
        self.sharded.as_ref()?.chunks.get(start_key)
    }

    /// Is there an owned chunk exactly matching `range`?
    pub fn has_chunk(&self, range: &ChunkRange) -> bool {
        self.get_next_chunk(range.min())
            .map(|c| c.range.max() == range.max())
            .unwrap_or(false)
    }

    /// Does `range` intersect any owned chunk?
    pub fn range_overlaps_owned(&self, range: &ChunkRange) -> bool {
        let Some(info) = &self.sharded else {
            return false;
        };
        // Owned chunks are disjoint, so only the last one starting before
        // range.max can reach into the range.
        info.chunks
            .range((Bound::Unbounded, Bound::Excluded(range.max().clone())))
            .next_back()
            .map(|(_, chunk)| chunk.range.overlaps(range))
            .unwrap_or(false)
    }

    /// Does this shard own the chunk containing `key`?
    pub fn key_belongs_to_me(&self, key: &ShardKey) -> bool {
        let Some(info) = &self.sharded else {
            return false;
        };
        info.chunks
            .range((Bound::Unbounded, Bound::Included(key.clone())))
            .next_back()
            .map(|(_, chunk)| chunk.range.contains_key(key))
            .unwrap_or(false)
    }

    /// Do the owned chunks between `range.min` and `range.max` match exactly
    /// the sub-ranges produced by splitting `range` at `split_keys`?
    pub fn reflects_split(&self, range: &ChunkRange, split_keys: &[ShardKey]) -> bool {
        let mut start = range.min().clone();
        for boundary in split_keys.iter().chain(std::iter::once(range.max())) {
            match self.get_next_chunk(&start) {
                Some(chunk) if chunk.range.max() == boundary => start = boundary.clone(),
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(ShardKey::from(min), ShardKey::from(max)).unwrap()
    }

    fn snapshot(epoch: Epoch, chunks: &[(i64, i64, u32, u32)]) -> CollectionMetadata {
        let owned = chunks
            .iter()
            .map(|&(min, max, major, minor)| OwnedChunk {
                range: range(min, max),
                version: ChunkVersion::new(major, minor, epoch),
            })
            .collect();
        CollectionMetadata::sharded(
            "foo.bar",
            KeyPattern::single("_id"),
            ChunkVersion::new(5, 0, epoch),
            owned,
        )
        .unwrap()
    }

    #[test]
    fn test_unsharded_snapshot() {
        let meta = CollectionMetadata::unsharded("foo.bar");
        assert!(!meta.is_sharded());
        assert_eq!(meta.shard_version(), ChunkVersion::UNSHARDED);
        assert!(!meta.range_overlaps_owned(&range(0, 10)));
        assert!(meta.get_next_chunk(&ShardKey::from(0)).is_none());
    }

    #[test]
    fn test_shard_version_is_highest_owned() {
        let epoch = Epoch::generate();
        let meta = snapshot(epoch, &[(0, 10, 1, 3), (20, 30, 4, 1), (30, 40, 2, 0)]);
        assert_eq!(meta.shard_version(), ChunkVersion::new(4, 1, epoch));
        assert_eq!(meta.num_chunks(), 3);
    }

    #[test]
    fn test_overlap_and_ownership() {
        let meta = snapshot(Epoch::generate(), &[(0, 10, 1, 0), (20, 30, 1, 1)]);
        assert!(meta.range_overlaps_owned(&range(5, 15)));
        assert!(meta.range_overlaps_owned(&range(-5, 1)));
        assert!(meta.range_overlaps_owned(&range(25, 26)));
        assert!(!meta.range_overlaps_owned(&range(10, 20)));
        assert!(!meta.range_overlaps_owned(&range(30, 50)));

        assert!(meta.key_belongs_to_me(&ShardKey::from(0)));
        assert!(!meta.key_belongs_to_me(&ShardKey::from(10)));
        assert!(meta.key_belongs_to_me(&ShardKey::from(29)));
    }

    #[test]
    fn test_reflects_split() {
        let meta = snapshot(Epoch::generate(), &[(0, 10, 1, 1), (10, 20, 1, 2), (20, 30, 1, 3)]);
        assert!(meta.reflects_split(&range(0, 30), &[ShardKey::from(10), ShardKey::from(20)]));
        assert!(!meta.reflects_split(&range(0, 30), &[ShardKey::from(15)]));
        assert!(meta.has_chunk(&range(10, 20)));
        assert!(!meta.has_chunk(&range(0, 30)));
    }

    #[test]
    fn test_rejects_overlapping_chunks() {
        let epoch = Epoch::generate();
        let res = CollectionMetadata::sharded(
            "foo.bar",
            KeyPattern::single("_id"),
            ChunkVersion::new(3, 0, epoch),
            vec![
                OwnedChunk {
                    range: range(0, 10),
                    version: ChunkVersion::new(1, 0, epoch),
                },
                OwnedChunk {
                    range: range(5, 15),
                    version: ChunkVersion::new(1, 1, epoch),
                },
            ],
        );
        assert!(matches!(res, Err(Error::Fatal(_))));
    }

    #[test]
    fn test_collection_version_must_dominate() {
        let epoch = Epoch::generate();
        let res = CollectionMetadata::sharded(
            "foo.bar",
            KeyPattern::single("_id"),
            ChunkVersion::new(1, 0, epoch),
            vec![OwnedChunk {
                range: range(0, 10),
                version: ChunkVersion::new(2, 0, epoch),
            }],
        );
        assert!(matches!(res, Err(Error::Fatal(_))));
    }
}
