//! Chunk ranges, epochs and chunk versions

use crate::catalog::key::ShardKey;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Opaque collection incarnation id, regenerated whenever a collection is
/// (re)sharded. The nil epoch marks an unsharded collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn unsharded() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_unsharded(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for Epoch {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(major, minor, epoch)`. Versions are only ordered within one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: Epoch,
}

impl ChunkVersion {
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        major: 0,
        minor: 0,
        epoch: Epoch::unsharded(),
    };

    pub fn new(major: u32, minor: u32, epoch: Epoch) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    pub fn is_set(&self) -> bool {
        self.major > 0 || self.minor > 0
    }

    pub fn is_same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Strictly older within the same epoch; versions of different epochs are unordered
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Less))
    }

    pub fn inc_major(&self) -> Self {
        Self::new(self.major + 1, 0, self.epoch)
    }

    pub fn inc_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, self.epoch)
    }
}

impl PartialOrd for ChunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Half-open key range `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    min: ShardKey,
    max: ShardKey,
}

impl ChunkRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Result<Self> {
        if min.len() != max.len() {
            return Err(Error::InvalidOptions(format!(
                "range bounds {} and {} have different arity",
                min, max
            )));
        }
        if min >= max {
            return Err(Error::InvalidOptions(format!(
                "range min {} must be less than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> &ShardKey {
        &self.min
    }

    pub fn max(&self) -> &ShardKey {
        &self.max
    }

    pub fn contains_key(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Split into contiguous sub-ranges at `split_keys`, which must be
    /// strictly increasing and strictly inside `(min, max)`
    pub fn split_at(&self, split_keys: &[ShardKey]) -> Result<Vec<ChunkRange>> {
        validate_split_keys(self, split_keys)?;
        let mut ranges = Vec::with_capacity(split_keys.len() + 1);
        let mut start = self.min.clone();
        for key in split_keys {
            ranges.push(ChunkRange {
                min: start,
                max: key.clone(),
            });
            start = key.clone();
        }
        ranges.push(ChunkRange {
            min: start,
            max: self.max.clone(),
        });
        Ok(ranges)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Check split points against the range being split
pub fn validate_split_keys(range: &ChunkRange, split_keys: &[ShardKey]) -> Result<()> {
    if split_keys.is_empty() {
        return Err(Error::InvalidOptions("no split keys specified".into()));
    }
    let mut previous = range.min();
    for key in split_keys {
        if key.len() != range.min().len() {
            return Err(Error::InvalidOptions(format!(
                "split key {} does not match the shard key arity",
                key
            )));
        }
        if key <= previous {
            return Err(Error::InvalidOptions(format!(
                "split key {} must be greater than {}",
                key, previous
            )));
        }
        previous = key;
    }
    if previous >= range.max() {
        return Err(Error::InvalidOptions(format!(
            "split key {} must be less than range max {}",
            previous,
            range.max()
        )));
    }
    Ok(())
}

/// Authoritative chunk entry: a range, its placement version and owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType {
    pub range: ChunkRange,
    pub version: ChunkVersion,
    pub shard: String,
}
