//! In-memory collections with ordered secondary indexes
//!
//! Records live in a `BTreeMap<RecordId, Value>`; every index is an ordered
//! set of `(key, record id)` entries, so a bounded index scan is a
//! `BTreeSet::range`. Scans resume after the last returned entry on each
//! step and therefore observe concurrent inserts and deletes.

use crate::catalog::key::{extract_fields, KeyPattern, ShardKey};
use crate::common::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

pub const ID_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    const MIN: RecordId = RecordId(0);
    const MAX: RecordId = RecordId(u64::MAX);
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        }
    }

    /// Index serving a shard key pattern exactly
    pub fn for_key_pattern(pattern: &KeyPattern) -> Self {
        let name = pattern
            .fields()
            .iter()
            .map(|f| format!("{}_1", f))
            .collect::<Vec<_>>()
            .join("_");
        Self {
            name,
            fields: pattern.fields().to_vec(),
            unique: false,
        }
    }
}

/// Which ends of an index scan are inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundInclusion {
    IncludeStartKeyOnly,
    IncludeEndKeyOnly,
    IncludeBothStartAndEndKeys,
    ExcludeBothStartAndEndKeys,
}

impl BoundInclusion {
    fn start_inclusive(self) -> bool {
        matches!(
            self,
            BoundInclusion::IncludeStartKeyOnly | BoundInclusion::IncludeBothStartAndEndKeys
        )
    }

    fn end_inclusive(self) -> bool {
        matches!(
            self,
            BoundInclusion::IncludeEndKeyOnly | BoundInclusion::IncludeBothStartAndEndKeys
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexEntry {
    key: ShardKey,
    rid: RecordId,
}

#[derive(Debug)]
struct IndexData {
    spec: IndexSpec,
    entries: BTreeSet<IndexEntry>,
}

#[derive(Debug, Default)]
struct CollectionData {
    records: BTreeMap<RecordId, Value>,
    indexes: Vec<IndexData>,
    next_record_id: u64,
}

impl CollectionData {
    fn index(&self, name: &str) -> Option<&IndexData> {
        self.indexes.iter().find(|i| i.spec.name == name)
    }
}

/// A collection of JSON documents
#[derive(Debug)]
pub struct Collection {
    ns: String,
    data: RwLock<CollectionData>,
}

impl Collection {
    pub(crate) fn new(ns: &str) -> Self {
        let id_index = IndexData {
            spec: IndexSpec {
                name: ID_INDEX_NAME.to_string(),
                fields: vec!["_id".to_string()],
                unique: true,
            },
            entries: BTreeSet::new(),
        };
        Self {
            ns: ns.to_string(),
            data: RwLock::new(CollectionData {
                records: BTreeMap::new(),
                indexes: vec![id_index],
                next_record_id: 1,
            }),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn len(&self) -> usize {
        self.data.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().records.is_empty()
    }

    pub fn get(&self, rid: RecordId) -> Option<Value> {
        self.data.read().records.get(&rid).cloned()
    }

    /// Snapshot of every document in record order
    pub fn documents(&self) -> Vec<Value> {
        self.data.read().records.values().cloned().collect()
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.data
            .read()
            .indexes
            .iter()
            .map(|i| i.spec.clone())
            .collect()
    }

    /// Build a new index over the existing documents
    pub fn create_index(&self, spec: IndexSpec) -> Result<()> {
        if spec.fields.is_empty() {
            return Err(Error::InvalidOptions(format!(
                "index {} has no fields",
                spec.name
            )));
        }

        let mut data = self.data.write();
        if let Some(existing) = data.index(&spec.name) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(Error::InvalidOptions(format!(
                "index {} already exists with different fields",
                spec.name
            )));
        }

        let mut entries = BTreeSet::new();
        for (rid, doc) in &data.records {
            entries.insert(IndexEntry {
                key: extract_fields(&spec.fields, doc)?,
                rid: *rid,
            });
        }
        tracing::debug!(ns = %self.ns, index = %spec.name, entries = entries.len(), "Built index");
        data.indexes.push(IndexData { spec, entries });
        Ok(())
    }

    /// Index whose leading fields are the shard key fields
    pub fn find_shard_key_index(&self, pattern: &KeyPattern) -> Option<IndexSpec> {
        self.data
            .read()
            .indexes
            .iter()
            .find(|i| pattern.is_prefix_of(&i.spec.fields))
            .map(|i| i.spec.clone())
    }

    pub(crate) fn insert(&self, doc: Value) -> Result<RecordId> {
        if !doc.is_object() {
            return Err(Error::InvalidOptions(format!(
                "document {} is not an object",
                doc
            )));
        }
        if doc.get("_id").is_none() {
            return Err(Error::InvalidOptions(format!(
                "document {} has no _id",
                doc
            )));
        }

        let mut data = self.data.write();
        let rid = RecordId(data.next_record_id);

        let mut keys = Vec::with_capacity(data.indexes.len());
        for index in &data.indexes {
            let key = extract_fields(&index.spec.fields, &doc)?;
            if index.spec.unique {
                let seek = IndexEntry {
                    key: key.clone(),
                    rid: RecordId::MIN,
                };
                let duplicate = index
                    .entries
                    .range(seek..)
                    .next()
                    .map(|e| e.key == key)
                    .unwrap_or(false);
                if duplicate {
                    return Err(Error::DuplicateKey {
                        ns: self.ns.clone(),
                        key: format!("{}: {}", index.spec.name, key),
                    });
                }
            }
            keys.push(key);
        }

        for (index, key) in data.indexes.iter_mut().zip(keys) {
            index.entries.insert(IndexEntry { key, rid });
        }
        data.records.insert(rid, doc);
        data.next_record_id += 1;
        Ok(rid)
    }

    pub(crate) fn delete(&self, rid: RecordId) -> Option<Value> {
        let mut data = self.data.write();
        let doc = data.records.remove(&rid)?;
        for index in data.indexes.iter_mut() {
            if let Ok(key) = extract_fields(&index.spec.fields, &doc) {
                index.entries.remove(&IndexEntry { key, rid });
            }
        }
        Some(doc)
    }

    /// Open a bounded scan over `index`
    pub fn open_index_scan(
        self: &Arc<Self>,
        index: &str,
        start: ShardKey,
        end: ShardKey,
        inclusion: BoundInclusion,
    ) -> Result<IndexScan> {
        let data = self.data.read();
        let spec = data
            .index(index)
            .map(|i| i.spec.clone())
            .ok_or_else(|| {
                Error::Storage(format!("index {} not found on {}", index, self.ns))
            })?;
        if start.len() != spec.fields.len() || end.len() != spec.fields.len() {
            return Err(Error::Storage(format!(
                "scan bounds {} and {} do not match index {} arity",
                start, end, spec.name
            )));
        }
        drop(data);

        let position = if inclusion.start_inclusive() {
            Bound::Included(IndexEntry {
                key: start,
                rid: RecordId::MIN,
            })
        } else {
            Bound::Excluded(IndexEntry {
                key: start,
                rid: RecordId::MAX,
            })
        };
        let end = if inclusion.end_inclusive() {
            Bound::Included(IndexEntry {
                key: end,
                rid: RecordId::MAX,
            })
        } else {
            Bound::Excluded(IndexEntry {
                key: end,
                rid: RecordId::MIN,
            })
        };

        Ok(IndexScan {
            collection: self.clone(),
            index: spec.name,
            position,
            end,
            exhausted: false,
        })
    }
}

/// Forward cursor over an index range
#[derive(Debug)]
pub struct IndexScan {
    collection: Arc<Collection>,
    index: String,
    position: Bound<IndexEntry>,
    end: Bound<IndexEntry>,
    exhausted: bool,
}

impl IndexScan {
    /// Advance to the next entry in range
    pub fn next_entry(&mut self) -> Result<Option<(ShardKey, RecordId)>> {
        if self.exhausted {
            return Ok(None);
        }

        let data = self.collection.data.read();
        let index = data.index(&self.index).ok_or_else(|| {
            Error::Storage(format!(
                "index {} dropped on {} during scan",
                self.index, self.collection.ns
            ))
        })?;

        let empty = match (&self.position, &self.end) {
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => {
                s > e
                    || (s == e
                        && (matches!(self.position, Bound::Excluded(_))
                            || matches!(self.end, Bound::Excluded(_))))
            }
            _ => false,
        };
        if empty {
            self.exhausted = true;
            return Ok(None);
        }

        let next = index
            .entries
            .range((self.position.clone(), self.end.clone()))
            .next()
            .cloned();
        drop(data);

        match next {
            Some(entry) => {
                let item = (entry.key.clone(), entry.rid);
                self.position = Bound::Excluded(entry);
                Ok(Some(item))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }
}
