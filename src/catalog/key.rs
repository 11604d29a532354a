//! Shard key values, key tuples and key patterns
//!
//! Keys are ordered tuples of typed values compared lexicographically in
//! key-pattern order. `MinKey` and `MaxKey` sort below and above every real
//! value, which makes `[global_min, global_max)` the whole key space.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// A single typed field value
///
/// Ordered `MinKey < Null < numbers < strings < booleans < MaxKey`. Integers
/// and doubles compare by exact numeric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    Double(f64),
    String(String),
    Bool(bool),
    MaxKey,
}

impl KeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Int(_) | KeyValue::Double(_) => 2,
            KeyValue::String(_) => 3,
            KeyValue::Bool(_) => 4,
            KeyValue::MaxKey => 5,
        }
    }

    /// Convert a JSON value. `{"$minKey": 1}` / `{"$maxKey": 1}` denote the
    /// sentinels; other objects and arrays cannot be key values.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(KeyValue::Null),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(KeyValue::Int(i)),
                None => n
                    .as_f64()
                    .map(KeyValue::Double)
                    .ok_or_else(|| Error::InvalidOptions(format!("unsupported number {}", n))),
            },
            Value::String(s) => Ok(KeyValue::String(s.clone())),
            Value::Bool(b) => Ok(KeyValue::Bool(*b)),
            Value::Object(obj) if obj.len() == 1 && obj.contains_key("$minKey") => {
                Ok(KeyValue::MinKey)
            }
            Value::Object(obj) if obj.len() == 1 && obj.contains_key("$maxKey") => {
                Ok(KeyValue::MaxKey)
            }
            other => Err(Error::InvalidOptions(format!(
                "value {} cannot be part of a shard key",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => json!({ "$minKey": 1 }),
            KeyValue::Null => Value::Null,
            KeyValue::Int(i) => json!(i),
            KeyValue::Double(d) => json!(d),
            KeyValue::String(s) => json!(s),
            KeyValue::Bool(b) => json!(b),
            KeyValue::MaxKey => json!({ "$maxKey": 1 }),
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use KeyValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Double(b)) => cmp_int_double(*a, *b),
            (Double(a), Int(b)) => cmp_int_double(*b, *a).reverse(),
            // -0.0 and 0.0 are one value
            (Double(a), Double(b)) if a == b => Ordering::Equal,
            (Double(a), Double(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Exact comparison of an integer with a double, without rounding the
/// integer through `f64`. NaNs sort like `f64::total_cmp` places them.
fn cmp_int_double(i: i64, d: f64) -> Ordering {
    // 2^63: the first double above every i64
    const I64_END: f64 = 9_223_372_036_854_775_808.0;

    if d.is_nan() {
        return if d.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if d >= I64_END {
        return Ordering::Less;
    }
    if d < -I64_END {
        return Ordering::Greater;
    }

    let whole = d.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if d > whole => Ordering::Less,
        Ordering::Equal if d < whole => Ordering::Greater,
        other => other,
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::Null => write!(f, "null"),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Double(d) => write!(f, "{}", d),
            KeyValue::String(s) => write!(f, "{:?}", s),
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// Ordered tuple of key values
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pad trailing fields with `MinKey` up to `len` fields
    pub fn extend_with_min(&self, len: usize) -> ShardKey {
        let mut values = self.0.clone();
        while values.len() < len {
            values.push(KeyValue::MinKey);
        }
        ShardKey(values)
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey(vec![KeyValue::Int(v)])
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Ordered list of shard key fields, e.g. `{_id: 1}` is `["_id"]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<String>,
}

impl KeyPattern {
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(Error::InvalidOptions("key pattern cannot be empty".into()));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(Error::InvalidOptions("key pattern field cannot be empty".into()));
        }
        Ok(Self { fields })
    }

    /// Single-field pattern
    pub fn single(field: &str) -> Self {
        Self {
            fields: vec![field.to_string()],
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Does `other` (an index key pattern) start with this pattern's fields?
    pub fn is_prefix_of(&self, other: &[String]) -> bool {
        other.len() >= self.fields.len() && self.fields.iter().zip(other).all(|(a, b)| a == b)
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MinKey; self.fields.len()])
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MaxKey; self.fields.len()])
    }

    /// Extract the shard key of a document; missing fields extract as `Null`
    pub fn extract(&self, doc: &Value) -> Result<ShardKey> {
        extract_fields(&self.fields, doc)
    }

    /// Parse a range bound such as `{"_id": 10}`; every field must be present
    pub fn parse_bound(&self, bound: &Value) -> Result<ShardKey> {
        let obj = bound
            .as_object()
            .ok_or_else(|| Error::InvalidOptions(format!("bound {} is not an object", bound)))?;
        if obj.len() != self.fields.len() {
            return Err(Error::InvalidOptions(format!(
                "bound {} does not match key pattern {}",
                bound, self
            )));
        }
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = obj.get(field).ok_or_else(|| {
                Error::InvalidOptions(format!("bound {} is missing field {}", bound, field))
            })?;
            values.push(KeyValue::from_json(value)?);
        }
        Ok(ShardKey(values))
    }

    /// Render a key as a bound document
    pub fn to_bound(&self, key: &ShardKey) -> Value {
        let mut obj = Map::new();
        for (field, value) in self.fields.iter().zip(key.values()) {
            obj.insert(field.clone(), value.to_json());
        }
        Value::Object(obj)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: 1", field)?;
        }
        write!(f, "}}")
    }
}

/// Extract the values of (possibly dotted) fields from a document
pub fn extract_fields(fields: &[String], doc: &Value) -> Result<ShardKey> {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let mut current = Some(doc);
        for part in field.split('.') {
            current = current.and_then(|v| v.get(part));
        }
        let value = match current {
            Some(v) => KeyValue::from_json(v)?,
            None => KeyValue::Null,
        };
        values.push(value);
    }
    Ok(ShardKey(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_bound_every_value() {
        let values = [
            KeyValue::Null,
            KeyValue::Int(i64::MIN),
            KeyValue::Double(f64::MAX),
            KeyValue::String(String::new()),
        ];
        for v in &values {
            assert!(KeyValue::MinKey < *v);
            assert!(*v < KeyValue::MaxKey);
        }
    }

    #[test]
    fn test_numbers_compare_across_types() {
        assert_eq!(KeyValue::Int(5), KeyValue::Double(5.0));
        assert!(KeyValue::Int(5) < KeyValue::Double(5.5));
        assert!(KeyValue::Double(-1.5) < KeyValue::Int(0));
        assert!(KeyValue::Int(100) < KeyValue::String("1".into()));
    }

    #[test]
    fn test_large_integers_compare_exactly_with_doubles() {
        let two_53 = 1i64 << 53;
        assert_eq!(KeyValue::Int(two_53), KeyValue::Double(two_53 as f64));
        assert!(KeyValue::Int(two_53 + 1) > KeyValue::Double(two_53 as f64));
        assert!(KeyValue::Double(two_53 as f64) < KeyValue::Int(two_53 + 1));
        assert!(KeyValue::Int(i64::MAX) < KeyValue::Double(9.3e18));
        assert!(KeyValue::Int(i64::MIN) == KeyValue::Double(-9_223_372_036_854_775_808.0));
        assert!(KeyValue::Int(i64::MIN) > KeyValue::Double(-1e19));
        assert!(KeyValue::Int(-2) < KeyValue::Double(-1.5));
        assert!(KeyValue::Int(-1) > KeyValue::Double(-1.5));
        assert!(KeyValue::Int(1) < KeyValue::Double(f64::INFINITY));
        assert!(KeyValue::Int(1) > KeyValue::Double(f64::NEG_INFINITY));
    }

    #[test]
    fn test_signed_zeros_are_equal() {
        assert_eq!(KeyValue::Double(-0.0), KeyValue::Double(0.0));
        assert_eq!(KeyValue::Int(0), KeyValue::Double(-0.0));
    }

    #[test]
    fn test_booleans_sort_after_strings() {
        assert!(KeyValue::String("zzz".into()) < KeyValue::Bool(false));
        assert!(KeyValue::Bool(false) < KeyValue::Bool(true));
        assert!(KeyValue::Bool(true) < KeyValue::MaxKey);
        assert_eq!(
            KeyValue::from_json(&json!(true)).unwrap(),
            KeyValue::Bool(true)
        );
        assert!(KeyValue::from_json(&json!({ "a": 1 })).is_err());
    }

    #[test]
    fn test_compound_keys_are_lexicographic() {
        let a = ShardKey(vec![KeyValue::Int(1), KeyValue::String("z".into())]);
        let b = ShardKey(vec![KeyValue::Int(2), KeyValue::String("a".into())]);
        let c = ShardKey(vec![KeyValue::Int(1), KeyValue::MaxKey]);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_extract_and_parse_bound() {
        let pattern = KeyPattern::new(["user.id", "ts"]).unwrap();
        let doc = json!({ "_id": 1, "user": { "id": "u7" }, "ts": 42 });
        let key = pattern.extract(&doc).unwrap();
        assert_eq!(key, ShardKey(vec!["u7".into(), KeyValue::Int(42)]));

        let missing = pattern.extract(&json!({ "_id": 2 })).unwrap();
        assert_eq!(missing, ShardKey(vec![KeyValue::Null, KeyValue::Null]));

        let pattern = KeyPattern::single("_id");
        assert_eq!(pattern.parse_bound(&json!({ "_id": 10 })).unwrap(), ShardKey::from(10));
        assert_eq!(
            pattern.parse_bound(&json!({ "_id": { "$maxKey": 1 } })).unwrap(),
            pattern.global_max()
        );
        assert!(pattern.parse_bound(&json!({ "x": 10 })).is_err());
        assert!(pattern.parse_bound(&json!({ "_id": [1] })).is_err());
    }

    #[test]
    fn test_extend_with_min() {
        let key = ShardKey::from(4);
        let extended = key.extend_with_min(3);
        assert_eq!(extended.len(), 3);
        assert!(extended < ShardKey(vec![KeyValue::Int(4), KeyValue::Null]));
        assert!(ShardKey(vec![KeyValue::Int(3), KeyValue::MaxKey]) < extended);
    }

    #[test]
    fn test_key_pattern_prefix() {
        let pattern = KeyPattern::single("_id");
        assert!(pattern.is_prefix_of(&["_id".to_string(), "ts".to_string()]));
        assert!(!pattern.is_prefix_of(&["ts".to_string(), "_id".to_string()]));
        assert!(KeyPattern::new(Vec::<String>::new()).is_err());
        assert_eq!(pattern.to_string(), "{_id: 1}");
    }
}
