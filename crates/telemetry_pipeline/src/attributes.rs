//! Typed, bounded attribute maps attached to spans, logs and metric points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default bound on the number of attributes per item.
pub const DEFAULT_MAX_ATTRIBUTES: usize = 128;

/// Attribute value types for item metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    /// Coerces a free-form JSON value into an attribute.
    ///
    /// Arrays and objects are kept as their JSON text; `null` has no
    /// attribute representation and yields `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::String(s)),
            other @ (Value::Array(_) | Value::Object(_)) => Some(Self::String(other.to_string())),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for AttributeValue {
    /// Values above `i64::MAX` lose precision and become floats.
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn default_limit() -> usize {
    DEFAULT_MAX_ATTRIBUTES
}

/// Bounded string → [`AttributeValue`] map.
///
/// Inserting a new key into a full map drops the attribute and counts it;
/// overwriting an existing key always succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(flatten)]
    entries: BTreeMap<String, AttributeValue>,
    #[serde(skip, default = "default_limit")]
    limit: usize,
    #[serde(skip)]
    dropped: u32,
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

impl Attributes {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ATTRIBUTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit,
            dropped: 0,
        }
    }

    /// Inserts an attribute. Returns `false` if it was dropped by the bound.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> bool {
        let key = key.into();
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value.into();
            return true;
        }
        if self.entries.len() >= self.limit {
            self.dropped = self.dropped.saturating_add(1);
            return false;
        }
        self.entries.insert(key, value.into());
        true
    }

    /// Tightens the bound, discarding entries past it (in key order).
    pub fn enforce_limit(&mut self, limit: usize) {
        self.limit = self.limit.min(limit);
        while self.entries.len() > self.limit {
            self.entries.pop_last();
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of attributes discarded because the map was full.
    pub fn dropped_count(&self) -> u32 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for Attributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Self::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

impl<K, V> Extend<(K, V)> for Attributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}
