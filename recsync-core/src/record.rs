//! Record state: field map, lifecycle flags and the model contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::identity::{BusinessKey, ClientToken};
use crate::transform::FieldSchema;

/// Semantic in-memory value of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Arrays and objects are carried opaquely.
    Json(Value),
}

impl FieldValue {
    /// Lift a wire value without any type knowledge.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Json(value.clone())),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Json(value.clone()),
        }
    }

    /// Lower to a wire value without any type knowledge.
    ///
    /// Timestamps lower to RFC 3339 UTC strings, keeping any fractional seconds.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
            }
            Self::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Ordered map of field name to semantic value.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Wire form of a record's fields, as exchanged with gateways and durable state.
pub type WireMap = serde_json::Map<String, Value>;

/// Build a [`FieldMap`] from `(name, value)` pairs.
pub fn field_map<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Lifecycle flags of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    /// True until the remote source has confirmed the record exists.
    pub ghost: bool,
    /// True while local values differ from the last confirmed state.
    pub modified: bool,
}

impl Default for RecordFlags {
    fn default() -> Self {
        Self {
            ghost: true,
            modified: false,
        }
    }
}

/// Describes one kind of record: its business key field, field schema and
/// default values.
pub trait RecordModel: Send + Sync + 'static {
    /// Name of the field holding the server-assigned business key.
    fn id_key(&self) -> &str;

    /// Field schema used by the transform layer.
    fn schema(&self) -> &FieldSchema;

    /// Default values for fields the caller leaves unset.
    fn init(&self) -> FieldMap {
        FieldMap::new()
    }

    /// Business key of a field map, if the id field holds one.
    fn business_key(&self, data: &FieldMap) -> Option<BusinessKey> {
        data.get(self.id_key()).and_then(BusinessKey::from_field)
    }

    /// Construct a record with this model's defaults applied under `data`.
    fn create(&self, data: FieldMap, ghost: bool) -> Record {
        Record::with_defaults(self.init(), data, ghost)
    }
}

/// A single entity: client token, field map and lifecycle flags.
///
/// Pure state. Every mutator bumps the record's revision, which lets the
/// owning store detect edits made while a save was in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    token: ClientToken,
    data: FieldMap,
    flags: RecordFlags,
    revision: u64,
}

impl Record {
    /// Create a record from `data` with a fresh token.
    pub fn new(data: FieldMap, ghost: bool) -> Self {
        Self::with_defaults(FieldMap::new(), data, ghost)
    }

    /// Create a record whose unset fields come from `defaults`.
    pub fn with_defaults(defaults: FieldMap, data: FieldMap, ghost: bool) -> Self {
        let mut merged = defaults;
        merged.extend(data);
        Self {
            token: ClientToken::new(),
            data: merged,
            flags: RecordFlags {
                ghost,
                modified: false,
            },
            revision: 0,
        }
    }

    /// Rebuild a record with explicit flags, as done when rehydrating
    /// pending state.
    pub fn restore(data: FieldMap, flags: RecordFlags) -> Self {
        Self {
            token: ClientToken::new(),
            data,
            flags,
            revision: 0,
        }
    }

    pub fn token(&self) -> ClientToken {
        self.token
    }

    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn is_ghost(&self) -> bool {
        self.flags.ghost
    }

    pub fn is_modified(&self) -> bool {
        self.flags.modified
    }

    /// Monotonic mutation counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Merge `partial` into the field map and mark the record modified.
    pub fn set_data(&mut self, partial: FieldMap) {
        self.data.extend(partial);
        self.touch();
    }

    /// Set a single field and mark the record modified.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.data.insert(key.into(), value.into());
        self.touch();
    }

    /// Copy of a single field.
    pub fn get(&self, key: &str) -> Option<FieldValue> {
        self.data.get(key).cloned()
    }

    /// Copy of the whole field map.
    pub fn data(&self) -> FieldMap {
        self.data.clone()
    }

    /// Borrow the field map without copying.
    pub fn fields(&self) -> &FieldMap {
        &self.data
    }

    /// Mark the record as confirmed by the remote source.
    pub fn commit(&mut self) {
        self.flags.ghost = false;
        self.flags.modified = false;
    }

    /// Apply server-confirmed values and commit.
    pub fn acknowledge(&mut self, server: FieldMap) {
        self.data.extend(server);
        self.revision += 1;
        self.commit();
    }

    fn touch(&mut self) {
        self.flags.modified = true;
        self.revision += 1;
    }
}
