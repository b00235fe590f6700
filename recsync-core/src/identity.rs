//! Identity types for records and collections

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::FieldValue;

/// Client-local record identity.
///
/// Assigned when a record is constructed and stable for its in-memory
/// lifetime. UUIDv7 keeps tokens sortable by creation time, so ordered
/// containers keyed by token iterate in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(Uuid);

impl ClientToken {
    /// Generate a fresh token.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned business key of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusinessKey {
    Int(i64),
    Text(String),
}

impl BusinessKey {
    /// Extract a key from a local field value. Only integers and non-empty
    /// strings identify a record.
    pub fn from_field(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Integer(i) => Some(Self::Int(*i)),
            FieldValue::Text(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Extract a key from a raw wire value.
    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for BusinessKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for BusinessKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Identifier of a remote collection tracked by the staleness poller.
pub type CollectionId = String;

/// Compute a stable hex digest of any serializable value.
///
/// Serialization goes through `serde_json`, whose maps are key-ordered, so
/// equal payloads always produce equal digests across runs and processes.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(&hasher.finalize()[..16])
}
