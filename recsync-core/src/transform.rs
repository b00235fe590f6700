//! Field transforms between wire values and semantic values.
//!
//! Every record field travels as a `serde_json::Value` on the wire and lives
//! as a [`FieldValue`] in memory. A [`FieldSpec`] names the field's type; the
//! [`Transform`] table maps type names to two-way [`FieldCodec`]s. A spec may
//! carry its own codec, which wins over the table.
//!
//! Codecs are pure and total: they never mutate their input, never perform
//! I/O, and reject anything they cannot parse with a [`TransformError`].

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::TransformError;
use crate::record::{FieldMap, FieldValue, WireMap};

/// Two-way conversion for one field type.
pub trait FieldCodec: Send + Sync {
    /// Wire value to semantic value.
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError>;

    /// Semantic value to wire value.
    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError>;
}

/// Declared type of a field, keyed into the [`Transform`] table by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Text,
    Timestamp,
    /// Any other registered type name.
    Named(String),
}

impl FieldType {
    pub fn name(&self) -> &str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "string",
            Self::Timestamp => "timestamp",
            Self::Named(name) => name,
        }
    }
}

/// Declaration of one field.
#[derive(Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    /// Custom codec; takes precedence over the type table.
    pub codec: Option<Arc<dyn FieldCodec>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            codec: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn FieldCodec>) -> Self {
        self.codec = Some(codec);
        self
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("custom_codec", &self.codec.is_some())
            .finish()
    }
}

/// The set of declared fields of a model.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field declaration (builder style).
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Type-name keyed codec table.
#[derive(Clone)]
pub struct Transform {
    codecs: HashMap<String, Arc<dyn FieldCodec>>,
}

impl Default for Transform {
    fn default() -> Self {
        let mut transform = Self {
            codecs: HashMap::new(),
        };
        let timestamp: Arc<dyn FieldCodec> = Arc::new(TimestampCodec);
        transform.register("timestamp", Arc::clone(&timestamp));
        transform.register("date", timestamp);
        transform.register("boolean", Arc::new(BooleanCodec));
        transform.register("integer", Arc::new(IntegerCodec));
        transform.register("float", Arc::new(FloatCodec));
        transform.register("string", Arc::new(TextCodec));
        transform
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.codecs.keys().collect();
        names.sort();
        f.debug_struct("Transform").field("types", &names).finish()
    }
}

impl Transform {
    /// Table with the built-in codecs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the codec for a type name.
    pub fn register(&mut self, type_name: impl Into<String>, codec: Arc<dyn FieldCodec>) {
        self.codecs.insert(type_name.into(), codec);
    }

    fn codec_for<'a>(&'a self, spec: &'a FieldSpec) -> Option<&'a Arc<dyn FieldCodec>> {
        spec.codec
            .as_ref()
            .or_else(|| self.codecs.get(spec.field_type.name()))
    }

    /// Convert one wire value to its semantic form.
    pub fn to_local(&self, raw: &Value, spec: &FieldSpec) -> Result<FieldValue, TransformError> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        match self.codec_for(spec) {
            Some(codec) => codec.to_local(&spec.name, raw),
            None => Err(TransformError::UnsupportedType {
                field: spec.name.clone(),
                type_name: spec.field_type.name().to_string(),
            }),
        }
    }

    /// Convert one semantic value to its wire form.
    pub fn to_wire(&self, local: &FieldValue, spec: &FieldSpec) -> Result<Value, TransformError> {
        if local.is_null() {
            return Ok(Value::Null);
        }
        match self.codec_for(spec) {
            Some(codec) => codec.to_wire(&spec.name, local),
            None => Err(TransformError::UnsupportedType {
                field: spec.name.clone(),
                type_name: spec.field_type.name().to_string(),
            }),
        }
    }

    /// Decode a whole wire map. Fields missing from the schema pass through.
    pub fn decode(&self, raw: &WireMap, schema: &FieldSchema) -> Result<FieldMap, TransformError> {
        raw.iter()
            .map(|(name, value)| {
                let local = match schema.get(name) {
                    Some(spec) => self.to_local(value, spec)?,
                    None => FieldValue::from_json(value),
                };
                Ok((name.clone(), local))
            })
            .collect()
    }

    /// Encode a whole field map. Fields missing from the schema pass through.
    pub fn encode(&self, data: &FieldMap, schema: &FieldSchema) -> Result<WireMap, TransformError> {
        data.iter()
            .map(|(name, value)| {
                let wire = match schema.get(name) {
                    Some(spec) => self.to_wire(value, spec)?,
                    None => value.to_json(),
                };
                Ok((name.clone(), wire))
            })
            .collect()
    }
}

fn invalid(field: &str, expected: &str, value: impl fmt::Display) -> TransformError {
    TransformError::InvalidValue {
        field: field.to_string(),
        expected: expected.to_string(),
        value: value.to_string(),
    }
}

fn invalid_local(field: &str, expected: &str, value: &FieldValue) -> TransformError {
    invalid(field, expected, format!("{:?}", value))
}

/// RFC 3339 strings and epoch milliseconds to UTC timestamps; RFC 3339 back.
struct TimestampCodec;

impl FieldCodec for TimestampCodec {
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError> {
        match raw {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| invalid(field, "timestamp", raw)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(FieldValue::Timestamp)
                .ok_or_else(|| invalid(field, "timestamp", raw)),
            _ => Err(invalid(field, "timestamp", raw)),
        }
    }

    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError> {
        match local {
            FieldValue::Timestamp(_) => Ok(local.to_json()),
            _ => Err(invalid_local(field, "timestamp", local)),
        }
    }
}

/// Booleans, `0`/`1`, and the usual yes/no spellings.
struct BooleanCodec;

impl FieldCodec for BooleanCodec {
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError> {
        match raw {
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(FieldValue::Bool(true)),
                Some(0) => Ok(FieldValue::Bool(false)),
                _ => Err(invalid(field, "boolean", raw)),
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "y" | "yes" | "true" => Ok(FieldValue::Bool(true)),
                "n" | "no" | "false" => Ok(FieldValue::Bool(false)),
                _ => Err(invalid(field, "boolean", raw)),
            },
            _ => Err(invalid(field, "boolean", raw)),
        }
    }

    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError> {
        match local {
            FieldValue::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(invalid_local(field, "boolean", local)),
        }
    }
}

/// Integral numbers and numeric strings.
struct IntegerCodec;

impl FieldCodec for IntegerCodec {
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError> {
        match raw {
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| invalid(field, "integer", raw)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| invalid(field, "integer", raw)),
            _ => Err(invalid(field, "integer", raw)),
        }
    }

    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError> {
        match local {
            FieldValue::Integer(i) => Ok(Value::from(*i)),
            _ => Err(invalid_local(field, "integer", local)),
        }
    }
}

/// Finite numbers and numeric strings.
struct FloatCodec;

impl FieldCodec for FloatCodec {
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError> {
        let parsed = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed
            .filter(|f| f.is_finite())
            .map(FieldValue::Float)
            .ok_or_else(|| invalid(field, "float", raw))
    }

    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError> {
        let value = match local {
            FieldValue::Float(f) => *f,
            FieldValue::Integer(i) => *i as f64,
            _ => return Err(invalid_local(field, "float", local)),
        };
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .ok_or_else(|| invalid_local(field, "float", local))
    }
}

struct TextCodec;

impl FieldCodec for TextCodec {
    fn to_local(&self, field: &str, raw: &Value) -> Result<FieldValue, TransformError> {
        raw.as_str()
            .map(|s| FieldValue::Text(s.to_string()))
            .ok_or_else(|| invalid(field, "string", raw))
    }

    fn to_wire(&self, field: &str, local: &FieldValue) -> Result<Value, TransformError> {
        match local {
            FieldValue::Text(s) => Ok(Value::String(s.clone())),
            _ => Err(invalid_local(field, "string", local)),
        }
    }
}
