//! # EJSON — extended JSON codec
//!
//! Lossless conversion between [`Value`] and plain JSON. Values JSON cannot
//! express natively are wrapped in single-key escape objects:
//!
//! | Value                | Wire form                               |
//! |----------------------|-----------------------------------------|
//! | `Date(ms)`           | `{"$date": ms}`                         |
//! | `Binary(bytes)`      | `{"$binary": "<base64>"}`               |
//! | `NaN`, `±Infinity`   | `{"$InfNaN": 0 \| 1 \| -1}`             |
//! | custom type          | `{"$type": name, "$value": repr}`       |
//! | colliding object     | `{"$escape": {...}}`                    |
//!
//! Custom types decode through a [`TypeRegistry`] that the caller builds and
//! passes down; there is no process-wide registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Number};
use thiserror::Error;

use crate::value::{Document, Value};

const RESERVED_KEYS: [&str; 4] = ["$date", "$binary", "$InfNaN", "$escape"];

#[derive(Error, Debug)]
pub enum EjsonError {
    #[error("Custom EJSON type {0} is not defined")]
    UnknownType(String),

    #[error("Invalid EJSON escape: {0}")]
    InvalidEscape(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 in $binary: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A user-defined value type that travels as `{"$type", "$value"}`.
pub trait CustomType: fmt::Debug + Send + Sync {
    /// Name the reviver is registered under.
    fn type_name(&self) -> &str;

    /// Serializable representation placed under `$value`.
    fn to_json_value(&self) -> Value;

    fn equals(&self, other: &dyn CustomType) -> bool {
        self.to_json_value() == other.to_json_value()
    }

    fn as_any(&self) -> &dyn Any;
}

pub type Reviver =
    Arc<dyn Fn(Value) -> Result<Arc<dyn CustomType>, EjsonError> + Send + Sync>;

/// Revivers for custom types, keyed by type name.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    revivers: HashMap<String, Reviver>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the reviver for `name`. Replaces any earlier registration.
    pub fn add_type<F>(&mut self, name: impl Into<String>, reviver: F)
    where
        F: Fn(Value) -> Result<Arc<dyn CustomType>, EjsonError> + Send + Sync + 'static,
    {
        self.revivers.insert(name.into(), Arc::new(reviver));
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.revivers.contains_key(name)
    }

    fn revive(&self, name: &str, repr: Value) -> Result<Value, EjsonError> {
        let reviver = self
            .revivers
            .get(name)
            .ok_or_else(|| EjsonError::UnknownType(name.to_string()))?;
        Ok(Value::Custom(reviver(repr)?))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.revivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Encode a value as plain JSON.
pub fn to_json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => encode_number(*n),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(a) => serde_json::Value::Array(a.iter().map(to_json_value).collect()),
        Value::Object(o) => encode_object(o),
        Value::Binary(bytes) => single("$binary", serde_json::Value::String(BASE64.encode(bytes))),
        Value::Date(ms) => single("$date", serde_json::Value::Number((*ms).into())),
        Value::Custom(c) => {
            let mut map = Map::new();
            map.insert("$type".to_string(), serde_json::Value::String(c.type_name().to_string()));
            map.insert("$value".to_string(), to_json_value(&c.to_json_value()));
            serde_json::Value::Object(map)
        }
    }
}

fn single(key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    serde_json::Value::Object(map)
}

fn encode_number(n: f64) -> serde_json::Value {
    if n.is_nan() {
        return single("$InfNaN", serde_json::Value::Number(0.into()));
    }
    if n.is_infinite() {
        let code: i64 = if n > 0.0 { 1 } else { -1 };
        return single("$InfNaN", serde_json::Value::Number(code.into()));
    }
    // -0.0 stays a float so the sign survives the round trip.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 && !(n == 0.0 && n.is_sign_negative()) {
        return serde_json::Value::Number((n as i64).into());
    }
    Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn encode_object(doc: &Document) -> serde_json::Value {
    let map: Map<String, serde_json::Value> =
        doc.iter().map(|(k, v)| (k.clone(), to_json_value(v))).collect();
    if needs_escape(doc) {
        single("$escape", serde_json::Value::Object(map))
    } else {
        serde_json::Value::Object(map)
    }
}

// An object that would be mistaken for an escape on the way back in.
fn needs_escape(doc: &Document) -> bool {
    match doc.len() {
        1 => doc.keys().any(|k| RESERVED_KEYS.contains(&k.as_str())),
        2 => doc.contains_key("$type") && doc.contains_key("$value"),
        _ => false,
    }
}

/// Decode plain JSON, reviving escapes and registered custom types.
pub fn from_json_value(json: &serde_json::Value, registry: &TypeRegistry) -> Result<Value, EjsonError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(a) => a
            .iter()
            .map(|v| from_json_value(v, registry))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        serde_json::Value::Object(map) => decode_object(map, registry),
    }
}

fn decode_object(map: &Map<String, serde_json::Value>, registry: &TypeRegistry) -> Result<Value, EjsonError> {
    if map.len() == 1 {
        if let Some((key, inner)) = map.iter().next() {
            match key.as_str() {
                "$date" => {
                    let ms = inner
                        .as_f64()
                        .ok_or_else(|| EjsonError::InvalidEscape(format!("$date: {inner}")))?;
                    return Ok(Value::Date(ms as i64));
                }
                "$binary" => {
                    let text = inner
                        .as_str()
                        .ok_or_else(|| EjsonError::InvalidEscape(format!("$binary: {inner}")))?;
                    return Ok(Value::Binary(BASE64.decode(text)?));
                }
                "$InfNaN" => {
                    let code = inner
                        .as_i64()
                        .ok_or_else(|| EjsonError::InvalidEscape(format!("$InfNaN: {inner}")))?;
                    let n = match code {
                        0 => f64::NAN,
                        c if c > 0 => f64::INFINITY,
                        _ => f64::NEG_INFINITY,
                    };
                    return Ok(Value::Number(n));
                }
                "$escape" => {
                    let escaped = inner
                        .as_object()
                        .ok_or_else(|| EjsonError::InvalidEscape(format!("$escape: {inner}")))?;
                    let mut doc = Document::new();
                    for (k, v) in escaped {
                        doc.insert(k.clone(), from_json_value(v, registry)?);
                    }
                    return Ok(Value::Object(doc));
                }
                _ => {}
            }
        }
    }
    if map.len() == 2 {
        if let (Some(name), Some(repr)) = (map.get("$type"), map.get("$value")) {
            let name = name
                .as_str()
                .ok_or_else(|| EjsonError::InvalidEscape(format!("$type: {name}")))?;
            let repr = from_json_value(repr, registry)?;
            return registry.revive(name, repr);
        }
    }
    let mut doc = Document::new();
    for (k, v) in map {
        doc.insert(k.clone(), from_json_value(v, registry)?);
    }
    Ok(Value::Object(doc))
}

/// Serialize to a JSON string. `canonical` sorts object keys recursively so
/// equal values always stringify identically.
pub fn stringify(value: &Value, canonical: bool) -> String {
    let mut json = to_json_value(value);
    if canonical {
        json = sort_keys(json);
    }
    json.to_string()
}

fn sort_keys(json: serde_json::Value) -> serde_json::Value {
    match json {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        serde_json::Value::Array(a) => serde_json::Value::Array(a.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Parse a JSON string and decode EJSON escapes.
pub fn parse(text: &str, registry: &TypeRegistry) -> Result<Value, EjsonError> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    from_json_value(&json, registry)
}
