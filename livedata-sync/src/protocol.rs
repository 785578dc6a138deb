//! DDP wire protocol.
//!
//! Every message is one JSON object per WebSocket text frame, tagged by its
//! `msg` field. Values inside are EJSON so dates, binaries and special
//! numbers survive the trip; document ids travel in their stringified form.
//!
//! | Direction | Messages |
//! |-----------|----------|
//! | client → server | `connect`, `method`, `sub`, `unsub` |
//! | server → client | `connected`, `failed`, `result`, `updated`, `added`, `changed`, `removed`, `ready`, `nosub`, `error` |
//! | both | `ping`, `pong` |

use livedata_core::ejson::{from_json_value, to_json_value};
use livedata_core::{id_parse, id_stringify, ChangedFields, Document, TypeRegistry, Value};
use serde_json::{json, Map};
use thiserror::Error;

use crate::error::MethodError;

/// Protocol versions this implementation speaks, most preferred first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Missing or invalid field '{0}'")]
    MissingField(&'static str),

    #[error("Unknown message type '{0}'")]
    UnknownMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Unsupported protocol version {requested} (supported: {supported:?})")]
    VersionMismatch { requested: String, supported: Vec<String> },
}

/// A decoded DDP message.
#[derive(Debug, Clone, PartialEq)]
pub enum DdpMessage {
    Connect { version: String, support: Vec<String>, session: Option<String> },
    Connected { session: String },
    Failed { version: String },
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    Sub { id: String, name: String, params: Vec<Value> },
    Unsub { id: String },
    Nosub { id: String, error: Option<MethodError> },
    Added { collection: String, id: Value, fields: Document },
    Changed { collection: String, id: Value, fields: ChangedFields },
    Removed { collection: String, id: Value },
    Ready { subs: Vec<String> },
    Method { id: String, method: String, params: Vec<Value>, random_seed: Option<String> },
    Result { id: String, outcome: Result<Option<Value>, MethodError> },
    Updated { methods: Vec<String> },
    Error { reason: String, offending_message: Option<serde_json::Value> },
}

impl DdpMessage {
    /// The `msg` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DdpMessage::Connect { .. } => "connect",
            DdpMessage::Connected { .. } => "connected",
            DdpMessage::Failed { .. } => "failed",
            DdpMessage::Ping { .. } => "ping",
            DdpMessage::Pong { .. } => "pong",
            DdpMessage::Sub { .. } => "sub",
            DdpMessage::Unsub { .. } => "unsub",
            DdpMessage::Nosub { .. } => "nosub",
            DdpMessage::Added { .. } => "added",
            DdpMessage::Changed { .. } => "changed",
            DdpMessage::Removed { .. } => "removed",
            DdpMessage::Ready { .. } => "ready",
            DdpMessage::Method { .. } => "method",
            DdpMessage::Result { .. } => "result",
            DdpMessage::Updated { .. } => "updated",
            DdpMessage::Error { .. } => "error",
        }
    }

    /// Whether this is one of the messages that update client data or
    /// acknowledge that data is complete.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            DdpMessage::Added { .. }
                | DdpMessage::Changed { .. }
                | DdpMessage::Removed { .. }
                | DdpMessage::Ready { .. }
                | DdpMessage::Updated { .. }
                | DdpMessage::Nosub { .. }
        )
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ProtocolError> {
        let mut obj = Map::new();
        obj.insert("msg".into(), json!(self.kind()));
        match self {
            DdpMessage::Connect { version, support, session } => {
                if let Some(session) = session {
                    obj.insert("session".into(), json!(session));
                }
                obj.insert("version".into(), json!(version));
                obj.insert("support".into(), json!(support));
            }
            DdpMessage::Connected { session } => {
                obj.insert("session".into(), json!(session));
            }
            DdpMessage::Failed { version } => {
                obj.insert("version".into(), json!(version));
            }
            DdpMessage::Ping { id } | DdpMessage::Pong { id } => {
                if let Some(id) = id {
                    obj.insert("id".into(), json!(id));
                }
            }
            DdpMessage::Sub { id, name, params } => {
                obj.insert("id".into(), json!(id));
                obj.insert("name".into(), json!(name));
                obj.insert("params".into(), values_to_json(params));
            }
            DdpMessage::Unsub { id } => {
                obj.insert("id".into(), json!(id));
            }
            DdpMessage::Nosub { id, error } => {
                obj.insert("id".into(), json!(id));
                if let Some(error) = error {
                    obj.insert("error".into(), error.to_json());
                }
            }
            DdpMessage::Added { collection, id, fields } => {
                obj.insert("collection".into(), json!(collection));
                obj.insert("id".into(), json!(wire_id(id)?));
                obj.insert("fields".into(), to_json_value(&Value::Object(fields.clone())));
            }
            DdpMessage::Changed { collection, id, fields } => {
                obj.insert("collection".into(), json!(collection));
                obj.insert("id".into(), json!(wire_id(id)?));
                let mut set = Map::new();
                let mut cleared = Vec::new();
                for (key, value) in fields {
                    match value {
                        Some(v) => {
                            set.insert(key.clone(), to_json_value(v));
                        }
                        None => cleared.push(key.clone()),
                    }
                }
                if !set.is_empty() {
                    obj.insert("fields".into(), serde_json::Value::Object(set));
                }
                if !cleared.is_empty() {
                    obj.insert("cleared".into(), json!(cleared));
                }
            }
            DdpMessage::Removed { collection, id } => {
                obj.insert("collection".into(), json!(collection));
                obj.insert("id".into(), json!(wire_id(id)?));
            }
            DdpMessage::Ready { subs } => {
                obj.insert("subs".into(), json!(subs));
            }
            DdpMessage::Method { id, method, params, random_seed } => {
                obj.insert("method".into(), json!(method));
                obj.insert("params".into(), values_to_json(params));
                obj.insert("id".into(), json!(id));
                if let Some(seed) = random_seed {
                    obj.insert("randomSeed".into(), json!(seed));
                }
            }
            DdpMessage::Result { id, outcome } => {
                obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(Some(result)) => {
                        obj.insert("result".into(), to_json_value(result));
                    }
                    Ok(None) => {}
                    Err(error) => {
                        obj.insert("error".into(), error.to_json());
                    }
                }
            }
            DdpMessage::Updated { methods } => {
                obj.insert("methods".into(), json!(methods));
            }
            DdpMessage::Error { reason, offending_message } => {
                obj.insert("reason".into(), json!(reason));
                if let Some(offending) = offending_message {
                    obj.insert("offendingMessage".into(), offending.clone());
                }
            }
        }
        Ok(serde_json::Value::Object(obj))
    }

    /// Serialize to the text sent in one frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&self.to_json()?).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse one frame.
    pub fn decode(text: &str, registry: &TypeRegistry) -> Result<Self, ProtocolError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::from_json(&json, registry)
    }

    pub fn from_json(json: &serde_json::Value, registry: &TypeRegistry) -> Result<Self, ProtocolError> {
        let obj = json.as_object().ok_or(ProtocolError::MissingField("msg"))?;
        let kind = str_field(obj, "msg")?;
        let ejson = |v: &serde_json::Value| {
            from_json_value(v, registry).map_err(|e| ProtocolError::Deserialization(e.to_string()))
        };

        let message = match kind.as_str() {
            "connect" => DdpMessage::Connect {
                version: str_field(obj, "version")?,
                support: string_list(obj, "support")?,
                session: opt_str(obj, "session")?,
            },
            "connected" => DdpMessage::Connected { session: str_field(obj, "session")? },
            "failed" => DdpMessage::Failed { version: str_field(obj, "version")? },
            "ping" => DdpMessage::Ping { id: opt_str(obj, "id")? },
            "pong" => DdpMessage::Pong { id: opt_str(obj, "id")? },
            "sub" => DdpMessage::Sub {
                id: str_field(obj, "id")?,
                name: str_field(obj, "name")?,
                params: value_list(obj, "params", &ejson)?,
            },
            "unsub" => DdpMessage::Unsub { id: str_field(obj, "id")? },
            "nosub" => DdpMessage::Nosub {
                id: str_field(obj, "id")?,
                error: obj.get("error").map(|e| MethodError::from_json(e, registry)),
            },
            "added" => {
                let fields = match obj.get("fields") {
                    Some(f) => match ejson(f)? {
                        Value::Object(doc) => doc,
                        _ => return Err(ProtocolError::MissingField("fields")),
                    },
                    None => Document::new(),
                };
                DdpMessage::Added {
                    collection: str_field(obj, "collection")?,
                    id: parse_id(obj)?,
                    fields,
                }
            }
            "changed" => {
                let mut fields = ChangedFields::new();
                if let Some(set) = obj.get("fields") {
                    let set = set.as_object().ok_or(ProtocolError::MissingField("fields"))?;
                    for (key, value) in set {
                        fields.insert(key.clone(), Some(ejson(value)?));
                    }
                }
                for key in opt_string_list(obj, "cleared")? {
                    fields.insert(key, None);
                }
                DdpMessage::Changed {
                    collection: str_field(obj, "collection")?,
                    id: parse_id(obj)?,
                    fields,
                }
            }
            "removed" => DdpMessage::Removed {
                collection: str_field(obj, "collection")?,
                id: parse_id(obj)?,
            },
            "ready" => DdpMessage::Ready { subs: string_list(obj, "subs")? },
            "method" => DdpMessage::Method {
                id: str_field(obj, "id")?,
                method: str_field(obj, "method")?,
                params: value_list(obj, "params", &ejson)?,
                random_seed: opt_str(obj, "randomSeed")?,
            },
            "result" => {
                let outcome = match (obj.get("error"), obj.get("result")) {
                    (Some(error), _) => Err(MethodError::from_json(error, registry)),
                    (None, Some(result)) => Ok(Some(ejson(result)?)),
                    (None, None) => Ok(None),
                };
                DdpMessage::Result { id: str_field(obj, "id")?, outcome }
            }
            "updated" => DdpMessage::Updated { methods: string_list(obj, "methods")? },
            "error" => DdpMessage::Error {
                reason: opt_str(obj, "reason")?.unwrap_or_default(),
                offending_message: obj.get("offendingMessage").cloned(),
            },
            other => return Err(ProtocolError::UnknownMessage(other.to_string())),
        };
        Ok(message)
    }
}

fn wire_id(id: &Value) -> Result<String, ProtocolError> {
    id_stringify(id).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn parse_id(obj: &Map<String, serde_json::Value>) -> Result<Value, ProtocolError> {
    let raw = str_field(obj, "id")?;
    id_parse(&raw).map_err(|_| ProtocolError::MissingField("id"))
}

fn values_to_json(values: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(values.iter().map(to_json_value).collect())
}

fn str_field(obj: &Map<String, serde_json::Value>, key: &'static str) -> Result<String, ProtocolError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField(key))
}

fn opt_str(obj: &Map<String, serde_json::Value>, key: &'static str) -> Result<Option<String>, ProtocolError> {
    match obj.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::MissingField(key)),
    }
}

fn string_list(obj: &Map<String, serde_json::Value>, key: &'static str) -> Result<Vec<String>, ProtocolError> {
    let items = obj.get(key).and_then(|v| v.as_array()).ok_or(ProtocolError::MissingField(key))?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or(ProtocolError::MissingField(key)))
        .collect()
}

fn opt_string_list(obj: &Map<String, serde_json::Value>, key: &'static str) -> Result<Vec<String>, ProtocolError> {
    if obj.contains_key(key) {
        string_list(obj, key)
    } else {
        Ok(Vec::new())
    }
}

fn value_list(
    obj: &Map<String, serde_json::Value>,
    key: &'static str,
    ejson: &impl Fn(&serde_json::Value) -> Result<Value, ProtocolError>,
) -> Result<Vec<Value>, ProtocolError> {
    match obj.get(key) {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items.iter().map(ejson).collect(),
        Some(_) => Err(ProtocolError::MissingField(key)),
    }
}

/// Version the server should propose when a client asked for something it
/// cannot speak: the first client-supported version the server also
/// supports, otherwise the server's favourite.
pub fn negotiate_version(client_supported: &[String], server_supported: &[String]) -> String {
    client_supported
        .iter()
        .find(|v| server_supported.contains(v))
        .or_else(|| server_supported.first())
        .cloned()
        .unwrap_or_else(|| SUPPORTED_VERSIONS[0].to_string())
}
