//! Errors surfaced to method callers, subscription owners and clients.

use std::fmt;

use livedata_core::ejson::{from_json_value, to_json_value};
use livedata_core::{TypeRegistry, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// `error` field of a wire error: a numeric status or a string tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Name(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(n) => write!(f, "{n}"),
            ErrorCode::Name(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(n: i64) -> Self {
        ErrorCode::Number(n)
    }
}

impl From<i32> for ErrorCode {
    fn from(n: i32) -> Self {
        ErrorCode::Number(n.into())
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::Name(s.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        ErrorCode::Name(s)
    }
}

/// A client-safe structured error. Handlers return it to have its contents
/// delivered verbatim; any other error is reported as a generic 500.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodError {
    pub error: ErrorCode,
    pub reason: Option<String>,
    pub details: Option<Value>,
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{reason} [{}]", self.error),
            None => write!(f, "[{}]", self.error),
        }
    }
}

impl std::error::Error for MethodError {}

pub const ERROR_TYPE: &str = "Meteor.Error";

impl MethodError {
    pub fn new(error: impl Into<ErrorCode>, reason: impl Into<String>) -> Self {
        Self { error: error.into(), reason: Some(reason.into()), details: None }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn internal() -> Self {
        Self::new(500, "Internal server error")
    }

    pub fn too_many_requests(time_to_reset_ms: u64) -> Self {
        let seconds = time_to_reset_ms.div_ceil(1000);
        let mut details = livedata_core::Document::new();
        details.insert("timeToReset".into(), Value::from(time_to_reset_ms as f64));
        Self::new(
            "too-many-requests",
            format!(
                "Error, too many requests. Please slow down. You must wait {seconds} seconds before trying again."
            ),
        )
        .with_details(Value::Object(details))
    }

    pub fn connection_lost() -> Self {
        Self::new(
            "invocation-failed",
            "Method invocation might have failed due to dropped connection. \
             Failing because `no_retry` was set.",
        )
    }

    pub fn malformed(what: &str) -> Self {
        Self::new(400, format!("Malformed {what}"))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("isClientSafe".into(), json!(true));
        obj.insert("error".into(), json!(self.error));
        if let Some(reason) = &self.reason {
            obj.insert("reason".into(), json!(reason));
        }
        if let Some(details) = &self.details {
            obj.insert("details".into(), to_json_value(details));
        }
        obj.insert("message".into(), json!(self.to_string()));
        obj.insert("errorType".into(), json!(ERROR_TYPE));
        serde_json::Value::Object(obj)
    }

    pub fn from_json(json: &serde_json::Value, registry: &TypeRegistry) -> Self {
        let error = json
            .get("error")
            .and_then(|e| serde_json::from_value::<ErrorCode>(e.clone()).ok())
            .unwrap_or(ErrorCode::Number(500));
        let reason = json.get("reason").and_then(|r| r.as_str()).map(str::to_string);
        let details = json.get("details").and_then(|d| from_json_value(d, registry).ok());
        Self { error, reason, details }
    }

    /// `details.timeToReset` of a rate-limit error.
    pub fn time_to_reset(&self) -> Option<u64> {
        self.details.as_ref()?.get("timeToReset")?.as_f64().map(|ms| ms as u64)
    }
}

/// Boxed error returned by method and publish handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("DDP version negotiation failed: {0}")]
    ProtocolVersion(String),

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error("Subscription or call stopped before completing")]
    Stopped,

    #[error(transparent)]
    Store(#[from] livedata_core::Error),
}
