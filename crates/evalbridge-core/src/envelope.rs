//! The unit of exchange with the peer.
//!
//! An envelope is an object of string keys to JSON values. Two keys are
//! reserved: `_id` carries the correlation identifier and `message_type`
//! names the message. Everything else passes through untouched.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Correlation identifier linking a request envelope to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh identifier (UUID v4, 32 hex chars).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical message exchanged over the connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub const ID_KEY: &'static str = "_id";
    pub const TYPE_KEY: &'static str = "message_type";

    pub const TYPE_EVAL: &'static str = "eval";
    pub const TYPE_PING: &'static str = "ping";

    /// An empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// An envelope carrying only a message type.
    pub fn typed(message_type: impl Into<String>) -> Self {
        let mut envelope = Self::new();
        envelope.insert(Self::TYPE_KEY, Value::String(message_type.into()));
        envelope
    }

    /// `{message_type: "eval", code}`.
    pub fn eval(code: impl Into<String>) -> Self {
        let mut envelope = Self::typed(Self::TYPE_EVAL);
        envelope.insert("code", Value::String(code.into()));
        envelope
    }

    /// `{message_type: "ping"}`.
    pub fn ping() -> Self {
        Self::typed(Self::TYPE_PING)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build an envelope from an arbitrary JSON value.
    ///
    /// Anything other than an object is a `MalformedEnvelope`.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BridgeError::MalformedEnvelope {
                message: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| BridgeError::MalformedEnvelope {
                message: format!("invalid JSON: {}", e),
            })?;
        Self::from_value(value)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn has_id(&self) -> bool {
        self.contains_key(Self::ID_KEY)
    }

    /// Read the correlation identifier.
    ///
    /// `Ok(None)` means the envelope is unsolicited. An `_id` that is not a
    /// string is malformed.
    pub fn call_id(&self) -> Result<Option<CallId>> {
        match self.0.get(Self::ID_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(id)) => Ok(Some(CallId::from(id.as_str()))),
            Some(other) => Err(BridgeError::MalformedEnvelope {
                message: format!("{} must be a string, got {}", Self::ID_KEY, json_kind(other)),
            }),
        }
    }

    pub fn set_call_id(&mut self, id: &CallId) {
        self.insert(Self::ID_KEY, Value::String(id.as_str().to_string()));
    }

    pub fn message_type(&self) -> Option<&str> {
        self.0.get(Self::TYPE_KEY).and_then(Value::as_str)
    }

    /// The peer's `result` field, `Null` when absent.
    pub fn result(&self) -> Value {
        self.0.get("result").cloned().unwrap_or(Value::Null)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
