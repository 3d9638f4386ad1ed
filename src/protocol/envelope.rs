//! The envelope: `{ "type": ..., "data": {...}, "correlationId": ... }`

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::MessageType;
use crate::error::{Error, Result};

/// Key under which servers that nest the echo inside `data` place the correlation id
const NESTED_CORRELATION_KEY: &str = "correlationId";

/// Immutable message unit exchanged over the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,

    data: Value,

    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

/// Frame shape before the `type` tag is checked against [`MessageType`]
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    data: Option<Value>,

    #[serde(rename = "correlationId", default)]
    correlation_id: Option<String>,
}

impl Envelope {
    /// Build an envelope from any serializable payload
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self> {
        Ok(Self::with_data(kind, serde_json::to_value(payload)?))
    }

    /// Build an envelope from raw JSON data (`null` becomes `{}`)
    pub fn with_data(kind: MessageType, data: Value) -> Self {
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };
        Self {
            kind,
            data,
            correlation_id: None,
        }
    }

    /// Envelope with an empty `data` object
    pub fn empty(kind: MessageType) -> Self {
        Self::with_data(kind, Value::Null)
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Decode `data` into a typed payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::malformed(format!("'{}' payload: {}", self.kind, e))
        })
    }

    /// String field of `data`, if present
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// `data.groupId`, if present
    pub fn group_id(&self) -> Option<&str> {
        self.data_str("groupId")
    }

    /// Consume the envelope, keeping only its data
    pub fn into_data(self) -> Value {
        self.data
    }

    // ─────────────────────────────────────────────────────────────
    // Wire Format
    // ─────────────────────────────────────────────────────────────

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    ///
    /// Fails with [`Error::UnknownMessageType`] when the frame is well formed
    /// but its `type` is outside the known set.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| Error::malformed(e.to_string()))?;
        let kind: MessageType = raw.kind.parse()?;

        let data = raw.data.unwrap_or(Value::Null);
        let correlation_id = raw.correlation_id.or_else(|| {
            data.get(NESTED_CORRELATION_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let mut envelope = Self::with_data(kind, data);
        envelope.correlation_id = correlation_id;
        Ok(envelope)
    }
}
