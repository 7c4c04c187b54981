//! Event types shared by the store, snapshots, projections and sagas.
//!
//! Handlers produce [`NewEvent`]s; the store stamps them with identity,
//! version, global position and metadata and hands back [`StoredEvent`]s.
//! No I/O occurs here.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wall-clock time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Traceability metadata stamped on every event of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Id of the command that produced the event.
    pub command_id: Uuid,
    /// Append time (Unix epoch milliseconds).
    pub timestamp: u64,
    /// What caused the command: an upstream event id for saga commands,
    /// or whatever the caller supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Correlation id shared by every command and event of one workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Saga cascade depth of the producing command (0 for root commands).
    #[serde(default)]
    pub cascade_depth: u32,
}

/// An event proposed by a command handler, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type tag (e.g. `"EntityCreated"`).
    pub event_type: String,
    /// Event payload.
    pub data: Value,
}

impl NewEvent {
    /// Build an event from a type tag and a JSON payload.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Encode a typed domain event.
    ///
    /// The event type must use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`). The `"type"` field
    /// becomes [`event_type`](NewEvent::event_type); the `"data"` field
    /// (absent for unit variants) becomes [`data`](NewEvent::data).
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the value does not serialize to an
    /// object with a string `"type"` field.
    pub fn from_domain<E: Serialize>(event: &E) -> serde_json::Result<Self> {
        let value = serde_json::to_value(event)?;
        let Value::Object(mut obj) = value else {
            return Err(serde_json::Error::custom(
                "domain event must serialize to a JSON object",
            ));
        };
        let event_type = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(serde_json::Error::custom(
                    "domain event must carry a string `type` tag",
                ));
            }
        };
        let data = obj.remove("data").unwrap_or(Value::Null);
        Ok(Self { event_type, data })
    }
}

/// A persisted, immutable event as delivered to projections and sagas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event id (UUID v4).
    pub event_id: Uuid,
    /// Owning stream (the aggregate id).
    pub stream_id: String,
    /// 1-based, contiguous version within the stream.
    pub version: u64,
    /// 0-based position in the engine-wide commit order.
    pub global_position: u64,
    /// Event type tag.
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// Traceability metadata.
    pub metadata: EventMetadata,
}

impl StoredEvent {
    /// Decode into a typed, adjacently tagged domain event.
    ///
    /// Returns `None` for unknown or malformed events so callers can skip
    /// them for forward compatibility.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = if self.data.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({ "type": self.event_type, "data": self.data })
        };
        serde_json::from_value(tagged).ok()
    }

    /// Key saga instances are correlated by: the correlation id when
    /// present, otherwise the stream id.
    pub fn correlation_key(&self) -> &str {
        self.metadata
            .correlation_id
            .as_deref()
            .unwrap_or(&self.stream_id)
    }
}
