//! Commands, their metadata, and execution results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{EventMetadata, StoredEvent, now_millis};

/// Cross-cutting metadata passed alongside a command.
///
/// Carries the causation chain and correlation id into the resulting
/// events without polluting the payload.
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::CommandMetadata;
///
/// let meta = CommandMetadata::default()
///     .with_correlation_id("req-abc-123")
///     .with_causation_id("http-request-9");
///
/// assert_eq!(meta.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(meta.cascade_depth, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// What caused this command.
    pub causation_id: Option<String>,
    /// Correlation id for tracing a workflow across aggregates.
    pub correlation_id: Option<String>,
    /// Issue time (Unix epoch milliseconds). Filled in on execution when 0.
    pub timestamp: u64,
    /// Saga cascade depth; root commands are at 0.
    #[serde(default)]
    pub cascade_depth: u32,
}

impl CommandMetadata {
    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// A request to change one aggregate.
///
/// Commands are never persisted; their id is carried into every event
/// they produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command id (UUID v4).
    pub id: Uuid,
    /// Command type, used to resolve the handler (e.g. `"CreateEntity"`).
    pub command_type: String,
    /// Target aggregate; also the stream id.
    pub aggregate_id: String,
    /// Command payload.
    pub payload: Value,
    /// When set, the command fails with a concurrency conflict unless the
    /// stream is exactly at this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    /// Causation, correlation and cascade metadata.
    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl Command {
    /// Build a command with a fresh id and default metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_cqrs::Command;
    /// use serde_json::json;
    ///
    /// let cmd = Command::new("CreateEntity", "A1", json!({ "name": "x" }))
    ///     .with_expected_version(0);
    /// assert_eq!(cmd.aggregate_id, "A1");
    /// assert_eq!(cmd.expected_version, Some(0));
    /// ```
    pub fn new(
        command_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type: command_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            expected_version: None,
            metadata: CommandMetadata::default(),
        }
    }

    /// Require the stream to be at `version` when the command runs.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(id.into());
        self
    }

    /// Stamp this command as a reaction to `event`.
    ///
    /// The event becomes the cause, the correlation id is inherited unless
    /// one is already set, and the cascade depth is one deeper than the
    /// command that produced the event.
    pub(crate) fn caused_by(mut self, event: &StoredEvent, correlation_key: &str) -> Self {
        self.metadata.causation_id = Some(event.event_id.to_string());
        if self.metadata.correlation_id.is_none() {
            self.metadata.correlation_id = Some(correlation_key.to_owned());
        }
        self.metadata.cascade_depth = event.metadata.cascade_depth.saturating_add(1);
        self
    }

    /// Metadata stamped on every event this command produces.
    pub(crate) fn event_metadata(&self) -> EventMetadata {
        EventMetadata {
            command_id: self.id,
            timestamp: now_millis(),
            causation_id: self.metadata.causation_id.clone(),
            correlation_id: self.metadata.correlation_id.clone(),
            cascade_depth: self.metadata.cascade_depth,
        }
    }
}

/// Outcome of a successful [`Engine::execute`](crate::Engine::execute).
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Id of the executed command.
    pub command_id: Uuid,
    /// Events appended by this command (empty for no-op commands).
    pub events: Vec<StoredEvent>,
    /// Stream version after the append.
    pub new_version: u64,
    /// What happened to the saga commands this command triggered.
    pub cascade: CascadeReport,
}

/// Summary of saga-triggered command execution.
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    /// Number of cascaded commands that committed.
    pub executed: usize,
    /// Cascaded commands that failed; each was also dead-lettered.
    pub failures: Vec<CascadeFailure>,
}

/// A saga-triggered command that did not commit.
#[derive(Debug, Clone)]
pub struct CascadeFailure {
    /// Saga that emitted the command.
    pub saga: String,
    /// The failed command.
    pub command: Command,
    /// Why it failed.
    pub error: String,
    /// `true` when the failure was the cascade depth guard.
    pub limit_exceeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_at_depth(depth: u32, correlation: Option<&str>) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            stream_id: "A1".to_string(),
            version: 1,
            global_position: 0,
            event_type: "EntityCreated".to_string(),
            data: json!({}),
            metadata: EventMetadata {
                command_id: Uuid::new_v4(),
                timestamp: 0,
                causation_id: None,
                correlation_id: correlation.map(str::to_string),
                cascade_depth: depth,
            },
        }
    }

    #[test]
    fn new_command_has_unique_id_and_root_depth() {
        let a = Command::new("CreateEntity", "A1", json!({}));
        let b = Command::new("CreateEntity", "A1", json!({}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.metadata.cascade_depth, 0);
        assert_eq!(a.expected_version, None);
    }

    #[test]
    fn caused_by_links_event_and_deepens_cascade() {
        let event = event_at_depth(3, None);
        let cmd = Command::new("UpdateEntity", "B2", json!({})).caused_by(&event, "A1");
        let expected_cause = event.event_id.to_string();
        assert_eq!(
            cmd.metadata.causation_id.as_deref(),
            Some(expected_cause.as_str())
        );
        assert_eq!(cmd.metadata.correlation_id.as_deref(), Some("A1"));
        assert_eq!(cmd.metadata.cascade_depth, 4);
    }

    #[test]
    fn caused_by_keeps_explicit_correlation() {
        let event = event_at_depth(0, Some("flow-1"));
        let cmd = Command::new("UpdateEntity", "B2", json!({}))
            .with_correlation_id("mine")
            .caused_by(&event, "flow-1");
        assert_eq!(cmd.metadata.correlation_id.as_deref(), Some("mine"));
    }

    #[test]
    fn event_metadata_carries_command_identity() {
        let cmd = Command::new("CreateEntity", "A1", json!({}))
            .with_correlation_id("c1")
            .with_causation_id("req-1");
        let meta = cmd.event_metadata();
        assert_eq!(meta.command_id, cmd.id);
        assert_eq!(meta.correlation_id.as_deref(), Some("c1"));
        assert_eq!(meta.causation_id.as_deref(), Some("req-1"));
        assert!(meta.timestamp > 0);
    }

    #[test]
    fn command_deserializes_without_optional_fields() {
        let cmd: Command = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "command_type": "CreateEntity",
            "aggregate_id": "A1",
            "payload": { "name": "x" }
        }))
        .expect("deserialize should succeed");
        assert_eq!(cmd.metadata, CommandMetadata::default());
        assert_eq!(cmd.expected_version, None);
    }
}
