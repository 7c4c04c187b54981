//! Crate-level error types for command execution, queries, and the
//! post-commit fault channel.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;

/// Error type returned by projection folds and saga handlers.
///
/// Handlers are user code; any error type can be boxed into this alias.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Domain-level rejection raised by a command handler.
///
/// A rejected command appends nothing. The reason is forwarded verbatim
/// to the caller of [`Engine::execute`](crate::Engine::execute).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("command rejected: {reason}")]
pub struct CommandRejected {
    /// Human-readable reason (e.g. "entity already exists").
    pub reason: String,
}

impl CommandRejected {
    /// Build a rejection from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Error returned by the engine's entry points.
///
/// Variants before [`Persistence`](EngineError::Persistence) are raised
/// before anything is written and carry no side effects.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The command is malformed (missing type or aggregate id).
    #[error("invalid command: {0}")]
    Validation(String),

    /// No handler is registered for the command type.
    #[error("no handler registered for command type `{0}`")]
    UnhandledCommand(String),

    /// The handler rejected the command on domain grounds.
    #[error(transparent)]
    Rejected(#[from] CommandRejected),

    /// The stream advanced past the version the caller expected.
    ///
    /// The caller should reload state and retry.
    #[error(
        "concurrency conflict on stream `{stream_id}`: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Stream the command targeted.
        stream_id: String,
        /// Version the caller expected the stream to be at.
        expected: u64,
        /// Version the stream is actually at.
        actual: u64,
    },

    /// Disk I/O failure while appending or reading.
    #[error("I/O error: {0}")]
    Persistence(#[from] io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An on-disk event log violates the version sequence.
    #[error("corrupt event log for stream `{stream_id}`: {reason}")]
    Corruption {
        /// Stream whose log is corrupt.
        stream_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Events needed to rebuild state were removed by retention and no
    /// usable snapshot covers them.
    #[error("history of stream `{stream_id}` before version {first_available} has been compacted")]
    MissingHistory {
        /// Stream whose history is incomplete.
        stream_id: String,
        /// Oldest version still on disk.
        first_available: u64,
    },

    /// No projection is registered under the given name.
    #[error("projection `{0}` is not registered")]
    ProjectionNotFound(String),

    /// A saga-triggered command exceeded the configured cascade depth.
    #[error("cascade depth {depth} exceeds the configured limit of {limit}")]
    CascadeLimitExceeded {
        /// Depth of the offending command.
        depth: u32,
        /// Configured `max_cascade_depth`.
        limit: u32,
    },

    /// The caller-supplied deadline expired before the append began.
    #[error("command timed out after {0:?}; nothing was committed")]
    Timeout(Duration),

    /// The command handler panicked.
    #[error("command handler failed: {0}")]
    HandlerFailed(String),

    /// Compaction was asked to drop events not covered by a snapshot.
    #[error(
        "retention would remove version {requested} of stream `{stream_id}` but the latest snapshot is at {snapshot_version}"
    )]
    RetentionViolation {
        /// Stream being compacted.
        stream_id: String,
        /// Highest version compaction was asked to remove.
        requested: u64,
        /// Version of the latest snapshot (0 when there is none).
        snapshot_version: u64,
    },

    /// Invalid engine configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A failure that happened after events were committed.
///
/// Faults never roll back the write. They are logged and published on the
/// channel returned by [`Engine::subscribe_faults`](crate::Engine::subscribe_faults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum Fault {
    /// A projection fold returned an error for one event.
    #[error("projection `{projection}` failed to fold event {event_id}: {error}")]
    ProjectionFold {
        /// Projection name.
        projection: String,
        /// Event that failed to fold.
        event_id: Uuid,
        /// Handler error message.
        error: String,
    },

    /// A saga handler returned an error for one event.
    #[error("saga `{saga}` failed on event {event_id}: {error}")]
    Saga {
        /// Saga name.
        saga: String,
        /// Event the handler failed on.
        event_id: Uuid,
        /// Handler error message.
        error: String,
    },

    /// A projection or saga checkpoint could not be saved.
    ///
    /// Progress is kept in memory and written with the next checkpoint.
    /// Commands the saga emitted are still executed.
    #[error("{subscriber} `{name}` checkpoint was not saved: {error}")]
    Checkpoint {
        /// `"projection"` or `"saga"`.
        subscriber: String,
        /// Projection or saga name.
        name: String,
        /// I/O error message.
        error: String,
    },

    /// A command emitted by a saga failed.
    #[error("saga `{saga}` command {command_id} ({command_type}) failed: {error}")]
    Cascade {
        /// Saga that emitted the command.
        saga: String,
        /// Failed command id.
        command_id: Uuid,
        /// Failed command type.
        command_type: String,
        /// Error message.
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_displays_reason() {
        let err = EngineError::from(CommandRejected::new("entity already exists"));
        assert_eq!(err.to_string(), "command rejected: entity already exists");
    }

    #[test]
    fn conflict_display_names_both_versions() {
        let err = EngineError::ConcurrencyConflict {
            stream_id: "A1".to_string(),
            expected: 2,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("`A1`"));
        assert!(msg.contains("expected version 2"));
        assert!(msg.contains("found 5"));
    }

    #[test]
    fn io_error_converts_to_persistence() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = EngineError::from(io_err);
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn fault_serializes_with_variant_tag() {
        let fault = Fault::Saga {
            saga: "welcome".to_string(),
            event_id: Uuid::nil(),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&fault).expect("serialize should succeed");
        assert_eq!(json["Saga"]["saga"], "welcome");
    }

    // Errors cross task boundaries (spawn_blocking, broadcast), so they
    // must stay `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<EngineError>();
            assert_send_sync::<Fault>();
        }
    };
}
