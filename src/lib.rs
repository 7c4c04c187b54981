//! Embedded event sourcing and CQRS on local JSONL files.
//!
//! Commands are validated and decided against folded aggregate state, the
//! resulting events are appended to per-stream logs, and every committed
//! event is folded into named projections and delivered to sagas, whose
//! commands cascade back through the same pipeline.
//!
//! ```no_run
//! use eventfold_cqrs::{Command, EngineBuilder, NewEvent, ProjectionQuery};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), eventfold_cqrs::EngineError> {
//! let engine = EngineBuilder::new("./data")
//!     .command_handler("CreateEntity", |cmd, _state| {
//!         Ok(vec![NewEvent::new("EntityCreated", cmd.payload.clone())])
//!     })
//!     .open()
//!     .await?;
//!
//! let result = engine
//!     .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
//!     .await?;
//! assert_eq!(result.new_version, 1);
//! # let _ = ProjectionQuery::new();
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod command;
mod config;
mod engine;
mod error;
mod event;
mod pipeline;
mod projection;
mod query;
mod registry;
mod retention;
mod saga;
mod snapshot;
mod storage;
mod store;

pub use aggregate::{
    Aggregate, AggregateState, CommandHandler, StateReducer, handler, merge_reducer, reducer,
};
pub use command::{CascadeFailure, CascadeReport, Command, CommandMetadata, CommandResult};
pub use config::{ConfigError, DEFAULT_MAX_CASCADE_DEPTH, DEFAULT_SNAPSHOT_FREQUENCY, EngineConfig};
pub use engine::{Engine, EngineBuilder, EventStreamView, Replay};
pub use error::{CommandRejected, EngineError, Fault, HandlerError};
pub use event::{EventMetadata, NewEvent, StoredEvent};
pub use projection::{ProjectionDefinition, ProjectionState};
pub use query::{ProjectionQuery, QueryResult, SortKey, SortOrder};
pub use retention::{RetentionHandle, RetentionReport};
pub use saga::{DeadLetter, SagaCheckpoint, SagaDefinition, SagaOutcome};
pub use snapshot::Snapshot;
pub use storage::StorageLayout;
pub use store::EventStore;
