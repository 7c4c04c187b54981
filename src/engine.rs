//! The engine facade and its builder.
//!
//! [`EngineBuilder`] collects handlers, projections, sagas and settings;
//! [`EngineBuilder::open`] recovers the store, loads checkpoints and
//! catches every subscriber up. The resulting [`Engine`] is cheap to
//! clone and safe to share across tasks.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::aggregate::{AggregateState, StateReducer};
use crate::command::{CascadeReport, Command};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{CommandRejected, EngineError, Fault};
use crate::event::{NewEvent, StoredEvent};
use crate::pipeline::StreamLocks;
use crate::projection::{ProjectionDefinition, ProjectionEngine, ProjectionState};
use crate::query::{ProjectionQuery, QueryResult};
use crate::registry::Registry;
use crate::saga::{DeadLetter, SagaCheckpoint, SagaDefinition, SagaEngine};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::storage::StorageLayout;
use crate::store::EventStore;

/// Raw events of one stream plus its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamView {
    pub events: Vec<StoredEvent>,
    pub current_version: u64,
}

/// Outcome of a deterministic state replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    /// Folded state.
    pub state: Value,
    /// Version the state was folded to.
    pub version: u64,
    /// Events folded (excluding any a snapshot already covered).
    pub events_replayed: usize,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Registry,
    pub(crate) store: Arc<EventStore>,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) projections: ProjectionEngine,
    pub(crate) sagas: SagaEngine,
    pub(crate) locks: StreamLocks,
    /// Serializes delivery so subscribers see events in commit order.
    delivery: Mutex<()>,
    faults: broadcast::Sender<Fault>,
}

/// An embedded event-sourcing engine.
///
/// `Clone` is cheap: all state is behind an `Arc`.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.inner.config.base_dir)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Returns the configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to post-commit faults.
    ///
    /// Only faults raised after subscribing are received. Slow receivers
    /// lose the oldest faults once `fault_channel_capacity` is exceeded.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<Fault> {
        self.inner.faults.subscribe()
    }

    pub(crate) fn publish(&self, fault: Fault) {
        // No receivers is fine; faults are also logged where raised.
        let _ = self.inner.faults.send(fault);
    }

    /// Fold every unprocessed event into projections and sagas.
    ///
    /// Returns the commands sagas emitted, in event order.
    pub(crate) fn deliver(&self) -> VecDeque<(String, Command)> {
        let _delivery = self
            .inner
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let faults = self.inner.projections.catch_up(&self.inner.store);
        faults.into_iter().for_each(|f| self.publish(f));
        let batch = self.inner.sagas.catch_up(&self.inner.store);
        batch.faults.into_iter().for_each(|f| self.publish(f));
        batch.commands.into()
    }

    /// Run storage work on the blocking pool and wait for it.
    ///
    /// Appends, fsyncs, checkpoint and snapshot writes all go through
    /// here so they never stall a runtime worker. The work runs to
    /// completion even if the caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns the work's own error, or [`EngineError::Persistence`] if the
    /// task panicked.
    pub(crate) async fn blocking<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || work(&engine))
            .await
            .map_err(|e| {
                EngineError::Persistence(io::Error::other(format!("storage task failed: {e}")))
            })?
    }

    /// Deliver any events subscribers have not seen and run the commands
    /// sagas emit for them.
    ///
    /// [`EngineBuilder::open`] calls this once; it is only needed again
    /// after events were appended outside [`execute`](Engine::execute).
    pub async fn catch_up(&self) -> CascadeReport {
        let queue = self
            .blocking(|engine| Ok(engine.deliver()))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "delivery failed");
                VecDeque::new()
            });
        self.run_cascade(queue).await
    }

    /// Read a projection with filtering, sorting and pagination.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name.
    pub fn query_projection(
        &self,
        name: &str,
        query: &ProjectionQuery,
    ) -> Result<QueryResult, EngineError> {
        self.inner.projections.query(name, query)
    }

    /// Full state of a projection, including its cursor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name.
    pub fn projection_state(&self, name: &str) -> Result<ProjectionState, EngineError> {
        self.inner.projections.state(name)
    }

    /// Reset a projection and replay the whole log into it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name and
    /// [`EngineError::MissingHistory`] once retention has compacted events.
    pub fn rebuild_projection(&self, name: &str) -> Result<(), EngineError> {
        let _delivery = self
            .inner
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let faults = self.inner.projections.rebuild(name, &self.inner.store)?;
        faults.into_iter().for_each(|f| self.publish(f));
        Ok(())
    }

    /// Events with `from_version < version <= to_version` of one stream.
    pub fn event_stream(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> EventStreamView {
        EventStreamView {
            events: self
                .inner
                .store
                .read_stream(stream_id, from_version, to_version),
            current_version: self.inner.store.current_version(stream_id),
        }
    }

    /// Rebuild a stream's state deterministically.
    ///
    /// Without `from_version` the latest snapshot is used as a base. With
    /// `from_version = Some(v)` no snapshot is used and only events after
    /// `v` are folded, starting from empty state; `Some(0)` forces a full
    /// replay.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingHistory`] when the events needed were
    /// compacted away.
    pub fn replay_events(
        &self,
        stream_id: &str,
        from_version: Option<u64>,
    ) -> Result<Replay, EngineError> {
        let snapshots = &self.inner.snapshots;
        let loaded = match from_version {
            None => snapshots.load_state(stream_id, None)?,
            Some(v) => snapshots.load_from(stream_id, v)?,
        };
        let state = snapshots.fold(stream_id, &loaded);
        tracing::debug!(
            stream_id,
            version = state.version,
            events_replayed = loaded.events.len(),
            from_snapshot = loaded.snapshot.is_some(),
            "stream replayed"
        );
        Ok(Replay {
            state: state.data,
            version: state.version,
            events_replayed: loaded.events.len(),
        })
    }

    /// Current state of an aggregate, as a handler would see it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingHistory`] if the state cannot be
    /// rebuilt.
    pub fn aggregate_state(&self, stream_id: &str) -> Result<AggregateState, EngineError> {
        self.inner.snapshots.state(stream_id, None)
    }

    /// Snapshot a stream now, regardless of the frequency.
    ///
    /// Returns `None` for a stream with no events.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the snapshot cannot be
    /// written.
    pub fn create_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, EngineError> {
        self.inner.snapshots.create_snapshot(stream_id)
    }

    /// Latest snapshot of a stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] for I/O failures.
    pub fn snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, EngineError> {
        self.inner.snapshots.latest(stream_id)
    }

    /// All stream ids, sorted.
    pub fn list_streams(&self) -> Vec<String> {
        self.inner.store.list_streams()
    }

    /// Look up a stored event by id.
    pub fn event(&self, event_id: uuid::Uuid) -> Option<StoredEvent> {
        self.inner.store.event_by_id(event_id)
    }

    /// State of a live saga instance.
    pub fn saga_instance(&self, saga: &str, correlation_id: &str) -> Option<Value> {
        self.inner.sagas.instance(saga, correlation_id)
    }

    /// A saga's live instances and cursor.
    ///
    /// # Returns
    ///
    /// `None` if no saga is registered under `saga`.
    pub fn saga_checkpoint(&self, saga: &str) -> Option<SagaCheckpoint> {
        self.inner.sagas.checkpoint(saga)
    }

    /// Failed saga commands recorded for `saga`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the log cannot be read.
    pub fn dead_letters(&self, saga: &str) -> Result<Vec<DeadLetter>, EngineError> {
        self.inner.sagas.dead_letters(saga)
    }
}

/// Builder for [`Engine`].
///
/// Registration happens here, before the engine opens; the resulting
/// registry is immutable.
///
/// # Examples
///
/// ```no_run
/// use eventfold_cqrs::{Command, EngineBuilder, NewEvent};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), eventfold_cqrs::EngineError> {
/// let engine = EngineBuilder::new("/tmp/my-app")
///     .snapshot_frequency(50)
///     .command_handler("CreateEntity", |cmd, state| {
///         if !state.is_new() {
///             return Err(eventfold_cqrs::CommandRejected::new("entity already exists"));
///         }
///         Ok(vec![NewEvent::new("EntityCreated", cmd.payload.clone())])
///     })
///     .open()
///     .await?;
///
/// let result = engine
///     .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
///     .await?;
/// assert_eq!(result.new_version, 1);
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Registry,
    error: Option<ConfigError>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl EngineBuilder {
    /// Start from the default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(EngineConfig::new(base_dir))
    }

    /// Start from an existing configuration (e.g. [`EngineConfig::from_env`]).
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Registry::default(),
            error: None,
        }
    }

    /// Events between automatic snapshots. `0` disables them.
    pub fn snapshot_frequency(mut self, frequency: u64) -> Self {
        self.config.snapshot_frequency = frequency;
        self
    }

    /// Deepest saga cascade a command may sit at.
    pub fn max_cascade_depth(mut self, depth: u32) -> Self {
        self.config.max_cascade_depth = depth;
        self
    }

    /// Enable retention: events older than `age` that a snapshot covers
    /// may be compacted.
    pub fn max_event_age(mut self, age: Duration) -> Self {
        self.config.max_event_age = Some(age);
        self
    }

    /// How often [`Engine::spawn_retention`] runs.
    pub fn retention_interval(mut self, interval: Duration) -> Self {
        self.config.retention_interval = interval;
        self
    }

    /// Replace the default [`merge_reducer`](crate::merge_reducer).
    pub fn state_reducer<F>(mut self, reducer: F) -> Self
    where
        F: Fn(Value, &StoredEvent) -> Value + Send + Sync + 'static,
    {
        let reducer: StateReducer = Arc::new(reducer);
        self.registry.set_reducer(reducer);
        self
    }

    /// Register the handler for `command_type`.
    ///
    /// Registering a type twice makes [`open`](EngineBuilder::open) fail.
    pub fn command_handler<F>(mut self, command_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Command, &AggregateState) -> Result<Vec<NewEvent>, CommandRejected>
            + Send
            + Sync
            + 'static,
    {
        let result = self
            .registry
            .register_handler(command_type, Arc::new(handler));
        self.record(result)
    }

    /// Register a projection. Names must be unique.
    pub fn projection(mut self, definition: ProjectionDefinition) -> Self {
        let result = self.registry.register_projection(definition);
        self.record(result)
    }

    /// Register a saga. Names must be unique.
    pub fn saga(mut self, definition: SagaDefinition) -> Self {
        let result = self.registry.register_saga(definition);
        self.record(result)
    }

    fn record(mut self, result: Result<(), ConfigError>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Recover the store and open the engine.
    ///
    /// Loads projection and saga checkpoints, delivers any events they
    /// have not seen, and runs the saga commands that produces.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for invalid settings or duplicate
    /// registrations, and [`EngineError::Persistence`] or
    /// [`EngineError::Corruption`] if recovery fails.
    pub async fn open(self) -> Result<Engine, EngineError> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        self.config.validate()?;

        let layout = StorageLayout::new(&self.config.base_dir);
        let store = Arc::new(EventStore::open(layout.clone())?);
        let snapshots = SnapshotManager::new(
            layout.clone(),
            Arc::clone(&store),
            Arc::clone(self.registry.reducer()),
            self.config.snapshot_frequency,
        );
        let projections = ProjectionEngine::open(&layout, self.registry.projections())?;
        let sagas = SagaEngine::open(&layout, self.registry.sagas())?;
        let (faults, _) = broadcast::channel(self.config.fault_channel_capacity);

        tracing::info!(
            base_dir = %self.config.base_dir.display(),
            projections = projections.names().len(),
            sagas = sagas.names().len(),
            "engine opened"
        );

        let engine = Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry: self.registry,
                store,
                snapshots,
                projections,
                sagas,
                locks: StreamLocks::default(),
                delivery: Mutex::new(()),
                faults,
            }),
        };

        let report = engine.catch_up().await;
        if report.executed > 0 || !report.failures.is_empty() {
            tracing::info!(
                executed = report.executed,
                failed = report.failures.len(),
                "ran saga commands left over from the previous run"
            );
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_handler(
        cmd: &Command,
        state: &AggregateState,
    ) -> Result<Vec<NewEvent>, CommandRejected> {
        if !state.is_new() {
            return Err(CommandRejected::new("entity already exists"));
        }
        Ok(vec![NewEvent::new("EntityCreated", cmd.payload.clone())])
    }

    #[tokio::test]
    async fn duplicate_registration_fails_open() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let err = EngineBuilder::new(tmp.path())
            .command_handler("CreateEntity", create_handler)
            .command_handler("CreateEntity", create_handler)
            .open()
            .await
            .expect_err("duplicate handler should fail");
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_config_fails_open() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let err = EngineBuilder::new(tmp.path())
            .snapshot_frequency(0)
            .max_event_age(Duration::from_secs(60))
            .open()
            .await
            .expect_err("retention without snapshots should fail");
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::RetentionWithoutSnapshots)
        ));
    }

    #[tokio::test]
    async fn replay_with_and_without_snapshot_agree() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = EngineBuilder::new(tmp.path())
            .command_handler("CreateEntity", create_handler)
            .command_handler("UpdateEntity", |cmd, _| {
                Ok(vec![NewEvent::new("EntityUpdated", cmd.payload.clone())])
            })
            .open()
            .await
            .expect("open should succeed");

        engine
            .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
            .await
            .expect("create should succeed");
        engine
            .execute(Command::new("UpdateEntity", "A1", json!({ "name": "y" })))
            .await
            .expect("update should succeed");
        engine.create_snapshot("A1").expect("snapshot should succeed");
        engine
            .execute(Command::new("UpdateEntity", "A1", json!({ "tag": 1 })))
            .await
            .expect("update should succeed");

        let fast = engine.replay_events("A1", None).expect("replay");
        let full = engine.replay_events("A1", Some(0)).expect("replay");
        assert_eq!(fast.state, full.state);
        assert_eq!(fast.version, 3);
        assert_eq!(fast.events_replayed, 1);
        assert_eq!(full.events_replayed, 3);
        assert_eq!(full.state, json!({ "name": "y", "tag": 1 }));

        let tail = engine.replay_events("A1", Some(2)).expect("replay");
        assert_eq!(tail.state, json!({ "tag": 1 }));
        assert_eq!(tail.events_replayed, 1);
    }

    #[tokio::test]
    async fn event_stream_reports_current_version() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = EngineBuilder::new(tmp.path())
            .command_handler("CreateEntity", create_handler)
            .open()
            .await
            .expect("open should succeed");
        let result = engine
            .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
            .await
            .expect("create should succeed");

        let view = engine.event_stream("A1", 0, None);
        assert_eq!(view.current_version, 1);
        assert_eq!(view.events, result.events);
        assert_eq!(engine.event(result.events[0].event_id), Some(view.events[0].clone()));

        let empty = engine.event_stream("missing", 0, None);
        assert!(empty.events.is_empty());
        assert_eq!(empty.current_version, 0);
    }
}
