//! Sagas: correlated process state that reacts to events with commands.
//!
//! A saga is structurally similar to a projection: it consumes the global
//! log through a checkpointed cursor. Instead of a read model it keeps one
//! state per correlation id and emits [`Command`]s, which the engine runs
//! through its cascade queue. Commands that fail are appended to
//! `<base_dir>/sagas/<name>/dead_letters.jsonl`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Command;
use crate::error::{EngineError, Fault, HandlerError};
use crate::event::{StoredEvent, now_millis};
use crate::storage::{StorageLayout, append_json_line, read_json_lenient, write_json_atomic};
use crate::store::EventStore;

/// What a saga handler decided for one event.
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::{Command, SagaOutcome};
/// use serde_json::json;
///
/// let outcome = SagaOutcome::new()
///     .with_state(json!({ "step": "notified" }))
///     .dispatch(Command::new("UpdateEntity", "B2", json!({ "linked": true })));
/// assert_eq!(outcome.commands.len(), 1);
/// assert!(!outcome.completed);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaOutcome {
    /// New instance state. `None` keeps the current state.
    pub state: Option<Value>,
    /// Commands to execute, in order.
    pub commands: Vec<Command>,
    /// Discard the instance once this event is handled.
    pub completed: bool,
}

impl SagaOutcome {
    /// An outcome that keeps the state and emits nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance state with `state`.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    /// Queue `command` for execution after the current one.
    ///
    /// Correlation, causation and cascade depth are filled in by the engine.
    pub fn dispatch(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Mark the instance finished; its state is dropped after this event.
    pub fn complete(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// Saga handler for one event type: `(instance state, event) -> outcome`.
pub type SagaHandler =
    Arc<dyn Fn(&Value, &StoredEvent) -> Result<SagaOutcome, HandlerError> + Send + Sync>;

/// A named saga: initial instance state plus one handler per event type.
#[derive(Clone)]
pub struct SagaDefinition {
    name: String,
    initial: Value,
    handlers: HashMap<String, SagaHandler>,
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut event_types: Vec<&String> = self.handlers.keys().collect();
        event_types.sort();
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("event_types", &event_types)
            .finish()
    }
}

impl SagaDefinition {
    /// Create a saga with no handlers.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique saga name; also its checkpoint directory.
    /// * `initial` - State given to each new instance.
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            initial,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `event_type`, replacing any earlier one.
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value, &StoredEvent) -> Result<SagaOutcome, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Returns the saga name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if a handler is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

/// Persisted state of a saga: live instances plus the global cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaCheckpoint {
    /// Instance state keyed by correlation id.
    pub instances: BTreeMap<String, Value>,
    /// Next global position to process.
    pub position: u64,
}

/// A saga command that failed, as recorded in the dead-letter log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub saga: String,
    pub command: Command,
    pub error: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

/// Commands and faults produced by one delivery pass.
#[derive(Debug, Default)]
pub struct SagaBatch {
    /// `(saga name, command)` in event order.
    pub commands: Vec<(String, Command)>,
    pub faults: Vec<Fault>,
}

struct SagaRunner {
    definition: Arc<SagaDefinition>,
    checkpoint: SagaCheckpoint,
    dir: PathBuf,
}

impl SagaRunner {
    fn open(definition: Arc<SagaDefinition>, layout: &StorageLayout) -> io::Result<Self> {
        let dir = layout.saga_dir(definition.name());
        let checkpoint = read_json_lenient(&dir.join("checkpoint.json"), "saga checkpoint")?
            .unwrap_or_default();
        Ok(Self {
            definition,
            checkpoint,
            dir,
        })
    }

    /// Handle one event, advancing the cursor.
    ///
    /// Events below the cursor were already handled: skipping them keeps
    /// redelivery from firing the same commands twice.
    fn process(&mut self, event: &StoredEvent, batch: &mut SagaBatch) {
        if event.global_position < self.checkpoint.position {
            return;
        }
        self.checkpoint.position = event.global_position + 1;

        let Some(handler) = self.definition.handlers.get(&event.event_type) else {
            return;
        };
        let key = event.correlation_key();
        let state = self
            .checkpoint
            .instances
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.definition.initial.clone());

        let outcome = match handler(&state, event) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    saga = %self.definition.name,
                    event_id = %event.event_id,
                    correlation_id = key,
                    error = %e,
                    "saga handler failed, event skipped"
                );
                batch.faults.push(Fault::Saga {
                    saga: self.definition.name.clone(),
                    event_id: event.event_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        for command in outcome.commands {
            batch.commands.push((
                self.definition.name.clone(),
                command.caused_by(event, key),
            ));
        }
        if outcome.completed {
            self.checkpoint.instances.remove(key);
            tracing::debug!(saga = %self.definition.name, correlation_id = key, "saga completed");
        } else {
            self.checkpoint
                .instances
                .insert(key.to_owned(), outcome.state.unwrap_or(state));
        }
    }

    fn save(&self) -> io::Result<()> {
        write_json_atomic(&self.dir.join("checkpoint.json"), &self.checkpoint)
    }

    fn dead_letter_path(&self) -> PathBuf {
        self.dir.join("dead_letters.jsonl")
    }
}

/// All registered sagas.
pub struct SagaEngine {
    runners: Vec<Mutex<SagaRunner>>,
    names: Vec<String>,
}

impl fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaEngine")
            .field("sagas", &self.names)
            .finish()
    }
}

fn lock(runner: &Mutex<SagaRunner>) -> MutexGuard<'_, SagaRunner> {
    runner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SagaEngine {
    /// Load every saga's checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if a checkpoint cannot be read.
    pub fn open(
        layout: &StorageLayout,
        definitions: &[Arc<SagaDefinition>],
    ) -> Result<Self, EngineError> {
        let runners = definitions
            .iter()
            .map(|def| SagaRunner::open(Arc::clone(def), layout).map(Mutex::new))
            .collect::<io::Result<Vec<_>>>()?;
        let names = definitions.iter().map(|def| def.name.clone()).collect();
        Ok(Self { runners, names })
    }

    fn runner(&self, name: &str) -> Option<&Mutex<SagaRunner>> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.runners.get(i))
    }

    /// Registered saga names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Deliver every unprocessed event to every saga.
    ///
    /// Events are delivered in global order, each to all sagas in
    /// registration order, so emitted commands come out in the order their
    /// triggering events were committed. Checkpoints are saved before the
    /// commands are returned.
    ///
    /// A checkpoint that cannot be saved becomes a [`Fault::Checkpoint`] in
    /// the batch. The saga's commands are still returned and its progress
    /// is written with the next successful save.
    pub fn catch_up(&self, store: &EventStore) -> SagaBatch {
        let mut batch = SagaBatch::default();
        let mut runners: Vec<MutexGuard<'_, SagaRunner>> = self.runners.iter().map(lock).collect();
        let Some(from) = runners.iter().map(|r| r.checkpoint.position).min() else {
            return batch;
        };
        let events = store.events_since(from);
        if events.is_empty() {
            return batch;
        }

        let before: Vec<u64> = runners.iter().map(|r| r.checkpoint.position).collect();
        for event in &events {
            for runner in runners.iter_mut() {
                runner.process(event, &mut batch);
            }
        }
        for (runner, position) in runners.iter().zip(before) {
            if runner.checkpoint.position != position
                && let Err(e) = runner.save()
            {
                tracing::error!(
                    saga = %runner.definition.name,
                    position = runner.checkpoint.position,
                    error = %e,
                    "failed to save saga checkpoint"
                );
                batch.faults.push(Fault::Checkpoint {
                    subscriber: "saga".to_owned(),
                    name: runner.definition.name.clone(),
                    error: e.to_string(),
                });
            }
        }

        tracing::debug!(
            events = events.len(),
            commands = batch.commands.len(),
            "sagas caught up"
        );
        batch
    }

    /// State of one saga instance, if it is live.
    pub fn instance(&self, saga: &str, correlation_id: &str) -> Option<Value> {
        let runner = lock(self.runner(saga)?);
        runner.checkpoint.instances.get(correlation_id).cloned()
    }

    /// Snapshot of a saga's checkpoint.
    pub fn checkpoint(&self, saga: &str) -> Option<SagaCheckpoint> {
        Some(lock(self.runner(saga)?).checkpoint.clone())
    }

    /// Record a failed saga command.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the log cannot be written.
    pub fn dead_letter(&self, saga: &str, command: &Command, error: &str) -> io::Result<()> {
        let Some(runner) = self.runner(saga) else {
            return Ok(());
        };
        let path = lock(runner).dead_letter_path();
        let entry = DeadLetter {
            saga: saga.to_owned(),
            command: command.clone(),
            error: error.to_owned(),
            timestamp: now_millis(),
        };
        append_json_line(&path, &entry)
    }

    /// Every dead letter recorded for a saga, oldest first.
    ///
    /// Unreadable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] for I/O failures other than a
    /// missing log.
    pub fn dead_letters(&self, saga: &str) -> Result<Vec<DeadLetter>, EngineError> {
        let Some(runner) = self.runner(saga) else {
            return Ok(Vec::new());
        };
        let path = lock(runner).dead_letter_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(saga, error = %e, "skipping unreadable dead letter");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, NewEvent};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn meta(correlation: Option<&str>) -> EventMetadata {
        EventMetadata {
            command_id: Uuid::new_v4(),
            timestamp: 0,
            causation_id: None,
            correlation_id: correlation.map(str::to_string),
            cascade_depth: 0,
        }
    }

    /// Counts `Ping`s per correlation id, pongs on the second, and
    /// completes on `Done`.
    fn ping_saga() -> Arc<SagaDefinition> {
        Arc::new(
            SagaDefinition::new("pinger", json!({ "pings": 0 }))
                .on("Ping", |state, event| {
                    let pings = state["pings"].as_u64().unwrap_or(0) + 1;
                    let mut outcome = SagaOutcome::new().with_state(json!({ "pings": pings }));
                    if pings == 2 {
                        outcome = outcome.dispatch(Command::new(
                            "Pong",
                            format!("{}-reply", event.stream_id),
                            json!({}),
                        ));
                    }
                    Ok(outcome)
                })
                .on("Done", |_, _| Ok(SagaOutcome::new().complete()))
                .on("Broken", |_, _| Err("cannot handle".into())),
        )
    }

    fn setup() -> (TempDir, StorageLayout, EventStore) {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StorageLayout::new(tmp.path());
        let store = EventStore::open(layout.clone()).expect("open should succeed");
        (tmp, layout, store)
    }

    fn emit(store: &EventStore, stream: &str, event_type: &str, correlation: Option<&str>) {
        store
            .append(stream, vec![NewEvent::new(event_type, json!({}))], &meta(correlation))
            .expect("append should succeed");
    }

    #[test]
    fn instances_are_created_lazily_and_keyed_by_stream() {
        let (_tmp, layout, store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        emit(&store, "A1", "Unrelated", None);
        engine.catch_up(&store);
        assert!(engine.instance("pinger", "A1").is_none());

        emit(&store, "A1", "Ping", None);
        engine.catch_up(&store);
        assert_eq!(engine.instance("pinger", "A1"), Some(json!({ "pings": 1 })));
    }

    #[test]
    fn correlation_id_groups_events_across_streams() {
        let (_tmp, layout, store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        emit(&store, "A1", "Ping", Some("flow-1"));
        emit(&store, "B2", "Ping", Some("flow-1"));

        let batch = engine.catch_up(&store);
        assert_eq!(engine.instance("pinger", "flow-1"), Some(json!({ "pings": 2 })));
        assert_eq!(batch.commands.len(), 1);

        let (saga, command) = &batch.commands[0];
        assert_eq!(saga, "pinger");
        assert_eq!(command.aggregate_id, "B2-reply");
        assert_eq!(command.metadata.correlation_id.as_deref(), Some("flow-1"));
        assert_eq!(command.metadata.cascade_depth, 1);
    }

    #[test]
    fn completed_instances_are_discarded() {
        let (_tmp, layout, store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        emit(&store, "A1", "Ping", None);
        emit(&store, "A1", "Done", None);
        engine.catch_up(&store);
        assert!(engine.instance("pinger", "A1").is_none());
    }

    #[test]
    fn handler_error_is_a_fault() {
        let (_tmp, layout, store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        emit(&store, "A1", "Broken", None);
        emit(&store, "A1", "Ping", None);
        let batch = engine.catch_up(&store);
        assert!(matches!(&batch.faults[..], [Fault::Saga { saga, .. }] if saga == "pinger"));
        assert_eq!(engine.instance("pinger", "A1"), Some(json!({ "pings": 1 })));
    }

    #[test]
    fn reopened_saga_does_not_refire_commands() {
        let (_tmp, layout, store) = setup();
        {
            let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
            emit(&store, "A1", "Ping", None);
            emit(&store, "A1", "Ping", None);
            let batch = engine.catch_up(&store);
            assert_eq!(batch.commands.len(), 1);
        }
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("reopen");
        let batch = engine.catch_up(&store);
        assert!(batch.commands.is_empty());
        assert_eq!(
            engine.checkpoint("pinger").map(|c| c.position),
            Some(2)
        );
        assert_eq!(engine.instance("pinger", "A1"), Some(json!({ "pings": 2 })));
    }

    #[test]
    fn failed_checkpoint_still_returns_commands() {
        let (_tmp, layout, store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        let blocker = layout.saga_dir("pinger").join("checkpoint.json.tmp");
        fs::create_dir_all(&blocker).expect("block the temp file");

        emit(&store, "A1", "Ping", None);
        emit(&store, "A1", "Ping", None);
        let batch = engine.catch_up(&store);
        assert_eq!(batch.commands.len(), 1);
        assert_eq!(batch.commands[0].1.aggregate_id, "A1-reply");
        assert!(matches!(
            &batch.faults[..],
            [Fault::Checkpoint { subscriber, name, .. }]
                if subscriber == "saga" && name == "pinger"
        ));
        assert_eq!(engine.checkpoint("pinger").map(|c| c.position), Some(2));

        fs::remove_dir(&blocker).expect("unblock the temp file");
        emit(&store, "A1", "Ping", None);
        let batch = engine.catch_up(&store);
        assert!(batch.faults.is_empty());

        let reopened = SagaEngine::open(&layout, &[ping_saga()]).expect("reopen");
        assert_eq!(reopened.checkpoint("pinger").map(|c| c.position), Some(3));
        assert_eq!(reopened.instance("pinger", "A1"), Some(json!({ "pings": 3 })));
    }

    #[test]
    fn dead_letters_round_trip() {
        let (_tmp, layout, _store) = setup();
        let engine = SagaEngine::open(&layout, &[ping_saga()]).expect("open");
        let command = Command::new("Pong", "X", json!({}));
        engine
            .dead_letter("pinger", &command, "cascade depth exceeded")
            .expect("dead letter should be written");

        let letters = engine.dead_letters("pinger").expect("read dead letters");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].command, command);
        assert_eq!(letters[0].error, "cascade depth exceeded");
        assert!(engine.dead_letters("unknown").expect("read").is_empty());
    }
}
