//! Cross-stream projections (read models) folded from the global log.
//!
//! Each projection keeps a single global cursor (`position`): the next
//! global position to fold. Events below the cursor are skipped, so
//! redelivery is harmless. State and cursor are checkpointed together to
//! `<base_dir>/projections/<name>/checkpoint.json` after every batch. A
//! failed save is reported as a [`Fault::Checkpoint`]; the folded state
//! stays in memory and goes out with the next successful save.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Fault, HandlerError};
use crate::event::StoredEvent;
use crate::query::{ProjectionQuery, QueryResult};
use crate::storage::{StorageLayout, read_json_lenient, write_json_atomic};
use crate::store::EventStore;

/// Fold function for one event type: `(data, event) -> new data`.
///
/// Must be deterministic. An error skips the event for this projection
/// and is reported as a [`Fault::ProjectionFold`].
pub type FoldFn = Arc<dyn Fn(&Value, &StoredEvent) -> Result<Value, HandlerError> + Send + Sync>;

/// A named read model: initial data plus one fold per event type.
///
/// Event types without a fold are ignored.
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::ProjectionDefinition;
/// use serde_json::{json, Value};
///
/// let all_entities = ProjectionDefinition::new("all-entities", json!([]))
///     .on("EntityCreated", |data, event| {
///         let mut items = data.as_array().cloned().unwrap_or_default();
///         items.push(event.data.clone());
///         Ok(Value::Array(items))
///     });
/// assert!(all_entities.handles("EntityCreated"));
/// ```
#[derive(Clone)]
pub struct ProjectionDefinition {
    name: String,
    initial: Value,
    handlers: HashMap<String, FoldFn>,
}

impl fmt::Debug for ProjectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut event_types: Vec<&String> = self.handlers.keys().collect();
        event_types.sort();
        f.debug_struct("ProjectionDefinition")
            .field("name", &self.name)
            .field("event_types", &event_types)
            .finish()
    }
}

impl ProjectionDefinition {
    /// Create a projection with no folds.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique projection name; also its checkpoint directory.
    /// * `initial` - Data the projection starts from and resets to on
    ///   rebuild.
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            initial,
            handlers: HashMap::new(),
        }
    }

    /// Register the fold for `event_type`, replacing any earlier one.
    pub fn on<F>(mut self, event_type: impl Into<String>, fold: F) -> Self
    where
        F: Fn(&Value, &StoredEvent) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(fold));
        self
    }

    /// Returns the projection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if a fold is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    fn fresh_state(&self) -> ProjectionState {
        ProjectionState {
            data: self.initial.clone(),
            version: 0,
            last_updated: 0,
            event_count: 0,
            position: 0,
        }
    }
}

/// Persisted state of a projection, including its global cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Current read model.
    pub data: Value,
    /// Highest event incorporated into `data`, as a 1-based position in
    /// the global log (`global_position + 1`). 0 before the first fold.
    ///
    /// Events without a fold, and folds that fail, leave it unchanged.
    pub version: u64,
    /// Timestamp of the last folded event (Unix epoch milliseconds).
    pub last_updated: u64,
    /// Number of events delivered, folded or not.
    pub event_count: u64,
    /// Resume token: the next global position to read.
    ///
    /// After processing the event at position N this is N + 1.
    pub position: u64,
}

/// Drives one projection: cursor bookkeeping, folding and checkpoints.
struct ProjectionRunner {
    definition: Arc<ProjectionDefinition>,
    state: ProjectionState,
    checkpoint_path: PathBuf,
}

impl ProjectionRunner {
    /// Load the runner's checkpoint, or start fresh when there is none.
    ///
    /// A corrupt checkpoint is not a hard error: the projection rebuilds.
    fn open(definition: Arc<ProjectionDefinition>, layout: &StorageLayout) -> io::Result<Self> {
        let checkpoint_path = layout
            .projection_dir(definition.name())
            .join("checkpoint.json");
        let state = read_json_lenient(&checkpoint_path, "projection checkpoint")?
            .unwrap_or_else(|| definition.fresh_state());
        Ok(Self {
            definition,
            state,
            checkpoint_path,
        })
    }

    /// Fold one event, advancing the cursor.
    ///
    /// Events below the cursor were already processed and are skipped.
    fn apply_event(&mut self, event: &StoredEvent) -> Option<Fault> {
        if event.global_position < self.state.position {
            return None;
        }
        self.state.position = event.global_position + 1;
        self.state.event_count += 1;

        let fold = self.definition.handlers.get(&event.event_type)?;
        match fold(&self.state.data, event) {
            Ok(data) => {
                self.state.data = data;
                self.state.version = event.global_position + 1;
                self.state.last_updated = event.metadata.timestamp;
                None
            }
            Err(e) => {
                tracing::warn!(
                    projection = %self.definition.name,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "projection fold failed, event skipped"
                );
                Some(Fault::ProjectionFold {
                    projection: self.definition.name.clone(),
                    event_id: event.event_id,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Fold every stored event at or past the cursor.
    ///
    /// # Returns
    ///
    /// The fold faults, and `true` if the cursor moved.
    fn fold_pending(&mut self, store: &EventStore) -> (Vec<Fault>, bool) {
        let events = store.events_since(self.state.position);
        if events.is_empty() {
            return (Vec::new(), false);
        }
        let faults = events
            .iter()
            .filter_map(|event| self.apply_event(event))
            .collect();
        tracing::debug!(
            projection = %self.definition.name,
            events = events.len(),
            position = self.state.position,
            "projection caught up"
        );
        (faults, true)
    }

    /// Fold pending events and checkpoint.
    fn catch_up(&mut self, store: &EventStore) -> Vec<Fault> {
        let (mut faults, moved) = self.fold_pending(store);
        if moved && let Err(e) = self.save() {
            tracing::error!(
                projection = %self.definition.name,
                position = self.state.position,
                error = %e,
                "failed to save projection checkpoint"
            );
            faults.push(Fault::Checkpoint {
                subscriber: "projection".to_owned(),
                name: self.definition.name.clone(),
                error: e.to_string(),
            });
        }
        faults
    }

    fn save(&self) -> io::Result<()> {
        write_json_atomic(&self.checkpoint_path, &self.state)
    }
}

/// All registered projections.
///
/// Each runner sits behind its own lock so queries never wait on other
/// projections.
pub struct ProjectionEngine {
    runners: Vec<Mutex<ProjectionRunner>>,
    names: Vec<String>,
}

impl fmt::Debug for ProjectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("projections", &self.runners.len())
            .finish()
    }
}

fn lock(runner: &Mutex<ProjectionRunner>) -> MutexGuard<'_, ProjectionRunner> {
    runner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProjectionEngine {
    /// Load every projection's checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if a checkpoint cannot be read.
    pub fn open(
        layout: &StorageLayout,
        definitions: &[Arc<ProjectionDefinition>],
    ) -> Result<Self, EngineError> {
        let runners = definitions
            .iter()
            .map(|def| ProjectionRunner::open(Arc::clone(def), layout).map(Mutex::new))
            .collect::<io::Result<Vec<_>>>()?;
        let names = definitions.iter().map(|def| def.name.clone()).collect();
        Ok(Self { runners, names })
    }

    fn runner(&self, name: &str) -> Result<&Mutex<ProjectionRunner>, EngineError> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.runners.get(i))
            .ok_or_else(|| EngineError::ProjectionNotFound(name.to_owned()))
    }

    /// Registered projection names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Bring every projection up to the end of the log.
    ///
    /// A fold failure or a failed checkpoint in one projection never stops
    /// the others; both come back as faults.
    pub fn catch_up(&self, store: &EventStore) -> Vec<Fault> {
        self.runners
            .iter()
            .flat_map(|runner| lock(runner).catch_up(store))
            .collect()
    }

    /// Reset a projection to its initial data and replay the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name and
    /// [`EngineError::MissingHistory`] when retention has removed events a
    /// full replay would need.
    pub fn rebuild(&self, name: &str, store: &EventStore) -> Result<Vec<Fault>, EngineError> {
        let runner = self.runner(name)?;
        if let Some((stream_id, first_available)) = store.compacted_stream() {
            return Err(EngineError::MissingHistory {
                stream_id,
                first_available,
            });
        }
        let mut runner = lock(runner);
        runner.state = runner.definition.fresh_state();
        let (faults, _) = runner.fold_pending(store);
        runner.save()?;
        tracing::info!(
            projection = name,
            version = runner.state.version,
            "projection rebuilt"
        );
        Ok(faults)
    }

    /// Current state of a projection.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name.
    pub fn state(&self, name: &str) -> Result<ProjectionState, EngineError> {
        Ok(lock(self.runner(name)?).state.clone())
    }

    /// Filter, sort and paginate a projection's data.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ProjectionNotFound`] for an unknown name.
    pub fn query(&self, name: &str, query: &ProjectionQuery) -> Result<QueryResult, EngineError> {
        let runner = lock(self.runner(name)?);
        let (data, total_count) = query.apply(&runner.state.data);
        Ok(QueryResult {
            data,
            version: runner.state.version,
            last_updated: runner.state.last_updated,
            total_count,
        })
    }
}
