//! Materialized aggregate state checkpoints.
//!
//! One snapshot per stream is kept at `<base_dir>/snapshots/<stream>.json`,
//! written atomically via temp-rename. Snapshots only ever skip replay:
//! a missing, corrupt or stale snapshot falls back to replaying the stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::{AggregateState, StateReducer, fold_events};
use crate::error::EngineError;
use crate::event::{StoredEvent, now_millis};
use crate::storage::{StorageLayout, read_json_lenient, write_json_atomic};
use crate::store::EventStore;

/// A point-in-time snapshot of a stream's folded state.
///
/// `data` equals the reducer folded over events `1..=version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stream the snapshot belongs to.
    pub stream_id: String,
    /// Version of the last event folded into `data`.
    pub version: u64,
    /// Folded state.
    pub data: Value,
    /// Creation time (Unix epoch milliseconds).
    pub timestamp: u64,
}

/// A snapshot to start from plus the events to fold on top of it.
#[derive(Debug, Clone)]
pub struct LoadedState {
    /// Usable snapshot, if any.
    pub snapshot: Option<Snapshot>,
    /// Events after the snapshot (or from version 1), ascending.
    pub events: Vec<StoredEvent>,
    /// Version the state is being loaded at.
    pub version: u64,
}

/// Creates, caches and loads snapshots for every stream.
pub struct SnapshotManager {
    layout: StorageLayout,
    store: Arc<EventStore>,
    reducer: StateReducer,
    frequency: u64,
    cache: Mutex<HashMap<String, Option<Snapshot>>>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("base_dir", &self.layout.base_dir())
            .field("frequency", &self.frequency)
            .finish_non_exhaustive()
    }
}

impl SnapshotManager {
    /// Create a manager. `frequency == 0` disables automatic snapshots.
    pub fn new(
        layout: StorageLayout,
        store: Arc<EventStore>,
        reducer: StateReducer,
        frequency: u64,
    ) -> Self {
        Self {
            layout,
            store,
            reducer,
            frequency,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Latest stored snapshot of a stream.
    ///
    /// A corrupt file, or one recorded for a different stream, is logged
    /// and treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] for I/O failures other than
    /// file-not-found.
    pub fn latest(&self, stream_id: &str) -> Result<Option<Snapshot>, EngineError> {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
        {
            return Ok(cached.clone());
        }

        let path = self.layout.snapshot_file(stream_id);
        let snapshot = read_json_lenient::<Snapshot>(&path, "snapshot")?.filter(|snap| {
            let matches = snap.stream_id == stream_id;
            if !matches {
                tracing::warn!(
                    stream_id,
                    recorded = %snap.stream_id,
                    "snapshot belongs to another stream, ignoring it"
                );
            }
            matches
        });

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_id.to_owned(), snapshot.clone());
        Ok(snapshot)
    }

    /// `true` when the stream is at least `frequency` events past its
    /// latest snapshot.
    pub fn should_snapshot(&self, stream_id: &str) -> bool {
        if self.frequency == 0 {
            return false;
        }
        let last = self
            .latest(stream_id)
            .ok()
            .flatten()
            .map_or(0, |snap| snap.version);
        self.store.current_version(stream_id).saturating_sub(last) >= self.frequency
    }

    /// Pick the best starting point for rebuilding a stream's state.
    ///
    /// Uses the latest snapshot when its version is at most `as_of`
    /// (default: the current version). A snapshot ahead of the stream is
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingHistory`] when events the replay needs
    /// were compacted away, or [`EngineError::Persistence`] for I/O failures.
    pub fn load_state(
        &self,
        stream_id: &str,
        as_of: Option<u64>,
    ) -> Result<LoadedState, EngineError> {
        let current = self.store.current_version(stream_id);
        let target = as_of.map_or(current, |v| v.min(current));

        let snapshot = match self.latest(stream_id)? {
            Some(snap) if snap.version > current => {
                tracing::warn!(
                    stream_id,
                    snapshot_version = snap.version,
                    current_version = current,
                    "snapshot is ahead of the stream, replaying from scratch"
                );
                None
            }
            Some(snap) if snap.version <= target => Some(snap),
            _ => None,
        };

        let from = snapshot.as_ref().map_or(0, |snap| snap.version);
        let events = self.store.read_stream(stream_id, from, Some(target));
        self.ensure_history(stream_id, from, target, &events)?;

        Ok(LoadedState {
            snapshot,
            events,
            version: target,
        })
    }

    /// Load events `from_version < v <= current` without any snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingHistory`] when part of that range was
    /// compacted away.
    pub fn load_from(&self, stream_id: &str, from_version: u64) -> Result<LoadedState, EngineError> {
        let current = self.store.current_version(stream_id);
        let events = self.store.read_stream(stream_id, from_version, None);
        self.ensure_history(stream_id, from_version, current, &events)?;
        Ok(LoadedState {
            snapshot: None,
            events,
            version: current,
        })
    }

    fn ensure_history(
        &self,
        stream_id: &str,
        from: u64,
        target: u64,
        events: &[StoredEvent],
    ) -> Result<(), EngineError> {
        if target > from && events.first().map(|e| e.version) != Some(from + 1) {
            return Err(EngineError::MissingHistory {
                stream_id: stream_id.to_owned(),
                first_available: self.store.first_version(stream_id).unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Fold a loaded state with the engine's reducer.
    pub fn fold(&self, stream_id: &str, loaded: &LoadedState) -> AggregateState {
        let base = loaded
            .snapshot
            .as_ref()
            .map_or(Value::Null, |snap| snap.data.clone());
        AggregateState {
            stream_id: stream_id.to_owned(),
            version: loaded.version,
            data: fold_events(&self.reducer, base, &loaded.events),
        }
    }

    /// Current (or `as_of`) state of a stream.
    ///
    /// # Errors
    ///
    /// As for [`load_state`](SnapshotManager::load_state).
    pub fn state(&self, stream_id: &str, as_of: Option<u64>) -> Result<AggregateState, EngineError> {
        let loaded = self.load_state(stream_id, as_of)?;
        Ok(self.fold(stream_id, &loaded))
    }

    /// Snapshot the stream at its current version.
    ///
    /// Folds from the prior snapshot when there is one. A stream with no
    /// events yields `None` and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the write fails, or
    /// [`EngineError::MissingHistory`] if the fold cannot be completed.
    pub fn create_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>, EngineError> {
        let state = self.state(stream_id, None)?;
        if state.is_new() {
            return Ok(None);
        }
        let snapshot = Snapshot {
            stream_id: stream_id.to_owned(),
            version: state.version,
            data: state.data,
            timestamp: now_millis(),
        };
        write_json_atomic(&self.layout.snapshot_file(stream_id), &snapshot)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_id.to_owned(), Some(snapshot.clone()));

        tracing::debug!(stream_id, version = snapshot.version, "snapshot created");
        Ok(Some(snapshot))
    }
}
