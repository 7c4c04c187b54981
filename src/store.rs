//! Durable, append-only event store with one JSONL log per stream.
//!
//! Every stream's events are cached in memory and indexed by version,
//! event id and global position. The files under `streams/` are the source
//! of truth: [`EventStore::open`] rebuilds the whole index from them, so a
//! reopened store is indistinguishable from one that never stopped.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{EventMetadata, NewEvent, StoredEvent};
use crate::storage::{StorageLayout, decode_name, write_atomic};

/// In-memory index over every retained event.
#[derive(Debug, Default)]
struct StoreIndex {
    /// Retained events per stream, ascending and contiguous by version.
    streams: HashMap<String, Vec<StoredEvent>>,
    /// `event_id -> (stream_id, version)`.
    by_id: HashMap<Uuid, (String, u64)>,
    /// `global_position -> (stream_id, version)`.
    by_position: BTreeMap<u64, (String, u64)>,
    /// Position the next appended event receives.
    next_position: u64,
}

impl StoreIndex {
    fn current_version(&self, stream_id: &str) -> u64 {
        self.streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map_or(0, |e| e.version)
    }

    fn get(&self, stream_id: &str, version: u64) -> Option<&StoredEvent> {
        let events = self.streams.get(stream_id)?;
        let first = events.first()?.version;
        let offset = usize::try_from(version.checked_sub(first)?).ok()?;
        events.get(offset)
    }

    /// Add events that directly follow the stream's current version.
    fn insert(&mut self, events: Vec<StoredEvent>) -> Result<(), EngineError> {
        if let Some(first) = events.first() {
            let current = self.current_version(&first.stream_id);
            if current > 0 && first.version != current + 1 {
                return Err(EngineError::Corruption {
                    stream_id: first.stream_id.clone(),
                    reason: format!(
                        "version {} does not follow version {current}",
                        first.version
                    ),
                });
            }
        }
        for event in &events {
            let key = (event.stream_id.clone(), event.version);
            if self
                .by_position
                .insert(event.global_position, key.clone())
                .is_some()
            {
                return Err(EngineError::Corruption {
                    stream_id: event.stream_id.clone(),
                    reason: format!("global position {} is used twice", event.global_position),
                });
            }
            self.by_id.insert(event.event_id, key);
            self.next_position = self.next_position.max(event.global_position + 1);
        }
        if let Some(first) = events.first() {
            self.streams
                .entry(first.stream_id.clone())
                .or_default()
                .extend(events);
        }
        Ok(())
    }
}

/// Durable, ordered, crash-recoverable event storage grouped by stream.
///
/// Appends are serialized by an internal lock, which makes version and
/// position assignment race-free. Readers never observe a partially
/// applied append.
#[derive(Debug)]
pub struct EventStore {
    layout: StorageLayout,
    index: RwLock<StoreIndex>,
}

impl EventStore {
    /// Open the store, recovering every stream log under `streams/`.
    ///
    /// A trailing line without a newline is the remnant of an interrupted
    /// write: it is truncated away with a warning. Any other unreadable
    /// line, a version gap or a duplicate is reported as corruption.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] for I/O failures and
    /// [`EngineError::Corruption`] for logs that break the version sequence.
    pub fn open(layout: StorageLayout) -> Result<Self, EngineError> {
        let dir = layout.streams_dir();
        fs::create_dir_all(&dir)?;

        let mut index = StoreIndex::default();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".jsonl"))
            else {
                continue;
            };
            let Some(stream_id) = decode_name(stem) else {
                tracing::warn!(
                    path = %path.display(),
                    "skipping stream file whose name is not a canonical encoding"
                );
                continue;
            };
            let events = load_stream_file(&path, &stream_id)?;
            index.insert(events)?;
        }

        tracing::info!(
            streams = index.streams.len(),
            events = index.by_position.len(),
            next_position = index.next_position,
            "event store recovered"
        );

        Ok(Self {
            layout,
            index: RwLock::new(index),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append events to a stream.
    ///
    /// Versions `current + 1, current + 2, …` are assigned in input order.
    /// The batch is written with a single write and synced before this
    /// returns. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the durable write fails. The
    /// log is truncated back to its previous length and no version or
    /// position is consumed.
    pub fn append(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EngineError> {
        self.append_expected(stream_id, None, events, metadata)
    }

    /// Append events only if the stream is at `expected_version`.
    ///
    /// `None` skips the check.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConcurrencyConflict`] when the stream has
    /// moved, otherwise as for [`append`](EventStore::append).
    pub fn append_expected(
        &self,
        stream_id: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EngineError> {
        // Held through the fsync so positions become visible in order.
        let mut index = self.write();
        let current = index.current_version(stream_id);
        if let Some(expected) = expected_version
            && expected != current
        {
            return Err(EngineError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected,
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let first_position = index.next_position;
        let stored: Vec<StoredEvent> = (0u64..)
            .zip(events)
            .map(|(offset, event)| StoredEvent {
                event_id: Uuid::new_v4(),
                stream_id: stream_id.to_owned(),
                version: current + offset + 1,
                global_position: first_position + offset,
                event_type: event.event_type,
                data: event.data,
                metadata: metadata.clone(),
            })
            .collect();

        let mut buf = Vec::new();
        for event in &stored {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        self.write_batch(stream_id, &buf)?;
        index.insert(stored.clone())?;

        tracing::debug!(
            stream_id,
            from_version = current + 1,
            count = stored.len(),
            "events appended"
        );
        Ok(stored)
    }

    fn write_batch(&self, stream_id: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.layout.stream_file(stream_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len_before = file.metadata()?.len();
        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_data()) {
            if let Err(truncate_err) = file.set_len(len_before) {
                tracing::error!(
                    stream_id,
                    error = %truncate_err,
                    "failed to roll back partial append"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Events with `from_version < version <= to_version` (or to the end),
    /// ascending. Unknown streams yield an empty list.
    pub fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Vec<StoredEvent> {
        let index = self.read();
        let Some(events) = index.streams.get(stream_id) else {
            return Vec::new();
        };
        let to = to_version.unwrap_or(u64::MAX);
        events
            .iter()
            .filter(|e| e.version > from_version && e.version <= to)
            .cloned()
            .collect()
    }

    /// Version of the last event in the stream (0 if it has none).
    pub fn current_version(&self, stream_id: &str) -> u64 {
        self.read().current_version(stream_id)
    }

    /// Oldest version still on disk, or `None` for an unknown stream.
    ///
    /// Greater than 1 once retention has compacted the stream.
    pub fn first_version(&self, stream_id: &str) -> Option<u64> {
        self.read()
            .streams
            .get(stream_id)
            .and_then(|events| events.first())
            .map(|e| e.version)
    }

    /// All stream ids, sorted.
    pub fn list_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look an event up by id.
    pub fn event_by_id(&self, event_id: Uuid) -> Option<StoredEvent> {
        let index = self.read();
        let (stream_id, version) = index.by_id.get(&event_id)?;
        index.get(stream_id, *version).cloned()
    }

    /// Every retained event at or after `position`, in commit order.
    pub fn events_since(&self, position: u64) -> Vec<StoredEvent> {
        let index = self.read();
        index
            .by_position
            .range(position..)
            .filter_map(|(_, (stream_id, version))| index.get(stream_id, *version).cloned())
            .collect()
    }

    /// Position the next appended event will receive.
    pub fn next_position(&self) -> u64 {
        self.read().next_position
    }

    /// A stream whose early history was removed by compaction, with the
    /// oldest version it still holds.
    pub fn compacted_stream(&self) -> Option<(String, u64)> {
        self.read()
            .streams
            .iter()
            .filter_map(|(id, events)| Some((id, events.first()?.version)))
            .filter(|(_, first)| *first > 1)
            .map(|(id, first)| (id.clone(), first))
            .min()
    }

    /// Drop events with `version <= through_version` from a stream.
    ///
    /// The latest event of a stream is always kept so its current version
    /// survives a restart. The log is rewritten atomically.
    ///
    /// # Returns
    ///
    /// The number of events removed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RetentionViolation`] if `through_version` is
    /// past `snapshot_version` (events not covered by a snapshot are needed
    /// for replay), or [`EngineError::Persistence`] if the rewrite fails.
    pub fn compact(
        &self,
        stream_id: &str,
        through_version: u64,
        snapshot_version: Option<u64>,
    ) -> Result<usize, EngineError> {
        let snapshot_version = snapshot_version.unwrap_or(0);
        if through_version > snapshot_version {
            return Err(EngineError::RetentionViolation {
                stream_id: stream_id.to_owned(),
                requested: through_version,
                snapshot_version,
            });
        }

        let mut index = self.write();
        let through = through_version.min(index.current_version(stream_id).saturating_sub(1));
        let Some(events) = index.streams.get(stream_id) else {
            return Ok(0);
        };
        let split = events.partition_point(|e| e.version <= through);
        if split == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for event in &events[split..] {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        write_atomic(&self.layout.stream_file(stream_id), &buf)?;

        let removed: Vec<StoredEvent> = index
            .streams
            .get_mut(stream_id)
            .map(|events| events.drain(..split).collect())
            .unwrap_or_default();
        for event in &removed {
            index.by_id.remove(&event.event_id);
            index.by_position.remove(&event.global_position);
        }

        tracing::info!(
            stream_id,
            through_version = through,
            removed = removed.len(),
            "stream compacted"
        );
        Ok(removed.len())
    }
}

/// Read and validate one stream log.
fn load_stream_file(path: &Path, stream_id: &str) -> Result<Vec<StoredEvent>, EngineError> {
    let content = fs::read_to_string(path)?;
    let corruption = |reason: String| EngineError::Corruption {
        stream_id: stream_id.to_owned(),
        reason,
    };

    let mut events: Vec<StoredEvent> = Vec::new();
    let mut offset = 0usize;
    for line in content.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let event: StoredEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(_) if !line.ends_with('\n') => {
                tracing::warn!(
                    stream_id,
                    path = %path.display(),
                    "truncating torn write at end of stream log"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(u64::try_from(line_start).unwrap_or(u64::MAX))?;
                file.sync_data()?;
                break;
            }
            Err(e) => return Err(corruption(format!("unreadable record: {e}"))),
        };

        if event.stream_id != stream_id {
            return Err(corruption(format!(
                "record belongs to stream `{}`",
                event.stream_id
            )));
        }
        let expected = events.last().map_or(event.version.max(1), |e| e.version + 1);
        if event.version != expected || event.version == 0 {
            return Err(corruption(format!(
                "expected version {expected}, found {}",
                event.version
            )));
        }
        events.push(event);
    }
    Ok(events)
}
