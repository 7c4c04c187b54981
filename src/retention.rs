//! Age-based compaction of stream history covered by snapshots.
//!
//! [`Engine::enforce_retention`] runs one pass;
//! [`Engine::spawn_retention`] runs passes on an interval until the returned
//! [`RetentionHandle`] is shut down.

use std::io;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::now_millis;

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Streams that lost at least one event.
    pub streams_compacted: usize,
    /// Total events removed.
    pub events_removed: usize,
}

/// Handle for the background retention task.
///
/// Dropping the handle does **not** stop the task. Call
/// [`shutdown`](RetentionHandle::shutdown) to stop it.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct RetentionHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for RetentionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionHandle").finish_non_exhaustive()
    }
}

impl RetentionHandle {
    /// Signal the task to stop and wait for it to exit.
    ///
    /// A pass already in progress finishes first. Calling `shutdown` more
    /// than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("retention task panicked: {e}")))?;
        }
        Ok(())
    }
}

impl Engine {
    /// Remove one stream's events older than `cutoff` that its latest
    /// snapshot covers. Returns how many were removed.
    ///
    /// Blocking: called on the blocking pool with the stream lock held.
    fn compact_expired(&self, stream_id: &str, cutoff: u64) -> Result<usize, EngineError> {
        let inner = &self.inner;
        let Some(snapshot) = inner.snapshots.latest(stream_id)? else {
            return Ok(0);
        };
        let current = inner.store.current_version(stream_id);
        if snapshot.version > current {
            tracing::warn!(
                stream_id,
                snapshot_version = snapshot.version,
                current_version = current,
                "snapshot ahead of stream, skipping retention"
            );
            return Ok(0);
        }

        let through = inner
            .store
            .read_stream(stream_id, 0, Some(snapshot.version))
            .iter()
            .take_while(|e| e.metadata.timestamp < cutoff)
            .last()
            .map(|e| e.version);
        match through {
            Some(through) => inner.store.compact(stream_id, through, Some(snapshot.version)),
            None => Ok(0),
        }
    }

    /// Compact every stream's events older than `max_event_age`.
    ///
    /// See [`enforce_retention_at`](Engine::enforce_retention_at).
    ///
    /// # Errors
    ///
    /// As for [`enforce_retention_at`](Engine::enforce_retention_at).
    pub async fn enforce_retention(&self) -> Result<RetentionReport, EngineError> {
        self.enforce_retention_at(now_millis()).await
    }

    /// Compact every stream as if the current time were `now_ms` (Unix
    /// epoch milliseconds).
    ///
    /// For each stream, events with a timestamp older than
    /// `now_ms - max_event_age` are removed, but only up to the version of
    /// the stream's latest snapshot, and never the stream's latest event.
    /// Streams without a snapshot are left alone. Each stream is compacted
    /// under its stream lock on the blocking pool.
    ///
    /// Once a stream is compacted, projections can no longer be rebuilt
    /// from the log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] with
    /// [`ConfigError::RetentionDisabled`] when `max_event_age` is unset, or
    /// the first store error hit while compacting.
    pub async fn enforce_retention_at(&self, now_ms: u64) -> Result<RetentionReport, EngineError> {
        let inner = &self.inner;
        let max_age = inner
            .config
            .max_event_age
            .ok_or(ConfigError::RetentionDisabled)?;
        let age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(age_ms);

        let mut report = RetentionReport::default();
        for stream_id in inner.store.list_streams() {
            let guard = inner.locks.acquire(&stream_id).await;
            let removed = self
                .blocking(move |engine| {
                    let _guard = guard;
                    engine.compact_expired(&stream_id, cutoff)
                })
                .await?;
            if removed > 0 {
                report.streams_compacted += 1;
                report.events_removed += removed;
            }
        }

        if report.events_removed > 0 {
            tracing::info!(
                streams = report.streams_compacted,
                events = report.events_removed,
                "retention pass complete"
            );
        }
        Ok(report)
    }

    /// Run [`enforce_retention`](Engine::enforce_retention) every
    /// `retention_interval` on a background task.
    ///
    /// Must be called inside a tokio runtime. Pass errors are logged and
    /// the task keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RetentionDisabled`] (as
    /// [`EngineError::Config`]) when `max_event_age` is unset.
    pub fn spawn_retention(&self) -> Result<RetentionHandle, EngineError> {
        if self.inner.config.max_event_age.is_none() {
            return Err(ConfigError::RetentionDisabled.into());
        }
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run_retention_loop(self.clone(), shutdown_rx));
        Ok(RetentionHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        })
    }
}

async fn run_retention_loop(engine: Engine, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(engine.inner.config.retention_interval);
    // The first tick completes immediately; consume it.
    interval.tick().await;
    tracing::info!(
        interval_ms = u64::try_from(engine.inner.config.retention_interval.as_millis())
            .unwrap_or(u64::MAX),
        "retention task started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.enforce_retention().await {
                    tracing::error!(error = %e, "retention pass failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("retention task stopped");
}
