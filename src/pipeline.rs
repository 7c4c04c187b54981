//! Command execution: validation, per-stream locking, handler invocation,
//! append, delivery and the saga cascade.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::Instrument;

use crate::command::{CascadeFailure, CascadeReport, Command, CommandResult};
use crate::engine::Engine;
use crate::error::{EngineError, Fault};
use crate::event::{EventMetadata, NewEvent, StoredEvent};

/// Lock table entries are pruned once the table grows past this size.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per stream: a single writer per stream, while
/// different streams proceed concurrently.
#[derive(Debug, Default)]
pub(crate) struct StreamLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StreamLocks {
    pub(crate) async fn acquire(&self, stream_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                // Only this table holds a reference: nobody holds or waits on it.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(stream_id.to_owned()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Caller deadline for [`Engine::execute_with_timeout`].
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn check(&self) -> Result<(), EngineError> {
        if Instant::now() >= self.at {
            Err(EngineError::Timeout(self.budget))
        } else {
            Ok(())
        }
    }
}

fn validate(command: &Command, max_depth: u32) -> Result<(), EngineError> {
    if command.command_type.trim().is_empty() {
        return Err(EngineError::Validation("command_type is required".to_owned()));
    }
    if command.aggregate_id.trim().is_empty() {
        return Err(EngineError::Validation("aggregate_id is required".to_owned()));
    }
    if command.metadata.cascade_depth > max_depth {
        return Err(EngineError::CascadeLimitExceeded {
            depth: command.metadata.cascade_depth,
            limit: max_depth,
        });
    }
    Ok(())
}

impl Engine {
    /// Execute a command.
    ///
    /// Validates it, loads the target aggregate under its stream lock,
    /// runs the handler and appends the resulting events on the blocking
    /// pool. Once the events
    /// are durable they are folded into every projection and delivered to
    /// every saga; commands sagas emit are then executed from a FIFO queue
    /// and summarized in [`CommandResult::cascade`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for a missing type or aggregate id.
    /// - [`EngineError::UnhandledCommand`] when no handler is registered.
    /// - [`EngineError::ConcurrencyConflict`] when `expected_version` is
    ///   stale.
    /// - [`EngineError::Rejected`] when the handler rejects the command.
    /// - [`EngineError::Persistence`] when the append fails.
    ///
    /// Failures after the append are reported as [`Fault`]s and never
    /// returned here.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, EngineError> {
        let span = tracing::info_span!(
            "execute",
            command_id = %command.id,
            command_type = %command.command_type,
            aggregate_id = %command.aggregate_id,
        );
        async move {
            let (mut result, queue) = self.execute_one(command, None).await?;
            result.cascade = self.run_cascade(queue).await;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Execute a command with a deadline.
    ///
    /// The deadline covers waiting for the stream lock, loading state and
    /// running the handler (on a blocking thread). If it expires first,
    /// [`EngineError::Timeout`] is returned and nothing is committed. Once
    /// the append starts, the command runs to completion. Cascaded saga
    /// commands are not bound by the deadline.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Engine::execute), plus [`EngineError::Timeout`]
    /// and [`EngineError::HandlerFailed`] if the handler panics.
    pub async fn execute_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResult, EngineError> {
        let span = tracing::info_span!(
            "execute",
            command_id = %command.id,
            command_type = %command.command_type,
            aggregate_id = %command.aggregate_id,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        );
        let deadline = Deadline {
            at: Instant::now() + timeout,
            budget: timeout,
        };
        async move {
            let (mut result, queue) = self.execute_one(command, Some(deadline)).await?;
            result.cascade = self.run_cascade(queue).await;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Run one command through the pipeline without draining its cascade.
    ///
    /// Returns the result and the saga commands delivery produced.
    async fn execute_one(
        &self,
        mut command: Command,
        deadline: Option<Deadline>,
    ) -> Result<(CommandResult, VecDeque<(String, Command)>), EngineError> {
        let inner = &self.inner;
        validate(&command, inner.config.max_cascade_depth)?;
        if command.metadata.timestamp == 0 {
            command.metadata.timestamp = crate::event::now_millis();
        }
        tracing::debug!("validated");

        let handler = inner
            .registry
            .handler(&command.command_type)
            .cloned()
            .ok_or_else(|| EngineError::UnhandledCommand(command.command_type.clone()))?;

        let stream_id = command.aggregate_id.clone();
        let guard = match deadline {
            None => inner.locks.acquire(&stream_id).await,
            Some(deadline) => {
                tokio::time::timeout_at(deadline.at, inner.locks.acquire(&stream_id))
                    .await
                    .map_err(|_| EngineError::Timeout(deadline.budget))?
            }
        };

        let state = inner.snapshots.state(&stream_id, None)?;
        if let Some(expected) = command.expected_version
            && expected != state.version
        {
            return Err(EngineError::ConcurrencyConflict {
                stream_id,
                expected,
                actual: state.version,
            });
        }
        if let Some(deadline) = deadline {
            deadline.check()?;
        }
        tracing::debug!(version = state.version, "state loaded");

        let new_events = match deadline {
            None => handler(&command, &state),
            Some(deadline) => {
                let (cmd, current) = (command.clone(), state.clone());
                let task = tokio::task::spawn_blocking(move || handler(&cmd, &current));
                match tokio::time::timeout_at(deadline.at, task).await {
                    Err(_) => return Err(EngineError::Timeout(deadline.budget)),
                    Ok(Err(join_error)) => {
                        return Err(EngineError::HandlerFailed(join_error.to_string()));
                    }
                    Ok(Ok(result)) => result,
                }
            }
        }
        .inspect_err(|rejection| tracing::debug!(reason = %rejection.reason, "rejected"))?;
        tracing::debug!(events = new_events.len(), "handled");

        // Durability boundary: the blocking task keeps the stream lock and
        // runs to completion even if the caller stops polling. Only the
        // cascade of a dropped call is lost.
        let base_version = state.version;
        let metadata = command.event_metadata();
        let span = tracing::Span::current();
        let (events, queue) = self
            .blocking(move |engine| {
                let _guard = guard;
                span.in_scope(|| engine.commit(&stream_id, base_version, new_events, &metadata))
            })
            .await?;
        let new_version = events.last().map_or(base_version, |e| e.version);
        tracing::debug!("completed");

        Ok((
            CommandResult {
                command_id: command.id,
                events,
                new_version,
                cascade: CascadeReport::default(),
            },
            queue,
        ))
    }

    /// Append at `expected`, deliver the new events and snapshot if due.
    ///
    /// Blocking: called on the blocking pool with the stream lock held.
    fn commit(
        &self,
        stream_id: &str,
        expected: u64,
        new_events: Vec<NewEvent>,
        metadata: &EventMetadata,
    ) -> Result<(Vec<StoredEvent>, VecDeque<(String, Command)>), EngineError> {
        let inner = &self.inner;
        let events = inner
            .store
            .append_expected(stream_id, Some(expected), new_events, metadata)?;
        tracing::debug!(
            new_version = events.last().map_or(expected, |e| e.version),
            "events appended"
        );

        let queue = if events.is_empty() {
            VecDeque::new()
        } else {
            let queue = self.deliver();
            tracing::debug!(saga_commands = queue.len(), "delivered");
            queue
        };

        if inner.snapshots.should_snapshot(stream_id)
            && let Err(e) = inner.snapshots.create_snapshot(stream_id)
        {
            tracing::warn!(stream_id, error = %e, "snapshot failed");
        }
        Ok((events, queue))
    }

    /// Drain the saga command queue breadth-first.
    ///
    /// Each command runs after the command that triggered it has released
    /// its stream lock, so a saga may target the stream it listens to.
    pub(crate) async fn run_cascade(
        &self,
        mut queue: VecDeque<(String, Command)>,
    ) -> CascadeReport {
        let mut report = CascadeReport::default();
        while let Some((saga, command)) = queue.pop_front() {
            let span = tracing::info_span!(
                "cascade",
                saga = %saga,
                command_id = %command.id,
                command_type = %command.command_type,
                aggregate_id = %command.aggregate_id,
                depth = command.metadata.cascade_depth,
            );
            match self
                .execute_one(command.clone(), None)
                .instrument(span)
                .await
            {
                Ok((_, more)) => {
                    report.executed += 1;
                    queue.extend(more);
                }
                Err(e) => report.failures.push(self.cascade_failed(saga, command, &e)),
            }
        }
        report
    }

    fn cascade_failed(&self, saga: String, command: Command, error: &EngineError) -> CascadeFailure {
        let limit_exceeded = matches!(error, EngineError::CascadeLimitExceeded { .. });
        tracing::warn!(
            saga = %saga,
            command_id = %command.id,
            command_type = %command.command_type,
            depth = command.metadata.cascade_depth,
            error = %error,
            "saga command failed"
        );
        if let Err(e) = self.inner.sagas.dead_letter(&saga, &command, &error.to_string()) {
            tracing::error!(saga = %saga, error = %e, "failed to write dead letter");
        }
        self.publish(Fault::Cascade {
            saga: saga.clone(),
            command_id: command.id,
            command_type: command.command_type.clone(),
            error: error.to_string(),
        });
        CascadeFailure {
            saga,
            command,
            error: error.to_string(),
            limit_exceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateState;
    use crate::engine::EngineBuilder;
    use crate::error::CommandRejected;
    use crate::projection::ProjectionDefinition;
    use serde_json::json;
    use tempfile::TempDir;

    fn create(cmd: &Command, state: &AggregateState) -> Result<Vec<NewEvent>, CommandRejected> {
        if !state.is_new() {
            return Err(CommandRejected::new("entity already exists"));
        }
        Ok(vec![NewEvent::new("EntityCreated", cmd.payload.clone())])
    }

    fn update(cmd: &Command, _: &AggregateState) -> Result<Vec<NewEvent>, CommandRejected> {
        Ok(vec![NewEvent::new("EntityUpdated", cmd.payload.clone())])
    }

    async fn engine(dir: &std::path::Path) -> Engine {
        EngineBuilder::new(dir)
            .command_handler("CreateEntity", create)
            .command_handler("UpdateEntity", update)
            .command_handler("Noop", |_, _| Ok(Vec::new()))
            .command_handler("Slow", |_, _| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(vec![NewEvent::new("Slept", json!({}))])
            })
            .open()
            .await
            .expect("open should succeed")
    }

    #[test]
    fn validation_rejects_blank_fields() {
        let blank_type = Command::new(" ", "A1", json!({}));
        assert!(matches!(
            validate(&blank_type, 16),
            Err(EngineError::Validation(_))
        ));
        let blank_id = Command::new("CreateEntity", "", json!({}));
        assert!(matches!(validate(&blank_id, 16), Err(EngineError::Validation(_))));

        let mut deep = Command::new("CreateEntity", "A1", json!({}));
        deep.metadata.cascade_depth = 17;
        assert!(matches!(
            validate(&deep, 16),
            Err(EngineError::CascadeLimitExceeded {
                depth: 17,
                limit: 16
            })
        ));
    }

    #[tokio::test]
    async fn unknown_command_type_is_unhandled() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let err = engine
            .execute(Command::new("DeleteEntity", "A1", json!({})))
            .await
            .expect_err("no handler registered");
        assert!(matches!(err, EngineError::UnhandledCommand(t) if t == "DeleteEntity"));
        assert!(engine.list_streams().is_empty());
    }

    #[tokio::test]
    async fn rejection_appends_nothing() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        engine
            .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
            .await
            .expect("create should succeed");
        let err = engine
            .execute(Command::new("CreateEntity", "A1", json!({ "name": "x" })))
            .await
            .expect_err("second create should be rejected");
        assert_eq!(err.to_string(), "command rejected: entity already exists");
        assert_eq!(engine.event_stream("A1", 0, None).current_version, 1);
    }

    #[tokio::test]
    async fn noop_command_keeps_version() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        engine
            .execute(Command::new("CreateEntity", "A1", json!({})))
            .await
            .expect("create should succeed");
        let result = engine
            .execute(Command::new("Noop", "A1", json!({})))
            .await
            .expect("noop should succeed");
        assert!(result.events.is_empty());
        assert_eq!(result.new_version, 1);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        engine
            .execute(Command::new("CreateEntity", "A1", json!({})).with_expected_version(0))
            .await
            .expect("create at version 0 should succeed");
        let err = engine
            .execute(Command::new("UpdateEntity", "A1", json!({})).with_expected_version(0))
            .await
            .expect_err("stale version should conflict");
        assert!(matches!(
            err,
            EngineError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn events_carry_command_identity() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let command = Command::new("CreateEntity", "A1", json!({})).with_correlation_id("req-1");
        let id = command.id;
        let result = engine.execute(command).await.expect("create should succeed");
        let meta = &result.events[0].metadata;
        assert_eq!(meta.command_id, id);
        assert_eq!(meta.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(meta.cascade_depth, 0);
        assert_eq!(result.command_id, id);
    }

    #[tokio::test]
    async fn concurrent_commands_on_one_stream_get_distinct_versions() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let mut tasks = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .execute(Command::new("UpdateEntity", "A1", json!({ "i": i })))
                    .await
                    .map(|r| r.new_version)
            }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(
                task.await
                    .expect("task should not panic")
                    .expect("update should succeed"),
            );
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn handler_past_deadline_times_out_without_commit() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let err = engine
            .execute_with_timeout(
                Command::new("Slow", "A1", json!({})),
                Duration::from_millis(20),
            )
            .await
            .expect_err("slow handler should time out");
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(engine.event_stream("A1", 0, None).current_version, 0);

        let ok = engine
            .execute_with_timeout(
                Command::new("UpdateEntity", "A1", json!({})),
                Duration::from_secs(5),
            )
            .await
            .expect("fast handler should finish in time");
        assert_eq!(ok.new_version, 1);
    }

    #[tokio::test]
    async fn commit_runs_off_the_runtime_thread() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let folded_on: Arc<Mutex<Option<std::thread::ThreadId>>> = Arc::default();
        let recorder = Arc::clone(&folded_on);
        let threads = ProjectionDefinition::new("threads", json!(null)).on(
            "EntityCreated",
            move |data, _| {
                *recorder.lock().expect("lock") = Some(std::thread::current().id());
                Ok(data.clone())
            },
        );
        let engine = EngineBuilder::new(tmp.path())
            .command_handler("CreateEntity", create)
            .projection(threads)
            .open()
            .await
            .expect("open should succeed");

        engine
            .execute(Command::new("CreateEntity", "A1", json!({})))
            .await
            .expect("create should succeed");
        let folded_on = *folded_on.lock().expect("lock");
        assert!(folded_on.is_some());
        assert_ne!(folded_on, Some(std::thread::current().id()));
        assert_eq!(engine.event_stream("A1", 0, None).current_version, 1);
    }

    #[tokio::test]
    async fn dropped_call_still_commits() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let call = engine.execute(Command::new("CreateEntity", "A1", json!({})));
        // The first poll runs up to the blocking commit, then the call is dropped.
        let _ = tokio::time::timeout(Duration::ZERO, call).await;

        let guard = engine.inner.locks.acquire("A1").await;
        drop(guard);
        assert_eq!(engine.event_stream("A1", 0, None).current_version, 1);
    }

    #[tokio::test]
    async fn lock_wait_counts_against_deadline() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let engine = engine(tmp.path()).await;
        let held = engine.inner.locks.acquire("A1").await;
        let err = engine
            .execute_with_timeout(
                Command::new("UpdateEntity", "A1", json!({})),
                Duration::from_millis(20),
            )
            .await
            .expect_err("locked stream should time out");
        assert!(matches!(err, EngineError::Timeout(_)));
        drop(held);
        assert_eq!(engine.event_stream("A1", 0, None).current_version, 0);
    }
}
