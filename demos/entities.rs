//! Self-contained example: a typed counter aggregate, a cross-stream
//! projection and a saga that mirrors increments onto a second stream.
//!
//! Run with: `cargo run --example entities`
//!
//! Set `RUST_LOG=eventfold_cqrs=debug` to see each pipeline step.

use eventfold_cqrs::{
    Aggregate, Command, CommandRejected, EngineBuilder, ProjectionDefinition, ProjectionQuery,
    SagaDefinition, SagaOutcome, handler, reducer,
};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Counter aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

/// Adjacently tagged, so `Added { by: 2 }` is stored as event type
/// `"Added"` with data `{"by": 2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Added { by: i64 },
    WasReset { previous: i64 },
}

#[derive(Debug, Deserialize)]
struct Add {
    by: i64,
}

impl Aggregate for Counter {
    type DomainEvent = CounterEvent;

    fn apply(mut self, event: &CounterEvent) -> Self {
        match event {
            CounterEvent::Added { by } => self.value += by,
            CounterEvent::WasReset { .. } => self.value = 0,
        }
        self
    }
}

fn add(_: &Counter, cmd: Add) -> Result<Vec<CounterEvent>, CommandRejected> {
    if cmd.by == 0 {
        return Err(CommandRejected::new("adding zero changes nothing"));
    }
    Ok(vec![CounterEvent::Added { by: cmd.by }])
}

fn reset(counter: &Counter, _: IgnoredAny) -> Result<Vec<CounterEvent>, CommandRejected> {
    if counter.value == 0 {
        return Err(CommandRejected::new("counter is already zero"));
    }
    Ok(vec![CounterEvent::WasReset {
        previous: counter.value,
    }])
}

// ---------------------------------------------------------------------------
// Read model and saga
// ---------------------------------------------------------------------------

fn totals() -> ProjectionDefinition {
    ProjectionDefinition::new("totals", json!({ "added": 0, "resets": 0 }))
        .on("Added", |data, event| {
            let mut next = data.clone();
            let by = event.data["by"].as_i64().unwrap_or(0);
            next["added"] = json!(data["added"].as_i64().unwrap_or(0) + by);
            Ok(next)
        })
        .on("WasReset", |data, _| {
            let mut next = data.clone();
            next["resets"] = json!(data["resets"].as_u64().unwrap_or(0) + 1);
            Ok(next)
        })
}

/// Copies every increment on `alpha` onto `mirror`.
fn mirror() -> SagaDefinition {
    SagaDefinition::new("mirror", json!({ "copied": 0 })).on("Added", |state, event| {
        if event.stream_id != "alpha" {
            return Ok(SagaOutcome::new());
        }
        let copied = state["copied"].as_u64().unwrap_or(0) + 1;
        Ok(SagaOutcome::new()
            .with_state(json!({ "copied": copied }))
            .dispatch(Command::new("Add", "mirror", event.data.clone())))
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tmp = tempfile::tempdir()?;

    let engine = EngineBuilder::new(tmp.path())
        .snapshot_frequency(3)
        .state_reducer(reducer::<Counter>())
        .command_handler("Add", handler(add))
        .command_handler("Reset", handler(reset))
        .projection(totals())
        .saga(mirror())
        .open()
        .await?;

    for by in [1, 2, 3] {
        let result = engine
            .execute(Command::new("Add", "alpha", json!({ "by": by })))
            .await?;
        println!(
            "alpha v{} (cascade: {} executed)",
            result.new_version, result.cascade.executed
        );
    }
    engine
        .execute(Command::new("Add", "beta", json!({ "by": 5 })))
        .await?;
    engine
        .execute(Command::new("Reset", "alpha", json!(null)))
        .await?;

    match engine
        .execute(Command::new("Reset", "alpha", json!(null)))
        .await
    {
        Err(e) => println!("second reset refused: {e}"),
        Ok(_) => return Err("second reset should have been rejected".into()),
    }

    let alpha: Counter = serde_json::from_value(engine.aggregate_state("alpha")?.data)?;
    let mirrored: Counter = serde_json::from_value(engine.aggregate_state("mirror")?.data)?;
    let summary = engine.query_projection("totals", &ProjectionQuery::new())?;
    println!("alpha  = {}", alpha.value);
    println!("mirror = {}", mirrored.value);
    println!("totals = {} (at log position {})", summary.data, summary.version);

    assert_eq!(alpha.value, 0, "alpha was reset");
    assert_eq!(mirrored.value, 6, "mirror copied 1 + 2 + 3");
    assert_eq!(summary.data, json!({ "added": 17, "resets": 1 }));
    assert!(engine.snapshot("alpha")?.is_some());

    println!("all assertions passed");
    Ok(())
}
