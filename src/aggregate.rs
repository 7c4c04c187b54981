//! Aggregate state, command handler and state reducer types.
//!
//! Aggregate state is a JSON value folded from a stream's events by the
//! engine's [`StateReducer`]. The [`Aggregate`] trait plus [`reducer`] and
//! [`handler`] adapt strongly typed aggregates onto that representation.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::Command;
use crate::error::CommandRejected;
use crate::event::{NewEvent, StoredEvent};

/// Folded state of one aggregate at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Stream the state was folded from.
    pub stream_id: String,
    /// Version of the last event folded in (0 for a new stream).
    pub version: u64,
    /// Reducer output. `Value::Null` for a stream with no events.
    pub data: Value,
}

impl AggregateState {
    /// `true` when no event has been folded yet.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Pure reducer folding one event into aggregate state.
pub type StateReducer = Arc<dyn Fn(Value, &StoredEvent) -> Value + Send + Sync>;

/// Decision function for one command type.
///
/// Must be pure: it inspects the command and current state and either
/// returns the events to append (possibly none) or rejects the command.
pub type CommandHandler =
    Arc<dyn Fn(&Command, &AggregateState) -> Result<Vec<NewEvent>, CommandRejected> + Send + Sync>;

/// Default reducer: shallow-merge each event's payload into an object.
///
/// When the payload has a `"changes"` object, that object is merged
/// instead of the whole payload. Non-object payloads leave state as is.
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::merge_reducer;
/// # use eventfold_cqrs::{EventMetadata, StoredEvent};
/// # use serde_json::json;
/// # let event = |data| StoredEvent {
/// #     event_id: uuid::Uuid::nil(), stream_id: "A1".into(), version: 1,
/// #     global_position: 0, event_type: "EntityUpdated".into(), data,
/// #     metadata: EventMetadata { command_id: uuid::Uuid::nil(), timestamp: 0,
/// #         causation_id: None, correlation_id: None, cascade_depth: 0 },
/// # };
/// let state = merge_reducer(json!({ "name": "x" }), &event(json!({ "changes": { "flag": true } })));
/// assert_eq!(state, json!({ "name": "x", "flag": true }));
/// ```
pub fn merge_reducer(state: Value, event: &StoredEvent) -> Value {
    let mut merged = match state {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let Value::Object(payload) = &event.data else {
        return Value::Object(merged);
    };
    let changes = payload
        .get("changes")
        .and_then(Value::as_object)
        .unwrap_or(payload);
    for (key, value) in changes {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Fold `events` onto `base` in order.
pub(crate) fn fold_events<'a>(
    reducer: &StateReducer,
    base: Value,
    events: impl IntoIterator<Item = &'a StoredEvent>,
) -> Value {
    events
        .into_iter()
        .fold(base, |state, event| reducer(state, event))
}

/// A strongly typed aggregate whose state is derived from its events.
///
/// The implementing type is the state. It is stored in the engine as its
/// JSON serialization, so it must round-trip through `serde_json`.
///
/// # Contract
///
/// - [`apply`](Aggregate::apply) must be a pure, total function.
/// - `DomainEvent` uses adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`).
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The events this aggregate produces and applies.
    type DomainEvent: Serialize + DeserializeOwned;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Decode typed state, treating `Null` as a fresh aggregate.
fn decode_state<A: Aggregate>(data: &Value) -> serde_json::Result<A> {
    if data.is_null() {
        Ok(A::default())
    } else {
        A::deserialize(data)
    }
}

/// Build a state reducer for a typed aggregate.
///
/// Events that do not decode as `A::DomainEvent` are skipped, leaving the
/// state unchanged, for forward compatibility.
pub fn reducer<A: Aggregate>() -> impl Fn(Value, &StoredEvent) -> Value + Send + Sync + 'static {
    |state: Value, event: &StoredEvent| -> Value {
        let Some(domain_event) = event.decode::<A::DomainEvent>() else {
            return state;
        };
        let current = match decode_state::<A>(&state) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(
                    stream_id = %event.stream_id,
                    version = event.version,
                    error = %e,
                    "aggregate state does not decode, event skipped"
                );
                return state;
            }
        };
        match serde_json::to_value(current.apply(&domain_event)) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "aggregate state does not encode, event skipped");
                state
            }
        }
    }
}

/// Build a command handler for a typed aggregate and command payload.
///
/// The command payload is decoded into `C`, the current state into `A`,
/// and the returned domain events are encoded with
/// [`NewEvent::from_domain`].
pub fn handler<A, C, F>(
    decide: F,
) -> impl Fn(&Command, &AggregateState) -> Result<Vec<NewEvent>, CommandRejected> + Send + Sync + 'static
where
    A: Aggregate,
    C: DeserializeOwned + 'static,
    F: Fn(&A, C) -> Result<Vec<A::DomainEvent>, CommandRejected> + Send + Sync + 'static,
{
    move |command: &Command, state: &AggregateState| -> Result<Vec<NewEvent>, CommandRejected> {
        let current = decode_state::<A>(&state.data).map_err(|e| {
            CommandRejected::new(format!("aggregate `{}` is unreadable: {e}", state.stream_id))
        })?;
        let payload = C::deserialize(&command.payload).map_err(|e| {
            CommandRejected::new(format!("malformed `{}` payload: {e}", command.command_type))
        })?;
        decide(&current, payload)?
            .iter()
            .map(|event| {
                NewEvent::from_domain(event)
                    .map_err(|e| CommandRejected::new(format!("event does not encode: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// A simple account aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Account {
        pub balance: u64,
        pub open: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum AccountEvent {
        Opened,
        Deposited { amount: u64 },
        Withdrawn { amount: u64 },
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct Amount {
        pub amount: u64,
    }

    impl Aggregate for Account {
        type DomainEvent = AccountEvent;

        fn apply(mut self, event: &AccountEvent) -> Self {
            match event {
                AccountEvent::Opened => self.open = true,
                AccountEvent::Deposited { amount } => self.balance += amount,
                AccountEvent::Withdrawn { amount } => self.balance -= amount,
            }
            self
        }
    }
}
