//! Startup-time table of command handlers, projections and sagas.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use crate::aggregate::{CommandHandler, StateReducer, merge_reducer};
use crate::config::ConfigError;
use crate::projection::ProjectionDefinition;
use crate::saga::SagaDefinition;

/// Everything the engine dispatches to.
///
/// Filled by [`EngineBuilder`](crate::EngineBuilder) and frozen when the
/// engine opens.
#[derive(Clone)]
pub struct Registry {
    handlers: HashMap<String, CommandHandler>,
    projections: Vec<Arc<ProjectionDefinition>>,
    sagas: Vec<Arc<SagaDefinition>>,
    reducer: StateReducer,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            projections: Vec::new(),
            sagas: Vec::new(),
            reducer: Arc::new(merge_reducer),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut command_types: Vec<&String> = self.handlers.keys().collect();
        command_types.sort();
        f.debug_struct("Registry")
            .field("command_types", &command_types)
            .field("projections", &self.projections)
            .field("sagas", &self.sagas)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// # Errors
    ///
    /// Returns [`ConfigError::Duplicate`] if `command_type` already has a
    /// handler.
    pub fn register_handler(
        &mut self,
        command_type: impl Into<String>,
        handler: CommandHandler,
    ) -> Result<(), ConfigError> {
        match self.handlers.entry(command_type.into()) {
            Entry::Occupied(entry) => Err(ConfigError::Duplicate {
                kind: "command handler",
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Duplicate`] if the name is taken.
    pub fn register_projection(&mut self, definition: ProjectionDefinition) -> Result<(), ConfigError> {
        if self.projections.iter().any(|p| p.name() == definition.name()) {
            return Err(ConfigError::Duplicate {
                kind: "projection",
                name: definition.name().to_owned(),
            });
        }
        self.projections.push(Arc::new(definition));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Duplicate`] if the name is taken.
    pub fn register_saga(&mut self, definition: SagaDefinition) -> Result<(), ConfigError> {
        if self.sagas.iter().any(|s| s.name() == definition.name()) {
            return Err(ConfigError::Duplicate {
                kind: "saga",
                name: definition.name().to_owned(),
            });
        }
        self.sagas.push(Arc::new(definition));
        Ok(())
    }

    /// Replace the state reducer. The last call wins.
    pub fn set_reducer(&mut self, reducer: StateReducer) {
        self.reducer = reducer;
    }

    /// Look up the handler for a command type.
    ///
    /// # Returns
    ///
    /// `None` if no handler is registered for `command_type`.
    pub fn handler(&self, command_type: &str) -> Option<&CommandHandler> {
        self.handlers.get(command_type)
    }

    /// Registered projections, in registration order.
    pub fn projections(&self) -> &[Arc<ProjectionDefinition>] {
        &self.projections
    }

    /// Registered sagas, in registration order. Events reach sagas in
    /// this order.
    pub fn sagas(&self) -> &[Arc<SagaDefinition>] {
        &self.sagas
    }

    /// The reducer that folds events into aggregate state.
    pub fn reducer(&self) -> &StateReducer {
        &self.reducer
    }
}
