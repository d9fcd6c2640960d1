// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The authoritative store and its version counter.
//!
//! The host supplies anything implementing [`ActionProcessor`]; the
//! engine wraps it in a [`StateManager`] which is the only writer and the
//! source of the monotonically increasing state version.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use statemux_wire::action::Action;
use statemux_wire::error::{EngineError, Result};

/// Host-supplied reducer over the authoritative state.
pub trait ActionProcessor: Send + 'static {
    /// Apply one action. Returns `true` when the state changed.
    ///
    /// An unknown action type is a handler-resolution error; a throwing
    /// handler is an action-processing error. Neither corrupts the engine.
    fn process(&mut self, action: &Action) -> Result<bool>;

    /// Snapshot of the full state: an object keyed by top-level state keys.
    fn snapshot(&self) -> Value;
}

type Handler = Box<dyn FnMut(&mut Map<String, Value>, &Action) -> Result<bool> + Send>;

/// A keyed handler registry over a JSON object state.
///
/// The default processor for hosts without their own store: one handler
/// per action type, each mutating the shared object and reporting whether
/// it changed anything.
pub struct HandlerStore {
    state: Map<String, Value>,
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for HandlerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerStore")
            .field("state", &self.state)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerStore {
    /// Build a store over the given initial state, which must be a JSON
    /// object.
    pub fn new(initial: Value) -> Result<Self> {
        match initial {
            Value::Object(state) => Ok(Self { state, handlers: HashMap::new() }),
            other => Err(EngineError::configuration(format!(
                "initial state must be an object, got {other}"
            ))),
        }
    }

    /// Register a handler for one action type.
    pub fn handle<F>(mut self, action_type: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&mut Map<String, Value>, &Action) -> Result<bool> + Send + 'static,
    {
        self.handlers.insert(action_type.into(), Box::new(handler));
        self
    }
}

impl ActionProcessor for HandlerStore {
    fn process(&mut self, action: &Action) -> Result<bool> {
        let Some(handler) = self.handlers.get_mut(&action.action_type) else {
            return Err(EngineError::handler(format!(
                "no handler registered for action type {:?}",
                action.action_type
            ))
            .with_action(action.id));
        };
        handler(&mut self.state, action)
            .map_err(|e| if e.context.action_id.is_none() { e.with_action(action.id) } else { e })
    }

    fn snapshot(&self) -> Value {
        Value::Object(self.state.clone())
    }
}

/// Wraps the host processor and owns the state version.
pub struct StateManager {
    processor: Box<dyn ActionProcessor>,
    version: u64,
}

impl StateManager {
    pub fn new(processor: impl ActionProcessor) -> Self {
        Self { processor: Box::new(processor), version: 1 }
    }

    /// Current state version. Starts at 1 and increments on every change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> Value {
        self.processor.snapshot()
    }

    /// Apply one action. Returns the new version when the state changed,
    /// `None` when the processor reported no change.
    pub fn process(&mut self, action: &Action) -> Result<Option<u64>> {
        let changed = self.processor.process(action)?;
        if !changed {
            debug!(action = %action.action_type, "action applied without a state change");
            return Ok(None);
        }
        self.version += 1;
        Ok(Some(self.version))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
