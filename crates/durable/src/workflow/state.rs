//! Folded workflow state
//!
//! The state a step observes is never stored directly; it is folded from the
//! event history by applying `StateSet` (single key) and `StateUpdate` (full
//! replacement) in ordinal order, starting from the user-supplied initial
//! state.

use serde_json::{Map, Value};

use super::event::WorkflowEvent;

/// The JSON-object state visible to step code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowState {
    values: Map<String, Value>,
}

impl WorkflowState {
    /// Build the starting state from the user-supplied initial value
    ///
    /// `null` is treated as an empty object; anything other than an object is
    /// rejected at workflow start, so this only sees objects in practice.
    pub fn from_initial(initial: &Value) -> Self {
        let values = match initial {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self { values }
    }

    /// Fold a full history into a state
    pub fn fold<'a, I>(initial: &Value, events: I) -> Self
    where
        I: IntoIterator<Item = &'a WorkflowEvent>,
    {
        let mut state = Self::from_initial(initial);
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Apply a single event; non-state events are ignored
    pub fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::StateSet { key, value } => {
                self.set(key, value.clone());
            }
            WorkflowEvent::StateUpdate { new_state } => {
                self.replace(new_state.clone());
            }
            _ => {}
        }
    }

    /// Write a single key
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    /// Replace the entire state with a new snapshot
    pub fn replace(&mut self, new_state: Value) {
        self.values = match new_state {
            Value::Object(map) => map,
            _ => Map::new(),
        };
    }

    /// Read a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The full state as a map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Snapshot the state as a JSON object value
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }
}
