//! Actuator dispatch.
//!
//! Actuators apply fully-expanded promises to the system. Implementations
//! live outside the core and register here by promise-type name; the engine
//! guarantees that no `$(...)` references remain, that list references have
//! become concrete scalars, that the lock is held, and that `promiser`,
//! `promisee`, `bundle` and `namespace` are bound in the `this` scope.

use converge_core::promise::{Promise, PromiseResult};
use converge_locks::LockHandle;
use converge_vars::ScopeStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// An applier for one promise type
pub trait Actuator: Send + Sync {
    /// Applies one concrete promise. The engine holds the lock for the
    /// duration of the call.
    fn dispatch(&self, promise: &Promise, store: &ScopeStore, lock: &LockHandle) -> PromiseResult;
}

/// Registry from promise-type name to actuator
#[derive(Default)]
pub struct ActuatorRegistry {
    actuators: HashMap<String, Box<dyn Actuator>>,
}

impl ActuatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an actuator for a promise type, replacing any previous one
    pub fn register<S: Into<String>>(&mut self, promise_type: S, actuator: Box<dyn Actuator>) {
        self.actuators.insert(promise_type.into(), actuator);
    }

    /// The actuator for a promise type, if registered
    pub fn get(&self, promise_type: &str) -> Option<&dyn Actuator> {
        self.actuators.get(promise_type).map(|a| &**a)
    }
}

impl std::fmt::Debug for ActuatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorRegistry")
            .field("types", &self.actuators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The `reports` actuator: logs the expanded promiser. Reports are always
/// considered repaired once emitted.
#[derive(Debug, Default)]
pub struct ReportsActuator {
    sink: Option<Arc<Mutex<Vec<String>>>>,
}

impl ReportsActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reports actuator that also records every emitted line, so callers
    /// can observe output
    pub fn with_sink(sink: Arc<Mutex<Vec<String>>>) -> Self {
        Self { sink: Some(sink) }
    }
}

impl Actuator for ReportsActuator {
    fn dispatch(&self, promise: &Promise, _store: &ScopeStore, _lock: &LockHandle) -> PromiseResult {
        info!(report = promise.promiser.as_str(), "R:");
        if let Some(sink) = &self.sink {
            sink.lock().push(promise.promiser.clone());
        }
        PromiseResult::Repaired
    }
}
