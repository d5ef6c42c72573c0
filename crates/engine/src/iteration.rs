//! Promise iteration wheels.
//!
//! Each list variable a promise references becomes a wheel over a deep
//! copy of the list, padded with a null sentinel at head and tail so that
//! a single-element list still participates in termination detection. The
//! wheels advance like an odometer, rightmost first; combinations where
//! any wheel rests on a sentinel are skipped, and iteration ends once
//! every cursor has run past its tail sentinel.

use crate::error::{EngineError, EngineResult};
use converge_core::constants::NULL_VALUE;
use converge_core::promise::Promise;
use converge_core::rval::{DataType, Rval};
use converge_vars::{expand, ScopeStore};
use tracing::debug;

/// One cursor over one list variable
#[derive(Debug)]
pub struct IterationWheel {
    variable: String,
    /// Sentinel-padded copy of the source list
    items: Vec<Rval>,
    /// Current position; `None` once past the tail sentinel
    cursor: Option<usize>,
}

impl IterationWheel {
    fn new(variable: String, source: &[Rval]) -> Self {
        let mut items = Vec::with_capacity(source.len() + 2);
        items.push(Rval::scalar(NULL_VALUE));
        items.extend(source.iter().cloned());
        items.push(Rval::scalar(NULL_VALUE));
        Self {
            variable,
            items,
            // Always skip the head sentinel
            cursor: Some(1),
        }
    }

    /// The value under the cursor, or `None` past the end
    fn current(&self) -> Option<&Rval> {
        self.cursor.map(|i| &self.items[i])
    }

    /// Whether the wheel rests on a sentinel or has run past the end
    fn at_null(&self) -> bool {
        match self.current() {
            None => true,
            Some(rval) => rval.as_scalar() == Some(NULL_VALUE),
        }
    }

    /// Moves the cursor one position; past the tail it becomes `None`
    fn advance(&mut self) {
        self.cursor = match self.cursor {
            Some(i) if i + 1 < self.items.len() => Some(i + 1),
            _ => None,
        };
    }

    fn reset(&mut self) {
        self.cursor = Some(1);
    }
}

/// The wheels of one promise expansion
#[derive(Debug, Default)]
pub struct IterationContext {
    wheels: Vec<IterationWheel>,
}

impl IterationContext {
    /// Builds wheels for `variables`, copying each list's current value
    /// out of `scope`. A variable that no longer resolves aborts the
    /// promise; one that is still an unexpanded function call makes it
    /// non-iterable.
    pub fn begin(
        store: &ScopeStore,
        scope: &str,
        variables: &[String],
    ) -> EngineResult<IterationContext> {
        let mut wheels = Vec::with_capacity(variables.len());
        for variable in variables {
            let (rval, dtype) = store.get_variable(scope, variable);
            if dtype == DataType::None {
                return Err(EngineError::MissingIterationVariable {
                    variable: variable.clone(),
                    scope: scope.to_string(),
                });
            }
            match rval {
                Rval::List(items) => {
                    wheels.push(IterationWheel::new(variable.clone(), &items));
                }
                Rval::FnCall(_) => {
                    return Err(EngineError::NonIterable {
                        variable: variable.clone(),
                    });
                }
                other => {
                    // A scalar "list" iterates over its single value
                    wheels.push(IterationWheel::new(variable.clone(), &[other]));
                }
            }
        }
        debug!(scope, wheels = wheels.len(), "iteration context ready");
        Ok(IterationContext { wheels })
    }

    /// Whether this promise iterates at all
    pub fn is_wheeled(&self) -> bool {
        !self.wheels.is_empty()
    }

    /// Whether any wheel currently rests on a sentinel; such combinations
    /// produce no concrete promise
    pub fn any_null(&self) -> bool {
        self.wheels.iter().any(IterationWheel::at_null)
    }

    /// Whether every wheel has run past its tail sentinel
    pub fn finished(&self) -> bool {
        self.wheels.iter().all(|w| w.cursor.is_none())
    }

    /// Rightmost-first odometer increment. Returns false when the
    /// leftmost wheel has wrapped past its end.
    pub fn increment(&mut self) -> bool {
        if self.wheels.is_empty() {
            return false;
        }
        self.increment_at(self.wheels.len() - 1)
    }

    fn increment_at(&mut self, index: usize) -> bool {
        if self.wheels[index].cursor.is_none() {
            // This wheel has come to full revolution
            if index == 0 {
                return false;
            }
            if self.increment_at(index - 1) {
                self.wheels[index].reset();
                return true;
            }
            return false;
        }
        self.wheels[index].advance();
        true
    }

    /// The current `(variable, value)` bindings of all wheels. Only
    /// meaningful when no wheel is on a sentinel.
    pub fn bindings(&self) -> Vec<(String, Rval)> {
        self.wheels
            .iter()
            .map(|w| {
                (
                    w.variable.clone(),
                    w.current().cloned().unwrap_or(Rval::None),
                )
            })
            .collect()
    }

    /// Overwrites each wheel variable in `this` with the scalar under the
    /// cursor and demotes its datatype, so the actuator sees a promise
    /// whose list references have become concrete scalars.
    pub fn substitute(&self, store: &ScopeStore) {
        store.dereference_list_variables("this", &self.bindings());
    }
}

/// Scans a promise for `$(name)` references whose referent in `scope` is
/// currently list-typed. These are the variables the promise iterates
/// over, in first-appearance order.
pub fn list_variables_in_promise(
    store: &ScopeStore,
    scope: &str,
    promise: &Promise,
) -> Vec<String> {
    let mut found = Vec::new();
    scan_for_list_refs(store, scope, &promise.promiser, &mut found);
    collect_rval_refs(store, scope, &promise.promisee, &mut found);
    for constraint in &promise.constraints {
        collect_rval_refs(store, scope, &constraint.rval, &mut found);
    }
    found
}

fn collect_rval_refs(store: &ScopeStore, scope: &str, rval: &Rval, found: &mut Vec<String>) {
    match rval {
        Rval::Scalar(s) => scan_for_list_refs(store, scope, s, found),
        Rval::List(items) => {
            for item in items {
                collect_rval_refs(store, scope, item, found);
            }
        }
        Rval::FnCall(call) => {
            for arg in &call.args {
                collect_rval_refs(store, scope, arg, found);
            }
        }
        _ => {}
    }
}

fn scan_for_list_refs(store: &ScopeStore, scope: &str, text: &str, found: &mut Vec<String>) {
    for name in reference_names(text) {
        if found.iter().any(|f| f == &name) {
            continue;
        }
        let (_, dtype) = store.get_variable(scope, &name);
        if dtype.is_list() {
            found.push(name);
        }
    }
}

/// The names inside `$(...)`/`${...}` tokens of `text`, innermost tokens
/// excluded (a nested reference cannot be iterated until expanded)
fn reference_names(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut names = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{') {
            let close = if bytes[i + 1] == b'(' { b')' } else { b'}' };
            if let Some(end) = bytes[i + 2..].iter().position(|&b| b == close) {
                let inner = &text[i + 2..i + 2 + end];
                if !expand::is_expandable(inner) {
                    names.push(inner.to_string());
                }
                i += 2 + end + 1;
                continue;
            }
        }
        i += 1;
    }
    names
}
