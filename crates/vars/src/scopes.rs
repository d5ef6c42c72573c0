//! The scope store: a process-wide registry of named variable scopes.
//!
//! Each scope owns an [`AssocTable`]. The reserved scope `this` is the
//! current-promise scope, re-created for each promise evaluated; `sys`
//! holds read-only inventory and `mon` monitoring observations. Nested
//! bundle calls push the current `this` onto a stack frame under a rotating
//! `this_<depth>` name and pop it back afterwards.
//!
//! Mutating operations serialise on a writer lock; lookups take a shared
//! (recursive) read lock so expansion may re-enter the store. Callers must
//! not hold any scope lock while invoking actuators.

use crate::assoc::{Association, AssocTable};
use crate::error::{VarsError, VarsResult};
use crate::expand;
use converge_core::constants::{DEFAULT_NAMESPACE, MAX_VAR_SIZE, NAMESPACE_SEP};
use converge_core::rval::{self, DataType, Equality, FnCall, Rval};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// External evaluator for unexpanded function calls met during scope
/// augmentation. Returns `None` when the call cannot be resolved yet.
pub type FnCallEvaluator<'a> = &'a dyn Fn(&FnCall) -> Option<Rval>;

/// An evaluator that resolves nothing; for contexts without functions
pub fn no_functions(_call: &FnCall) -> Option<Rval> {
    None
}

#[derive(Debug)]
struct Scope {
    name: String,
    table: AssocTable,
}

/// Registry of named scopes plus the `this` stack discipline
#[derive(Debug)]
pub struct ScopeStore {
    scopes: RwLock<Vec<Scope>>,
    /// Names of the saved frames, innermost last
    frames: Mutex<Vec<String>>,
}

/// Strips a leading `default:` namespace qualifier
fn strip_default(name: &str) -> &str {
    let prefix_len = DEFAULT_NAMESPACE.len();
    if name.len() > prefix_len
        && name.as_bytes()[prefix_len] == NAMESPACE_SEP as u8
        && name.starts_with(DEFAULT_NAMESPACE)
    {
        &name[prefix_len + 1..]
    } else {
        name
    }
}

/// Splits a qualified variable name at the first scope separator
fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
}

impl ScopeStore {
    /// Creates a store with the reserved inventory scopes present
    pub fn new() -> Self {
        let store = Self {
            scopes: RwLock::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
        };
        for reserved in ["const", "sys", "mon"] {
            store.new_scope(reserved);
        }
        store
    }

    /// Creates a scope. Idempotent: a second call with the same name is a
    /// no-op and does not clear existing contents.
    pub fn new_scope(&self, name: &str) {
        let name = strip_default(name);
        let mut scopes = self.scopes.write();
        if scopes.iter().any(|s| s.name == name) {
            debug!(scope = name, "scope already exists");
            return;
        }
        scopes.push(Scope {
            name: name.to_string(),
            table: AssocTable::new(),
        });
    }

    /// Whether a scope of this name exists
    pub fn scope_exists(&self, name: &str) -> bool {
        let name = strip_default(name);
        self.scopes.read_recursive().iter().any(|s| s.name == name)
    }

    /// Deletes a scope and every association it owns
    pub fn delete_scope(&self, name: &str) {
        let name = strip_default(name);
        let mut scopes = self.scopes.write();
        if let Some(pos) = scopes.iter().position(|s| s.name == name) {
            scopes.remove(pos);
        } else {
            debug!(scope = name, "no such scope to delete");
        }
    }

    /// Creates `dst` if needed, then copies every association of `src`
    /// into it by the logical insert (existing keys win)
    pub fn copy_scope(&self, dst: &str, src: &str) {
        self.new_scope(dst);
        let dst = strip_default(dst).to_string();
        let src = strip_default(src).to_string();

        let mut scopes = self.scopes.write();
        let Some(src_pos) = scopes.iter().position(|s| s.name == src) else {
            return;
        };
        let entries: Vec<Association> = scopes[src_pos].table.iter().cloned().collect();
        if let Some(dst_scope) = scopes.iter_mut().find(|s| s.name == dst) {
            for assoc in &entries {
                dst_scope.table.insert(&assoc.lval, &assoc.rval, assoc.dtype);
            }
        }
    }

    /// Number of live associations in a scope, zero when absent
    pub fn scope_len(&self, name: &str) -> usize {
        let name = strip_default(name);
        self.scopes
            .read_recursive()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.table.len())
            .unwrap_or(0)
    }

    /// The variable names bound in a scope
    pub fn scope_lvals(&self, name: &str) -> Vec<String> {
        let name = strip_default(name);
        self.scopes
            .read_recursive()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.table.iter().map(|a| a.lval.clone()).collect())
            .unwrap_or_default()
    }

    /// Resolves a variable. A qualified lval (`scope.name`) is looked up in
    /// the named scope, a bare one in `scope_hint`. The lval may itself
    /// contain references, which are expanded first in a single pass; an
    /// undefined dependency yields `DataType::None` with the unresolved
    /// lval echoed back as a scalar.
    pub fn get_variable(&self, scope_hint: &str, lval: &str) -> (Rval, DataType) {
        if lval.is_empty() {
            return (Rval::None, DataType::None);
        }

        let resolved;
        let name = if expand::is_expandable(lval) {
            let (expanded, fully) = expand::expand_scalar(self, scope_hint, lval);
            if !fully {
                debug!(lval, "lval has undefined dependencies");
                return (Rval::scalar(lval), DataType::None);
            }
            resolved = expanded;
            resolved.as_str()
        } else {
            lval
        };

        let (scope_name, var_name) = match split_qualified(name) {
            Some((scope, var)) => (strip_default(scope), var),
            None => (strip_default(scope_hint), name),
        };

        let scopes = self.scopes.read_recursive();
        let Some(scope) = scopes.iter().find(|s| s.name == scope_name) else {
            debug!(scope = scope_name, lval, "scope does not exist");
            return (Rval::scalar(lval), DataType::None);
        };
        match scope.table.lookup(var_name) {
            Some(assoc) => (assoc.rval.clone(), assoc.dtype),
            None => (Rval::scalar(lval), DataType::None),
        }
    }

    /// Installs or replaces a scalar binding. See [`Self::add_variable`].
    pub fn put_scalar(&self, scope: &str, lval: &str, value: &str, dtype: DataType) -> bool {
        self.add_variable(scope, lval, Rval::scalar(value), dtype)
    }

    /// Installs or replaces a list binding. See [`Self::add_variable`].
    pub fn put_list(&self, scope: &str, lval: &str, items: Vec<Rval>, dtype: DataType) -> bool {
        self.add_variable(scope, lval, Rval::List(items), dtype)
    }

    /// Installs a binding. A non-convergent value (one that references the
    /// lval being defined) refuses the write and keeps any prior value. A
    /// replacement that differs from the existing value draws a
    /// redefinition warning unless either side is still unresolved.
    /// Returns whether the binding was stored.
    pub fn add_variable(&self, scope: &str, lval: &str, rval: Rval, dtype: DataType) -> bool {
        if matches!(rval, Rval::None) {
            debug!(lval, "no value to assign; parameter of an unused body");
            return false;
        }
        if lval.len() > MAX_VAR_SIZE {
            error!(lval, "variable lval too long");
            return false;
        }

        // Bodies are templates; their parameters legitimately self-mention
        if scope != "body" && rval.contains_self_reference(lval) {
            error!(
                scope,
                lval,
                value = %rval,
                "variable contains itself (non-convergent)"
            );
            return false;
        }

        let scope_name = strip_default(scope);
        let mut scopes = self.scopes.write();
        let Some(entry) = scopes.iter_mut().find(|s| s.name == scope_name) else {
            error!(scope = scope_name, lval, "attempt to add variable to non-existent scope");
            return false;
        };

        if let Some(existing) = entry.table.lookup_mut(lval) {
            match existing.rval.equals(&rval) {
                Equality::Equal => {
                    // Identical value, keep as is
                }
                verdict => {
                    if verdict == Equality::NotEqual {
                        warn!(
                            scope = scope_name,
                            lval, "duplicate selection of value for variable"
                        );
                    }
                    existing.rval = rval;
                    existing.dtype = dtype;
                }
            }
            return true;
        }

        if !entry.table.insert(lval, &rval, dtype) {
            // The huge table has a fixed capacity; running out is a
            // programming-invariant violation, not a policy error.
            panic!(
                "variable table full inserting {}.{} ({} entries)",
                scope_name,
                lval,
                entry.table.len()
            );
        }
        true
    }

    /// Deletes one binding from a scope
    pub fn delete_variable(&self, scope: &str, lval: &str) -> bool {
        let scope_name = strip_default(scope);
        let mut scopes = self.scopes.write();
        match scopes.iter_mut().find(|s| s.name == scope_name) {
            Some(entry) => entry.table.delete(lval),
            None => false,
        }
    }

    /// Whether a variable resolves in the current-promise scope
    pub fn variable_exists_in_this(&self, name: &str) -> bool {
        !matches!(self.get_variable("this", name), (_, DataType::None))
    }

    /// Saves the current `this` scope under a rotating frame name. The
    /// caller is entering a nested bundle evaluation.
    pub fn push_this(&self) {
        let mut frames = self.frames.lock();
        let mut scopes = self.scopes.write();
        let Some(scope) = scopes.iter_mut().find(|s| s.name == "this") else {
            return;
        };
        let frame_name = format!("this_{}", frames.len() + 1);
        scope.name = frame_name.clone();
        frames.push(frame_name);
    }

    /// Restores the most recently pushed `this` scope, deleting the one
    /// the nested evaluation left behind
    pub fn pop_this(&self) {
        let mut frames = self.frames.lock();
        let Some(frame_name) = frames.pop() else {
            return;
        };
        let mut scopes = self.scopes.write();
        if let Some(pos) = scopes.iter().position(|s| s.name == "this") {
            scopes.remove(pos);
        }
        if let Some(scope) = scopes.iter_mut().find(|s| s.name == frame_name) {
            scope.name = "this".to_string();
        }
    }

    /// Depth of the `this` stack
    pub fn frame_depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Installs positional bundle parameters into `scope`. Naked list
    /// arguments `@(x)` are resolved to their typed list value; function
    /// calls are evaluated through `fn_eval` and must return scalars. After
    /// installation every rvalue left in the scope is expanded once more to
    /// catch danglers. A length mismatch is fatal to the promise.
    pub fn augment(
        &self,
        scope: &str,
        namespace: &str,
        lvals: &[String],
        rvals: &[Rval],
        fn_eval: FnCallEvaluator<'_>,
    ) -> VarsResult<()> {
        if lvals.len() != rvals.len() {
            return Err(VarsError::ParameterMismatch {
                scope: scope.to_string(),
                formal: lvals.len(),
                actual: rvals.len(),
            });
        }

        for (lval, actual) in lvals.iter().zip(rvals.iter()) {
            debug!(scope, lval, "augmenting scope");

            if let Some(raw) = actual.as_scalar() {
                if rval::is_naked_var(raw, '@') {
                    let naked = rval::get_naked(raw);
                    let qualified;
                    let name = if split_qualified(naked).is_some()
                        && !naked.contains(NAMESPACE_SEP)
                        && namespace != DEFAULT_NAMESPACE
                    {
                        qualified = format!("{}{}{}", namespace, NAMESPACE_SEP, naked);
                        qualified.as_str()
                    } else {
                        naked
                    };

                    match self.get_variable(scope, name) {
                        (Rval::List(items), dtype) if dtype.is_list() => {
                            self.put_list(scope, lval, items, DataType::StringList);
                        }
                        _ => {
                            error!(
                                parameter = name,
                                scope,
                                "list parameter not found while constructing scope - use @(scope.variable) in the calling reference"
                            );
                            self.put_scalar(scope, lval, raw, DataType::String);
                        }
                    }
                    continue;
                }
            }

            match actual {
                Rval::Scalar(s) => {
                    self.put_scalar(scope, lval, s, DataType::String);
                }
                Rval::List(items) => {
                    self.put_list(scope, lval, items.clone(), DataType::StringList);
                }
                Rval::FnCall(call) => match fn_eval(call) {
                    Some(Rval::Scalar(s)) => {
                        self.put_scalar(scope, lval, &s, DataType::String);
                    }
                    _ => {
                        error!(
                            function = %call.name,
                            "only functions returning scalars can be used as arguments"
                        );
                        self.put_scalar(scope, lval, "", DataType::String);
                    }
                },
                _ => {
                    error!(scope, lval, "argument neither a scalar nor a list");
                }
            }
        }

        self.expand_danglers(scope);
        Ok(())
    }

    /// Maps body-template arguments: as [`Self::augment`] but datatype
    /// mismatches between logical and formal parameters are reported
    /// without aborting.
    pub fn map_body_args(
        &self,
        scope: &str,
        give: &[Rval],
        take: &[String],
        fn_eval: FnCallEvaluator<'_>,
    ) -> VarsResult<()> {
        if give.len() != take.len() {
            return Err(VarsError::ParameterMismatch {
                scope: scope.to_string(),
                formal: take.len(),
                actual: give.len(),
            });
        }

        for (actual, formal) in give.iter().zip(take.iter()) {
            let given_type = self.infer_datatype(scope, actual);
            let formal_type = self.infer_datatype(scope, &Rval::scalar(formal.as_str()));
            if given_type != DataType::None
                && formal_type != DataType::None
                && given_type != formal_type
            {
                warn!(
                    formal = formal.as_str(),
                    ?given_type,
                    ?formal_type,
                    "type mismatch between logical and formal parameters"
                );
            }
            match actual {
                Rval::Scalar(s) => {
                    self.add_variable(scope, formal, Rval::scalar(s.as_str()), given_type);
                }
                Rval::List(items) => {
                    self.add_variable(
                        scope,
                        formal,
                        Rval::List(items.clone()),
                        DataType::StringList,
                    );
                }
                Rval::FnCall(call) => match fn_eval(call) {
                    Some(Rval::Scalar(s)) => {
                        self.add_variable(scope, formal, Rval::scalar(s.as_str()), DataType::String);
                    }
                    Some(other) => {
                        warn!(
                            function = %call.name,
                            formal,
                            returned = %other,
                            "body argument function did not return a scalar"
                        );
                    }
                    None => {
                        warn!(
                            function = %call.name,
                            formal,
                            "embedded function argument does not resolve - probably too many evaluation levels"
                        );
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    /// Inside the iteration loop: overwrite each list-typed variable with
    /// the current wheel scalar and collapse its datatype to the scalar
    /// equivalent. A binding whose current value is a function call (or a
    /// wheel with no current value) aborts the substitution.
    pub fn dereference_list_variables(&self, scope: &str, bindings: &[(String, Rval)]) {
        if bindings.is_empty() {
            return;
        }
        if bindings
            .iter()
            .any(|(_, v)| matches!(v, Rval::FnCall(_) | Rval::None))
        {
            // Unexpanded function or blank wheel state must be skipped
            return;
        }

        let scope_name = strip_default(scope);
        let mut scopes = self.scopes.write();
        let Some(entry) = scopes.iter_mut().find(|s| s.name == scope_name) else {
            return;
        };
        for (name, value) in bindings {
            if let Some(assoc) = entry.table.lookup_mut(name) {
                debug!(
                    variable = name.as_str(),
                    value = %value,
                    "rewriting list variable to iteration scalar"
                );
                assoc.rval = value.clone();
                assoc.dtype = assoc.dtype.scalar_equivalent();
            }
        }
    }

    /// Best-effort datatype of an actual argument, following references
    fn infer_datatype(&self, scope: &str, actual: &Rval) -> DataType {
        match actual {
            Rval::Scalar(s) => {
                if rval::is_naked_var(s, '@') || rval::is_naked_var(s, '$') {
                    let (_, dtype) = self.get_variable(scope, rval::get_naked(s));
                    if dtype == DataType::None {
                        DataType::String
                    } else {
                        dtype
                    }
                } else {
                    DataType::String
                }
            }
            Rval::List(_) => DataType::StringList,
            Rval::Container(_) => DataType::Container,
            _ => DataType::None,
        }
    }

    /// Expands every rvalue left in `scope` once, in place. Values that do
    /// not fully resolve are kept as far as they got.
    fn expand_danglers(&self, scope: &str) {
        let lvals = self.scope_lvals(scope);
        for lval in lvals {
            let scope_name = strip_default(scope).to_string();
            let current = {
                let scopes = self.scopes.read_recursive();
                scopes
                    .iter()
                    .find(|s| s.name == scope_name)
                    .and_then(|s| s.table.lookup(&lval))
                    .map(|a| a.rval.clone())
            };
            let Some(current) = current else { continue };
            let expanded = expand::expand_private_rval(self, scope, &current);
            if expanded != current {
                let mut scopes = self.scopes.write();
                if let Some(entry) = scopes.iter_mut().find(|s| s.name == scope_name) {
                    if let Some(assoc) = entry.table.lookup_mut(&lval) {
                        assoc.rval = expanded;
                    }
                }
            }
        }
    }
}

impl Default for ScopeStore {
    fn default() -> Self {
        Self::new()
    }
}
