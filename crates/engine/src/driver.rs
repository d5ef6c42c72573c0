//! The promise evaluation driver.
//!
//! Walks a bundle in declaration order. For each promise it checks the
//! class guard, builds the iteration context over the promise's list
//! variables, and for each concrete combination binds the `this` scope,
//! acquires the transaction lock, dispatches to the actuator, and yields
//! the lock. No scope lock is held while an actuator runs.

use crate::dispatch::ActuatorRegistry;
use crate::error::{EngineError, EngineResult};
use crate::iteration::{self, IterationContext};
use converge_core::classes::ClassStore;
use converge_core::promise::{Bundle, Promise, PromiseResult, TransactionAttributes};
use converge_core::rval::{DataType, Rval};
use converge_locks::LockManager;
use converge_vars::{expand, no_functions, ScopeStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Everything one evaluation shares: scopes, classes, locks, actuators
#[derive(Clone)]
pub struct EvalContext {
    pub store: Arc<ScopeStore>,
    pub classes: Arc<ClassStore>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<ActuatorRegistry>,
    /// Host identity used in lock keys and the runlog
    pub host: String,
    /// Cap on concurrently backgrounded promises
    pub background_cap: usize,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EvalContext {
    pub fn new(
        store: Arc<ScopeStore>,
        classes: Arc<ClassStore>,
        locks: Arc<LockManager>,
        registry: Arc<ActuatorRegistry>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            classes,
            locks,
            registry,
            host: host.into(),
            background_cap: 10,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Evaluates a bundle: sets up its scope (augmented with any call
    /// parameters) and walks its promises in declaration order. Promises
    /// within one bundle see each other's variable definitions.
    pub fn evaluate_bundle(
        &self,
        bundle: &Bundle,
        params: &[Rval],
    ) -> EngineResult<Vec<PromiseResult>> {
        let scope = bundle_scope_name(bundle);
        self.store.new_scope(&scope);
        if !bundle.params.is_empty() || !params.is_empty() {
            self.store.augment(
                &scope,
                &bundle.namespace,
                &bundle.params,
                params,
                &no_functions,
            )?;
        }

        let mut results = Vec::new();
        for promise in &bundle.promises {
            results.extend(self.evaluate_promise(promise)?);
        }
        Ok(results)
    }

    /// Evaluates one promise, producing one result per concrete expansion
    pub fn evaluate_promise(&self, promise: &Promise) -> EngineResult<Vec<PromiseResult>> {
        if !self.classes.evaluate(&promise.class_guard)? {
            debug!(
                promiser = promise.promiser.as_str(),
                guard = promise.class_guard.as_str(),
                "class guard not met"
            );
            return Ok(vec![PromiseResult::Skipped]);
        }

        let txn = transaction_attributes(promise);
        if txn.background {
            return Ok(vec![self.spawn_background(promise.clone())]);
        }

        self.apply_promise(promise)
    }

    /// Blocks until every backgrounded promise has finished
    pub fn wait_for_background(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("backgrounded promise panicked");
            }
        }
    }

    fn spawn_background(&self, promise: Promise) -> PromiseResult {
        let mut pool = self.background.lock();
        pool.retain(|h| !h.is_finished());
        if pool.len() >= self.background_cap {
            warn!(
                promiser = promise.promiser.as_str(),
                cap = self.background_cap,
                "background thread cap reached, skipping"
            );
            return PromiseResult::Skipped;
        }

        let ctx = self.clone();
        pool.push(std::thread::spawn(move || {
            match ctx.apply_promise(&promise) {
                Ok(results) => debug!(
                    promiser = promise.promiser.as_str(),
                    count = results.len(),
                    "backgrounded promise finished"
                ),
                Err(e) => error!(
                    promiser = promise.promiser.as_str(),
                    error = %e,
                    "backgrounded promise failed"
                ),
            }
        }));
        PromiseResult::NoOp
    }

    fn apply_promise(&self, promise: &Promise) -> EngineResult<Vec<PromiseResult>> {
        let scope = promise.defining_scope();
        self.store.new_scope(&scope);

        // A fresh current-promise scope from the defining one
        self.store.delete_scope("this");
        self.store.copy_scope("this", &scope);

        let list_vars = iteration::list_variables_in_promise(&self.store, &scope, promise);
        let mut ctx = match IterationContext::begin(&self.store, &scope, &list_vars) {
            Ok(ctx) => ctx,
            Err(EngineError::NonIterable { variable }) => {
                warn!(
                    promiser = promise.promiser.as_str(),
                    variable = variable.as_str(),
                    "promise iterates an unexpanded function call, skipping"
                );
                self.store.delete_scope("this");
                return Ok(vec![PromiseResult::Skipped]);
            }
            Err(EngineError::MissingIterationVariable { variable, scope }) => {
                error!(
                    promiser = promise.promiser.as_str(),
                    variable = variable.as_str(),
                    scope = scope.as_str(),
                    "couldn't locate iterated variable, promise fails"
                );
                self.store.delete_scope("this");
                return Ok(vec![PromiseResult::Fail]);
            }
            Err(other) => {
                self.store.delete_scope("this");
                return Err(other);
            }
        };

        let mut results = Vec::new();
        loop {
            if !ctx.any_null() {
                ctx.substitute(&self.store);
                results.push(self.apply_concrete(promise)?);
            }
            if !ctx.is_wheeled() || !ctx.increment() {
                break;
            }
        }

        self.store.delete_scope("this");
        Ok(results)
    }

    /// Applies one concrete expansion: expand rvalues against `this`,
    /// bind the reserved variables, then run the lock envelope around the
    /// actuator.
    fn apply_concrete(&self, promise: &Promise) -> EngineResult<PromiseResult> {
        let concrete = self.concretise(promise);

        self.store
            .put_scalar("this", "promiser", &concrete.promiser, DataType::String);
        let promisee = concrete.promisee.to_string();
        self.store
            .put_scalar("this", "promisee", &promisee, DataType::String);
        self.store
            .put_scalar("this", "bundle", &concrete.bundle, DataType::String);
        self.store
            .put_scalar("this", "namespace", &concrete.namespace, DataType::String);

        let Some(actuator) = self.registry.get(&concrete.promise_type) else {
            warn!(
                promise_type = concrete.promise_type.as_str(),
                promiser = concrete.promiser.as_str(),
                "no actuator registered for promise type"
            );
            return Ok(PromiseResult::Skipped);
        };

        let txn = transaction_attributes(&concrete);
        let now = unix_now();
        let lock = self.locks.acquire(
            &concrete.promise_type,
            &concrete.promiser,
            &self.host,
            &concrete.bundle,
            now,
            &txn,
        )?;
        let Some(lock) = lock else {
            debug!(
                promiser = concrete.promiser.as_str(),
                "promise is locked out or recently kept"
            );
            return Ok(PromiseResult::Skipped);
        };

        let result = actuator.dispatch(&concrete, &self.store, &lock);

        self.locks.yield_lock(&lock, &self.host, unix_now())?;
        Ok(result)
    }

    /// A copy of the promise with every rvalue expanded in the `this`
    /// scope: naked list references spliced, scalar references substituted
    fn concretise(&self, promise: &Promise) -> Promise {
        let mut concrete = promise.clone();
        let (promiser, _) = expand::expand_scalar(&self.store, "this", &promise.promiser);
        concrete.promiser = promiser;
        concrete.promisee = self.expand_rval(&promise.promisee);
        for constraint in &mut concrete.constraints {
            constraint.rval = self.expand_rval(&constraint.rval);
        }
        concrete
    }

    fn expand_rval(&self, rval: &Rval) -> Rval {
        let spliced = expand::copy_rval_in_context(&self.store, "this", rval);
        expand::expand_private_rval(&self.store, "this", &spliced)
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("host", &self.host)
            .field("background_cap", &self.background_cap)
            .finish()
    }
}

fn bundle_scope_name(bundle: &Bundle) -> String {
    if bundle.namespace == converge_core::constants::DEFAULT_NAMESPACE {
        bundle.name.clone()
    } else {
        format!("{}:{}", bundle.namespace, bundle.name)
    }
}

/// Reads the locking attributes out of a promise's constraint body
pub fn transaction_attributes(promise: &Promise) -> TransactionAttributes {
    let mut txn = TransactionAttributes::default();
    if let Some(Rval::Scalar(s)) = promise.constraint("if_elapsed") {
        if let Ok(minutes) = s.parse() {
            txn.if_elapsed = minutes;
        }
    }
    if let Some(Rval::Scalar(s)) = promise.constraint("expire_after") {
        if let Ok(minutes) = s.parse() {
            txn.expire_after = minutes;
        }
    }
    if let Some(Rval::Scalar(s)) = promise.constraint("background") {
        txn.background = s == "true" || s == "yes";
    }
    txn
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ReportsActuator;
    use converge_core::promise::Constraint;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context_with_reports(dir: &TempDir) -> (EvalContext, Arc<Mutex<Vec<String>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActuatorRegistry::new();
        registry.register("reports", Box::new(ReportsActuator::with_sink(sink.clone())));

        let locks = LockManager::open(dir.path()).expect("lock db opens");
        let ctx = EvalContext::new(
            Arc::new(ScopeStore::new()),
            Arc::new(ClassStore::new()),
            Arc::new(locks),
            Arc::new(registry),
            "testhost",
        );
        (ctx, sink)
    }

    /// vars: "list" slist => { "a", "b" }; reports: "$(list)";
    #[test]
    fn test_list_report_expands_in_order() {
        let dir = TempDir::new().expect("temp dir");
        let (ctx, sink) = context_with_reports(&dir);

        let mut bundle = Bundle::new("agent", "main");
        ctx.store.new_scope("main");
        ctx.store.put_list(
            "main",
            "list",
            vec![Rval::scalar("a"), Rval::scalar("b")],
            DataType::StringList,
        );
        let mut report = Promise::new("reports", "$(list)", "main");
        // Locking would suppress the second expansion within if_elapsed
        report
            .constraints
            .push(Constraint::new("if_elapsed", Rval::scalar("0")));
        bundle.promises.push(report);

        let results = ctx.evaluate_bundle(&bundle, &[]).expect("bundle evaluates");
        assert_eq!(
            results,
            vec![PromiseResult::Repaired, PromiseResult::Repaired]
        );
        assert_eq!(*sink.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_class_guard_skips_promise() {
        let dir = TempDir::new().expect("temp dir");
        let (ctx, sink) = context_with_reports(&dir);

        ctx.store.new_scope("main");
        let mut promise = Promise::new("reports", "never", "main");
        promise.class_guard = "undefined_class".to_string();

        let results = ctx.evaluate_promise(&promise).expect("evaluates");
        assert_eq!(results, vec![PromiseResult::Skipped]);
        assert!(sink.lock().is_empty());
    }

    #[test]
    fn test_unregistered_type_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let (ctx, _sink) = context_with_reports(&dir);

        ctx.store.new_scope("main");
        let promise = Promise::new("martian", "x", "main");
        let results = ctx.evaluate_promise(&promise).expect("evaluates");
        assert_eq!(results, vec![PromiseResult::Skipped]);
    }

    #[test]
    fn test_scalar_promise_applies_once() {
        let dir = TempDir::new().expect("temp dir");
        let (ctx, sink) = context_with_reports(&dir);

        ctx.store.new_scope("main");
        ctx.store
            .put_scalar("main", "greeting", "hello", DataType::String);
        let promise = Promise::new("reports", "$(greeting) world", "main");

        let results = ctx.evaluate_promise(&promise).expect("evaluates");
        assert_eq!(results, vec![PromiseResult::Repaired]);
        assert_eq!(*sink.lock(), vec!["hello world".to_string()]);
    }

    #[test]
    fn test_second_run_within_if_elapsed_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let (ctx, sink) = context_with_reports(&dir);

        ctx.store.new_scope("main");
        let mut promise = Promise::new("reports", "ping", "main");
        promise
            .constraints
            .push(Constraint::new("if_elapsed", Rval::scalar("5")));

        let first = ctx.evaluate_promise(&promise).expect("evaluates");
        assert_eq!(first, vec![PromiseResult::Repaired]);
        let second = ctx.evaluate_promise(&promise).expect("evaluates");
        assert_eq!(second, vec![PromiseResult::Skipped]);
        assert_eq!(sink.lock().len(), 1);
    }
}
