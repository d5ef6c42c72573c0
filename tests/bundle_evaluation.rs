//! Whole-stack evaluation of a small bundle through the public surface.

use converge::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

/// bundle agent main {
///   vars:    "list" slist => { "a", "b" };
///   reports: "$(list)";
/// }
#[test]
fn test_list_driven_reports_run_in_order() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let work_dir = TempDir::new().expect("work dir");
    let sink = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ActuatorRegistry::new();
    registry.register(
        "reports",
        Box::new(ReportsActuator::with_sink(sink.clone())),
    );

    let store = Arc::new(ScopeStore::new());
    let classes = Arc::new(ClassStore::new());
    classes.define_hard("linux");

    let ctx = EvalContext::new(
        store.clone(),
        classes,
        Arc::new(LockManager::open(work_dir.path()).expect("lock db opens")),
        Arc::new(registry),
        "node1.example.com",
    );

    let mut bundle = Bundle::new("agent", "main");
    store.new_scope("main");
    store.put_list(
        "main",
        "list",
        vec![Rval::scalar("a"), Rval::scalar("b")],
        DataType::StringList,
    );
    let mut report = Promise::new("reports", "$(list)", "main");
    report.class_guard = "linux".to_string();
    bundle.promises.push(report);

    let results = ctx.evaluate_bundle(&bundle, &[]).expect("bundle evaluates");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| *r == PromiseResult::Repaired));
    assert_eq!(*sink.lock(), vec!["a".to_string(), "b".to_string()]);
}
