#![forbid(unsafe_code)]

use xfn_core::{DesiredState, EngineError, ObjectMeta, ObservedState, ResourceSpec};
use xfn_store::{MergePolicy, StateStore};

fn spec(api_version: &str, kind: &str, body: serde_json::Value) -> ResourceSpec {
    ResourceSpec {
        api_version: api_version.into(),
        kind: kind.into(),
        metadata: Some(ObjectMeta { name: Some("obj".into()), ..Default::default() }),
        spec: body,
        ..Default::default()
    }
}

fn delta(entries: Vec<(&str, ResourceSpec)>) -> DesiredState {
    let mut d = DesiredState::default();
    for (k, s) in entries {
        d.insert(k, s);
    }
    d
}

#[test]
fn insert_then_identical_reassert_is_idempotent() {
    let mut store = StateStore::new(ObservedState::default());
    let db = spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "small" }));

    store.merge(delta(vec![("db", db.clone())])).unwrap();
    store.merge(delta(vec![("db", db.clone())])).unwrap();

    let desired = store.into_desired();
    assert_eq!(desired.len(), 1);
    assert_eq!(desired.get("db"), Some(&db));
}

#[test]
fn different_kind_on_same_key_conflicts() {
    let mut store = StateStore::new(ObservedState::default());
    store
        .merge(delta(vec![("db", spec("sql.example.org/v1", "Database", serde_json::Value::Null))]))
        .unwrap();

    let err = store
        .merge(delta(vec![("db", spec("kv.example.org/v1", "Bucket", serde_json::Value::Null))]))
        .unwrap_err();
    match err {
        EngineError::Conflict { key, reason } => {
            assert_eq!(key, "db");
            assert!(reason.contains("Bucket"), "reason={}", reason);
            assert!(reason.contains("Database"), "reason={}", reason);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn same_type_respec_replaces_under_default_policy() {
    let mut store = StateStore::new(ObservedState::default());
    store
        .merge(delta(vec![("db", spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "small" })))]))
        .unwrap();
    store
        .merge(delta(vec![("db", spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "large" })))]))
        .unwrap();

    let desired = store.into_desired();
    assert_eq!(desired.get("db").unwrap().spec["size"], "large");
}

#[test]
fn deny_respec_policy_rejects_non_identical_reclaim() {
    let mut store = StateStore::with_policy(ObservedState::default(), MergePolicy::DenyRespec);
    let small = spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "small" }));
    store.merge(delta(vec![("db", small.clone())])).unwrap();

    // Identical re-assertion stays allowed.
    store.merge(delta(vec![("db", small)])).unwrap();

    let err = store
        .merge(delta(vec![("db", spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "large" })))]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
    assert_eq!(store.desired().get("db").unwrap().spec["size"], "small");
}

#[test]
fn conflicting_delta_applies_nothing() {
    let mut store = StateStore::new(ObservedState::default());
    store
        .merge(delta(vec![("db", spec("sql.example.org/v1", "Database", serde_json::Value::Null))]))
        .unwrap();

    // One fresh entry plus one conflicting entry: the merge is atomic.
    let err = store
        .merge(delta(vec![
            ("cache", spec("kv.example.org/v1", "Cache", serde_json::Value::Null)),
            ("db", spec("kv.example.org/v1", "Bucket", serde_json::Value::Null)),
        ]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
    assert_eq!(store.desired().len(), 1);
    assert!(store.desired().get("cache").is_none());
}

#[test]
fn seeded_prior_state_is_visible_and_mergeable() {
    let mut prior = DesiredState::default();
    prior.insert("db", spec("sql.example.org/v1", "Database", serde_json::json!({ "size": "small" })));

    let mut store = StateStore::new(ObservedState::default()).seed(prior);
    let (_, desired) = store.snapshot();
    assert_eq!(desired.len(), 1);

    let err = store
        .merge(delta(vec![("db", spec("kv.example.org/v1", "Bucket", serde_json::Value::Null))]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
}

#[test]
fn snapshot_is_detached_from_store_internals() {
    let mut store = StateStore::new(ObservedState::default());
    let (_, mut desired) = store.snapshot();
    desired.insert("rogue", spec("v1", "Rogue", serde_json::Value::Null));
    assert!(store.desired().is_empty());
    store.merge(delta(vec![])).unwrap();
    assert!(store.into_desired().is_empty());
}
