#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;
use xfn_core::{
    Condition, Conditions, DesiredState, EngineError, FunctionResult, ObservedState, ResourceSpec,
};
use xfn_invoke::builtin::ClosureFunction;
use xfn_pipeline::{Composer, Pipeline, Step};

fn simple(api_version: &str, kind: &str) -> ResourceSpec {
    ResourceSpec { api_version: api_version.into(), kind: kind.into(), ..Default::default() }
}

fn emits(key: &'static str, kind: &'static str) -> ClosureFunction<impl Fn(xfn_invoke::FunctionRequest) -> anyhow::Result<FunctionResult> + Send + Sync> {
    ClosureFunction::new(format!("emit-{key}"), move |_req| {
        let mut delta = DesiredState::default();
        delta.insert(key, simple("v1", kind));
        Ok(FunctionResult::delta(delta))
    })
}

#[tokio::test]
async fn each_step_sees_exactly_the_prior_merges() {
    let seen_by_second = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = Arc::clone(&seen_by_second);

    let observer = ClosureFunction::new("observer", move |req| {
        *seen.lock().unwrap() = req.desired.resources.keys().cloned().collect();
        Ok(FunctionResult::empty())
    });

    let pipeline = Pipeline::new(vec![
        Step::new("first", Arc::new(emits("a", "A"))),
        Step::new("observer", Arc::new(observer)),
        Step::new("third", Arc::new(emits("c", "C"))),
    ]);

    let outcome = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap();

    // Step 2 observed step 1's contribution and nothing from step 3.
    assert_eq!(*seen_by_second.lock().unwrap(), vec!["a".to_string()]);
    let keys: Vec<&String> = outcome.desired.resources.keys().collect();
    assert_eq!(keys, vec!["a", "c"]);
}

#[tokio::test]
async fn fatal_short_circuits_and_names_the_failing_step() {
    let third_ran = Arc::new(AtomicUsize::new(0));
    let fourth_ran = Arc::new(AtomicUsize::new(0));
    let c3 = Arc::clone(&third_ran);
    let c4 = Arc::clone(&fourth_ran);

    let pipeline = Pipeline::new(vec![
        Step::new("one", Arc::new(emits("a", "A"))),
        Step::new("two", Arc::new(ClosureFunction::new("two", |_req| Ok(FunctionResult::fatal("cannot derive"))))),
        Step::new("three", Arc::new(ClosureFunction::new("three", move |_req| {
            c3.fetch_add(1, Ordering::SeqCst);
            Ok(FunctionResult::empty())
        }))),
        Step::new("four", Arc::new(ClosureFunction::new("four", move |_req| {
            c4.fetch_add(1, Ordering::SeqCst);
            Ok(FunctionResult::empty())
        }))),
    ]);

    let err = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap_err();

    match err.error {
        EngineError::Fatal { function, message } => {
            assert_eq!(function, "two");
            assert_eq!(message, "cannot derive");
        }
        other => panic!("expected fatal, got {other:?}"),
    }
    assert_eq!(third_ran.load(Ordering::SeqCst), 0);
    assert_eq!(fourth_ran.load(Ordering::SeqCst), 0);
    // Earlier merges are retained for diagnostics only.
    assert!(err.partial_desired.get("a").is_some());
}

#[tokio::test]
async fn conflicting_claims_abort_the_run() {
    let pipeline = Pipeline::new(vec![
        Step::new("one", Arc::new(emits("db", "Database"))),
        Step::new("two", Arc::new(emits("db", "Bucket"))),
    ]);

    let err = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap_err();
    assert!(matches!(err.error, EngineError::Conflict { ref key, .. } if key == "db"));
}

#[tokio::test]
async fn identical_claims_are_idempotent() {
    let pipeline = Pipeline::new(vec![
        Step::new("one", Arc::new(emits("db", "Database"))),
        Step::new("two", Arc::new(emits("db", "Database"))),
    ]);

    let outcome = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap();
    assert_eq!(outcome.desired.len(), 1);
}

#[tokio::test]
async fn warnings_are_recorded_and_the_run_continues() {
    let warns = ClosureFunction::new("warns", |_req| {
        let mut conditions = Conditions::new();
        conditions.push(Condition::warning("falling back to defaults"));
        Ok(FunctionResult::Delta { delta: DesiredState::default(), conditions })
    });

    let pipeline = Pipeline::new(vec![
        Step::new("warns", Arc::new(warns)),
        Step::new("after", Arc::new(emits("a", "A"))),
    ]);

    let outcome = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap();
    assert_eq!(outcome.conditions.len(), 1);
    assert_eq!(outcome.conditions[0].function.as_deref(), Some("warns"));
    assert_eq!(outcome.desired.len(), 1);
}

#[tokio::test]
async fn invalid_final_state_is_a_validation_error_with_every_violation() {
    let bad = ClosureFunction::new("bad", |_req| {
        let mut delta = DesiredState::default();
        // Missing kind on "a"; "b" dangles a reference to "c".
        delta.insert("a", ResourceSpec { api_version: "v1".into(), ..Default::default() });
        delta.insert(
            "b",
            ResourceSpec {
                api_version: "v1".into(),
                kind: "T".into(),
                spec: serde_json::json!({ "resourceRef": "c" }),
                ..Default::default()
            },
        );
        Ok(FunctionResult::delta(delta))
    });

    let pipeline = Pipeline::new(vec![Step::new("bad", Arc::new(bad))]);
    let err = Composer::new()
        .run(&pipeline, ObservedState::default(), None, Json::Null, None)
        .await
        .unwrap_err();
    match err.error {
        EngineError::Validation(report) => {
            let keys: Vec<&str> = report.violations.iter().map(|v| v.key.as_str()).collect();
            assert_eq!(keys, vec!["a", "b"]);
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn prior_desired_state_seeds_the_run() {
    let mut prior = DesiredState::default();
    prior.insert("carried", simple("v1", "Carried"));

    let pipeline = Pipeline::new(vec![Step::new("adds", Arc::new(emits("fresh", "Fresh")))]);
    let outcome = Composer::new()
        .run(&pipeline, ObservedState::default(), Some(prior), Json::Null, None)
        .await
        .unwrap();
    assert_eq!(outcome.desired.len(), 2);
    assert!(outcome.desired.get("carried").is_some());
}
