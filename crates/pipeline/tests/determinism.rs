#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::Value as Json;
use xfn_core::{
    CompositeResource, Condition, Conditions, DesiredState, FunctionResult, ObservedState,
    ResourceSpec, Severity,
};
use xfn_invoke::builtin::{ClosureFunction, NetworkFunction};
use xfn_pipeline::{Composer, Pipeline, RunOutcome, Step};

fn observed_with_cidr() -> ObservedState {
    ObservedState {
        composite: CompositeResource {
            api_version: "example.org/v1".into(),
            kind: "Network".into(),
            metadata: xfn_core::ObjectMeta { name: Some("prod".into()), ..Default::default() },
            spec: serde_json::json!({ "cidr": "10.0.0.0/16", "zones": 3 }),
            status: Json::Null,
        },
        resources: Default::default(),
    }
}

fn pipeline() -> Pipeline {
    let subnets = ClosureFunction::new("subnets", |req: xfn_invoke::FunctionRequest| {
        let zones = req.observed.composite.spec["zones"].as_u64().unwrap_or(1);
        let mut delta = DesiredState::default();
        for i in 0..zones {
            delta.insert(
                format!("subnet-{i}"),
                ResourceSpec {
                    api_version: "ec2.aws.crossplane.io/v1beta1".into(),
                    kind: "Subnet".into(),
                    spec: serde_json::json!({ "vpc": { "resourceRef": "network-vpc" }, "index": i }),
                    ..Default::default()
                },
            );
        }
        let mut conditions = Conditions::new();
        conditions.push(Condition::info(format!("emitted {zones} subnets")));
        Ok(FunctionResult::Delta { delta, conditions })
    });
    Pipeline::new(vec![
        Step::new("network", Arc::new(NetworkFunction)),
        Step::new("subnets", Arc::new(subnets)),
    ])
}

fn fingerprint(outcome: &RunOutcome) -> (Vec<u8>, Vec<(Severity, String)>) {
    let desired = serde_json::to_vec(&outcome.desired).unwrap();
    let results = outcome
        .conditions
        .iter()
        .map(|c| (c.severity, c.message.clone()))
        .collect();
    (desired, results)
}

#[tokio::test]
async fn two_runs_over_fixed_input_are_byte_identical() {
    let composer = Composer::new();
    let first = composer
        .run(&pipeline(), observed_with_cidr(), None, Json::Null, None)
        .await
        .unwrap();
    let second = composer
        .run(&pipeline(), observed_with_cidr(), None, Json::Null, None)
        .await
        .unwrap();

    assert_eq!(fingerprint(&first), fingerprint(&second));
    assert_eq!(first.desired.len(), 4);
    assert!(first.desired.get("network-vpc").is_some());
}
