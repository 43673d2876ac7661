//! xfn public engine façade (in-process).
//!
//! Defines the stable documents and trait hosting layers depend on.
//! Implementations can be in-process (direct) or remote (RPC) later.

#![forbid(unsafe_code)]

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::info;
use uuid::Uuid;
use xfn_core::{CompositeResource, Condition, DesiredState, EngineError, ObservedState, Severity};
use xfn_pipeline::Composer;
use xfn_store::MergePolicy;

pub use xfn_invoke::{cancellation, CancelHandle, CompositionFunction};
pub use xfn_pipeline::def::{FunctionRef, PipelineSpec, StepSpec, BUILTINS};
pub use xfn_pipeline::{Pipeline, Step};

fn max_input_bytes() -> usize {
    std::env::var("XFN_MAX_INPUT_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_input_nodes() -> usize {
    std::env::var("XFN_MAX_INPUT_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter with early bail once the budget is hit.
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Guard an inbound document against size and complexity budgets before it
/// reaches the engine.
pub fn guard_input(raw_len: usize, doc: &Json) -> anyhow::Result<()> {
    if raw_len > max_input_bytes() {
        anyhow::bail!("input document too large (>{} bytes)", max_input_bytes());
    }
    if node_budget_exceeded(doc, max_input_nodes()) {
        anyhow::bail!("input document too complex (>{} nodes)", max_input_nodes());
    }
    Ok(())
}

/// Request document for one pipeline run, as supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub observed: ObservedState,
    /// Prior partial desired state, if the caller carries one forward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredState>,
    #[serde(skip_serializing_if = "Json::is_null")]
    pub context: Json,
}

/// Resolved output document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub desired: DesiredDoc,
    pub results: Vec<ResultEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesiredDoc {
    #[serde(flatten)]
    pub state: DesiredState,
    pub composite: CompositeDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeDoc {
    pub resource: CompositeResource,
}

/// One entry of the ordered results sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl From<&Condition> for ResultEntry {
    fn from(c: &Condition) -> Self {
        Self { severity: c.severity, message: c.message.clone(), function: c.function.clone() }
    }
}

/// Terminal failure of a run. The partial desired state is diagnostic
/// context, never a valid result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub run_id: Option<Uuid>,
    pub error: EngineError,
    pub partial_desired: DesiredState,
    pub results: Vec<ResultEntry>,
}

pub type RunResult = Result<RunResponse, RunFailure>;

/// Declarative engine surface.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Execute one pipeline run against a request document. `cancel`
    /// aborts the run at the current invocation boundary.
    async fn run(
        &self,
        pipeline: &Pipeline,
        request: RunRequest,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> RunResult;
}

// ----------------- In-process implementation -----------------

/// In-process engine wiring the composer, store, invoker and validator.
pub struct InProcEngine {
    composer: Composer,
}

impl Default for InProcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcEngine {
    pub fn new() -> Self {
        Self { composer: Composer::new() }
    }

    pub fn with_policy(policy: MergePolicy) -> Self {
        Self { composer: Composer::with_policy(policy) }
    }
}

#[async_trait::async_trait]
impl Engine for InProcEngine {
    async fn run(
        &self,
        pipeline: &Pipeline,
        request: RunRequest,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> RunResult {
        let t0 = Instant::now();
        info!(
            steps = pipeline.len(),
            observed = request.observed.resources.len(),
            seeded = request.desired.is_some(),
            "engine: run start"
        );
        let composite = request.observed.composite.clone();
        let outcome = self
            .composer
            .run(pipeline, request.observed, request.desired, request.context, cancel)
            .await;
        match outcome {
            Ok(ok) => {
                info!(run = %ok.run_id, resources = ok.desired.len(), took_ms = %t0.elapsed().as_millis(), "engine: run ok");
                let results = ok.conditions.iter().map(ResultEntry::from).collect();
                Ok(RunResponse {
                    desired: DesiredDoc {
                        composite: CompositeDoc { resource: finalize_composite(composite, ok.desired.len()) },
                        state: ok.desired,
                    },
                    results,
                })
            }
            Err(err) => {
                info!(run = %err.run_id, class = err.error.class(), took_ms = %t0.elapsed().as_millis(), "engine: run failed");
                Err(RunFailure {
                    run_id: Some(err.run_id),
                    error: err.error,
                    partial_desired: err.partial_desired,
                    results: err.conditions.iter().map(ResultEntry::from).collect(),
                })
            }
        }
    }
}

/// The output composite is the observed composite with an engine-owned
/// status summary; input status intent is never read, only extended.
fn finalize_composite(mut composite: CompositeResource, resource_count: usize) -> CompositeResource {
    if !composite.status.is_object() {
        composite.status = Json::Object(Default::default());
    }
    if let Some(status) = composite.status.as_object_mut() {
        status.insert("resourceCount".into(), Json::from(resource_count));
    }
    composite
}

// ----------------- Mock implementation -----------------

/// Canned engine for tests of hosting layers.
#[derive(Default)]
pub struct MockEngine {
    pub response: Option<RunResponse>,
    pub failure: Option<RunFailure>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Engine for MockEngine {
    async fn run(
        &self,
        _pipeline: &Pipeline,
        _request: RunRequest,
        _cancel: Option<oneshot::Receiver<()>>,
    ) -> RunResult {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.response.clone().ok_or_else(|| RunFailure {
            run_id: None,
            error: EngineError::Fatal { function: "mock".into(), message: "no response configured".into() },
            partial_desired: DesiredState::default(),
            results: Vec::new(),
        })
    }
}
