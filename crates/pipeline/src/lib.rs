//! Pipeline composer: drives an ordered sequence of function invocations,
//! threading desired state through them and producing a single resolved
//! outcome. Strictly sequential within a run; each step sees exactly the
//! merged deltas of the steps before it.

#![forbid(unsafe_code)]

pub mod def;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;
use xfn_core::{Condition, DesiredState, EngineError, FunctionResult, ObservedState, Severity};
use xfn_invoke::{CompositionFunction, FunctionRequest, Invoker};
use xfn_store::{MergePolicy, StateStore};

/// One ordered pipeline step: a function plus its step-specific input.
pub struct Step {
    pub name: String,
    pub function: Arc<dyn CompositionFunction>,
    pub input: Json,
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>, function: Arc<dyn CompositionFunction>) -> Self {
        Self { name: name.into(), function, input: Json::Null, timeout_ms: None }
    }

    pub fn with_input(mut self, input: Json) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("function", &self.function.name())
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Caller-specified total order of steps. Never reordered, parallelized, or
/// retried within a run.
#[derive(Debug)]
pub struct Pipeline {
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Product of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub desired: DesiredState,
    pub conditions: Vec<Condition>,
}

/// Terminal failure. `partial_desired` is the state merged before the
/// failing step, carried for diagnostics only and never a valid result.
#[derive(Debug, Clone)]
pub struct RunError {
    pub run_id: Uuid,
    pub error: EngineError,
    pub partial_desired: DesiredState,
    pub conditions: Vec<Condition>,
}

pub struct Composer {
    policy: MergePolicy,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer {
    pub fn new() -> Self {
        Self { policy: MergePolicy::default() }
    }

    pub fn with_policy(policy: MergePolicy) -> Self {
        Self { policy }
    }

    /// Execute one pipeline run to completion (or first fatal outcome).
    ///
    /// `prior` seeds the desired state with partial state from the caller;
    /// `cancel` aborts the run at the current invocation boundary with a
    /// `Cancelled` error distinct from any fatal class.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        observed: ObservedState,
        prior: Option<DesiredState>,
        context: Json,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<RunOutcome, RunError> {
        let run_id = Uuid::new_v4();
        let t0 = Instant::now();
        counter!("pipeline_runs", 1u64);
        info!(run = %run_id, steps = pipeline.len(), "pipeline run start");

        let mut store = StateStore::with_policy(observed, self.policy);
        if let Some(prior) = prior {
            store = store.seed(prior);
        }
        let mut conditions: Vec<Condition> = Vec::new();

        for (position, step) in pipeline.steps.iter().enumerate() {
            let (observed, desired_so_far) = store.snapshot();
            let request = FunctionRequest {
                observed,
                desired: desired_so_far,
                input: step.input.clone(),
                context: context.clone(),
            };
            let invoker = match step.timeout_ms {
                Some(ms) => Invoker::with_timeout(Arc::clone(&step.function), Duration::from_millis(ms)),
                None => Invoker::new(Arc::clone(&step.function)),
            };

            let s0 = Instant::now();
            let invoked = match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        biased;
                        () = wait_cancelled(rx) => {
                            counter!("pipeline_cancelled", 1u64);
                            warn!(run = %run_id, step = %step.name, position, "run cancelled");
                            return Err(RunError {
                                run_id,
                                error: EngineError::Cancelled,
                                partial_desired: store.into_desired(),
                                conditions,
                            });
                        }
                        res = invoker.invoke(request) => res,
                    }
                }
                None => invoker.invoke(request).await,
            };

            let result = match invoked {
                Ok(result) => result,
                Err(error) => {
                    counter!("pipeline_failed", 1u64);
                    warn!(run = %run_id, step = %step.name, position, error = %error, "pipeline aborted");
                    return Err(RunError { run_id, error, partial_desired: store.into_desired(), conditions });
                }
            };

            match result {
                FunctionResult::Fatal { message } => {
                    counter!("pipeline_failed", 1u64);
                    warn!(run = %run_id, step = %step.name, position, message = %message, "function reported fatal result");
                    return Err(RunError {
                        run_id,
                        error: EngineError::Fatal { function: step.name.clone(), message },
                        partial_desired: store.into_desired(),
                        conditions,
                    });
                }
                FunctionResult::Delta { delta, conditions: step_conditions } => {
                    // Functions signal fatality through the Fatal variant; a
                    // stray Fatal-severity condition is honored all the same.
                    if let Some(fatal) = step_conditions.iter().find(|c| c.severity == Severity::Fatal) {
                        counter!("pipeline_failed", 1u64);
                        return Err(RunError {
                            run_id,
                            error: EngineError::Fatal { function: step.name.clone(), message: fatal.message.clone() },
                            partial_desired: store.into_desired(),
                            conditions,
                        });
                    }
                    if let Err(error) = store.merge(delta) {
                        counter!("merge_conflict", 1u64);
                        warn!(run = %run_id, step = %step.name, position, error = %error, "delta rejected");
                        return Err(RunError { run_id, error, partial_desired: store.into_desired(), conditions });
                    }
                    for c in step_conditions {
                        conditions.push(c.attribute(&step.name));
                    }
                    info!(
                        run = %run_id,
                        step = %step.name,
                        position,
                        took_ms = %s0.elapsed().as_millis(),
                        resources = store.desired().len(),
                        "step ok"
                    );
                }
            }
        }

        let desired = store.into_desired();
        if let Err(report) = xfn_validate::validate(&desired) {
            counter!("pipeline_invalid", 1u64);
            warn!(run = %run_id, violations = report.len(), "desired state failed validation");
            return Err(RunError {
                run_id,
                error: EngineError::Validation(report),
                partial_desired: desired,
                conditions,
            });
        }

        histogram!("pipeline_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("pipeline_ok", 1u64);
        info!(
            run = %run_id,
            resources = desired.len(),
            conditions = conditions.len(),
            took_ms = %t0.elapsed().as_millis(),
            "pipeline run ok"
        );
        Ok(RunOutcome { run_id, desired, conditions })
    }
}

/// Resolves only on an explicit cancel signal. A handle dropped without
/// firing must not abort the run.
async fn wait_cancelled(rx: &mut oneshot::Receiver<()>) {
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}
