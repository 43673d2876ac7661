//! Function invoker: contract enforcement around a single composition
//! function. A function receives owned copies of state and can only affect
//! the run through the delta it returns; whatever goes wrong inside it
//! (errors, panics, slowness) surfaces as a typed result, never as an
//! engine crash.

#![forbid(unsafe_code)]

pub mod builtin;
pub mod exec;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::warn;
use xfn_core::{DesiredState, EngineError, FunctionResult, ObservedState};

pub fn default_timeout_ms() -> u64 {
    std::env::var("XFN_INVOKE_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(20_000)
}

/// Everything one invocation sees: the observed snapshot, the desired state
/// accumulated by earlier pipeline steps, the step's own configuration, and
/// the run context. All owned; mutating any of it has no effect on the run.
#[derive(Debug, Clone)]
pub struct FunctionRequest {
    pub observed: ObservedState,
    pub desired: DesiredState,
    pub input: Json,
    pub context: Json,
}

/// A callable transformation. Implementations must be deterministic and
/// side-effect-free on external resources: they describe desired resources,
/// they never create them.
#[async_trait::async_trait]
pub trait CompositionFunction: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, req: FunctionRequest) -> anyhow::Result<FunctionResult>;
}

/// Cancellation handle for a pipeline run. Dropping it without calling
/// `cancel` leaves the run untouched.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Create a cancellation pair: keep the handle, hand the receiver to the run.
pub fn cancellation() -> (CancelHandle, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (CancelHandle { tx: Some(tx) }, rx)
}

/// Wraps a function with the invocation contract: bounded execution and
/// panic isolation.
pub struct Invoker {
    function: Arc<dyn CompositionFunction>,
    timeout: Duration,
}

impl Invoker {
    pub fn new(function: Arc<dyn CompositionFunction>) -> Self {
        Self::with_timeout(function, Duration::from_millis(default_timeout_ms()))
    }

    pub fn with_timeout(function: Arc<dyn CompositionFunction>, timeout: Duration) -> Self {
        Self { function, timeout }
    }

    pub fn name(&self) -> &str {
        self.function.name()
    }

    /// Invoke the wrapped function. An elapsed timeout is the only typed
    /// error; transport errors and panics become Fatal results.
    pub async fn invoke(&self, req: FunctionRequest) -> Result<FunctionResult, EngineError> {
        let t0 = Instant::now();
        counter!("invoke_attempts", 1u64);
        let name = self.function.name().to_string();
        let fut = AssertUnwindSafe(self.function.invoke(req)).catch_unwind();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => {
                counter!("invoke_timeout", 1u64);
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(function = %name, timeout_ms, "function timed out");
                return Err(EngineError::Timeout { function: name, timeout_ms });
            }
            Ok(Err(panic)) => {
                counter!("invoke_panic", 1u64);
                let message = panic_message(panic);
                warn!(function = %name, panic = %message, "function panicked");
                FunctionResult::fatal(format!("function panicked: {message}"))
            }
            Ok(Ok(Err(e))) => {
                counter!("invoke_err", 1u64);
                warn!(function = %name, error = %e, "function returned an error");
                FunctionResult::fatal(format!("{e:#}"))
            }
            Ok(Ok(Ok(result))) => result,
        };
        histogram!("invoke_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }
}

/// Deserialize a function's input document, treating `null` (no input
/// configured) as the type's default.
pub fn parse_input<T>(input: &Json) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
{
    if input.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(input.clone())?)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
