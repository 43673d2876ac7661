//! Out-of-process functions speaking a JSON-over-stdin/stdout protocol:
//! one request document in, one response document out, per invocation.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use xfn_core::{Condition, Conditions, DesiredState, FunctionResult, ObservedState, ResourceSpec, Severity};

use crate::{CompositionFunction, FunctionRequest};

/// Request document written to the child's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    observed: &'a ObservedState,
    desired: &'a DesiredState,
    #[serde(skip_serializing_if = "Json::is_null")]
    input: &'a Json,
    #[serde(skip_serializing_if = "Json::is_null")]
    context: &'a Json,
}

/// Reply read from the child's stdout: a delta plus results, or an error
/// envelope.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireResponse {
    desired: Option<WireDesired>,
    results: Vec<WireResultEntry>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireDesired {
    resources: BTreeMap<String, ResourceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResultEntry {
    severity: Severity,
    message: String,
}

/// Hosts an external command as a composition function. The child is
/// spawned per invocation and killed on drop, so a timeout or cancellation
/// upstream reaps it rather than leaking it.
pub struct ExecFunction {
    name: String,
    command: String,
    args: Vec<String>,
}

impl ExecFunction {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self { name: name.into(), command: command.into(), args }
    }

    fn parse_response(name: &str, bytes: &[u8]) -> Result<FunctionResult> {
        let resp: WireResponse = serde_json::from_slice(bytes).context("parsing function output")?;
        if let Some(message) = resp.error {
            return Ok(FunctionResult::Fatal { message });
        }
        let mut conditions = Conditions::new();
        for entry in resp.results {
            match entry.severity {
                Severity::Fatal => return Ok(FunctionResult::Fatal { message: entry.message }),
                severity => conditions.push(Condition::new(severity, entry.message).attribute(name)),
            }
        }
        let delta = DesiredState { resources: resp.desired.map(|d| d.resources).unwrap_or_default() };
        Ok(FunctionResult::Delta { delta, conditions })
    }
}

#[async_trait::async_trait]
impl CompositionFunction for ExecFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, req: FunctionRequest) -> Result<FunctionResult> {
        let payload = serde_json::to_vec(&WireRequest {
            observed: &req.observed,
            desired: &req.desired,
            input: &req.input,
            context: &req.context,
        })
        .context("encoding function request")?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {:?}", self.command))?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
        // A child that exits before reading breaks this pipe; its exit status
        // is the better diagnostic, so keep the write error aside until then.
        let written = stdin.write_all(&payload).await;
        drop(stdin);

        let out = child.wait_with_output().await.context("waiting for function")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Ok(FunctionResult::Fatal {
                message: format!("function exited with {}: {}", out.status, stderr.trim()),
            });
        }
        written.context("writing request to function")?;
        debug!(function = %self.name, bytes = out.stdout.len(), "function replied");
        Self::parse_response(&self.name, &out.stdout)
    }
}
