//! Declarative pipeline definitions, loaded from YAML or JSON and resolved
//! against the built-in function registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use xfn_invoke::builtin::NetworkFunction;
use xfn_invoke::exec::ExecFunction;
use xfn_invoke::CompositionFunction;

use crate::{Pipeline, Step};

/// Built-in function names resolvable by `functionRef: { builtin: ... }`.
pub const BUILTINS: &[&str] = &["network"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    pub function_ref: FunctionRef,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub input: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Untagged so the plain-map forms `{ builtin: <name> }` and
/// `{ exec: { command, args } }` deserialize from both YAML and JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionRef {
    /// A function compiled into the engine, by registry name.
    Builtin { builtin: String },
    /// An external command hosted over the stdin/stdout protocol.
    Exec { exec: ExecRef },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRef {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl PipelineSpec {
    /// Parse a definition document. YAML is a superset of JSON here, so one
    /// entry point covers both.
    pub fn parse(doc: &str) -> Result<Self> {
        serde_yaml::from_str(doc).context("parsing pipeline definition")
    }

    /// Resolve function references into an executable pipeline.
    pub fn resolve(&self) -> Result<Pipeline> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for spec in &self.steps {
            let function: Arc<dyn CompositionFunction> = match &spec.function_ref {
                FunctionRef::Builtin { builtin } => builtin_by_name(builtin).with_context(|| {
                    format!("step {:?}: unknown builtin function {builtin:?}", spec.name)
                })?,
                FunctionRef::Exec { exec } => {
                    Arc::new(ExecFunction::new(&spec.name, &exec.command, exec.args.clone()))
                }
            };
            let mut step = Step::new(&spec.name, function).with_input(spec.input.clone());
            if let Some(ms) = spec.timeout_ms {
                step = step.with_timeout_ms(ms);
            }
            steps.push(step);
        }
        Ok(Pipeline::new(steps))
    }
}

fn builtin_by_name(name: &str) -> Option<Arc<dyn CompositionFunction>> {
    match name {
        "network" => Some(Arc::new(NetworkFunction)),
        _ => None,
    }
}
