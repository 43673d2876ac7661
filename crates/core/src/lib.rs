//! xfn core types: the resource documents threaded through a pipeline run.

#![forbid(unsafe_code)]

pub mod error;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

pub use error::{EngineError, ValidationReport, Violation};

/// Small inline list of conditions attached to one function result.
pub type Conditions = SmallVec<[Condition; 4]>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The user-facing intent object. Immutable for the duration of one run;
/// `status` is written by the engine into the output copy only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositeResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(skip_serializing_if = "Json::is_null")]
    pub spec: Json,
    #[serde(skip_serializing_if = "Json::is_null")]
    pub status: Json,
}

impl CompositeResource {
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }
}

/// Readiness reported for a desired resource. The engine carries this
/// verbatim; interpreting it is a provider concern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Ready {
    True,
    False,
    Unspecified,
}

/// One managed-resource specification in the desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSpec {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(skip_serializing_if = "Json::is_null")]
    pub spec: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<Ready>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub connection: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// External identity: `(name, namespace)` once the resource names itself.
    pub fn identity(&self) -> Option<(String, Option<String>)> {
        let meta = self.metadata.as_ref()?;
        let name = meta.name.clone()?;
        Some((name, meta.namespace.clone()))
    }

    pub fn same_type(&self, other: &ResourceSpec) -> bool {
        self.api_version == other.api_version && self.kind == other.kind
    }
}

/// Snapshot of what currently exists, as reported by the caller.
/// Read-only input to every function invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservedState {
    pub composite: CompositeResource,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Json>,
}

/// The resolved set of managed-resource specifications, keyed uniquely
/// within a run. BTreeMap keeps iteration and serialization order stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DesiredState {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceSpec>,
}

impl DesiredState {
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, spec: ResourceSpec) {
        self.resources.insert(key.into(), spec);
    }

    pub fn get(&self, key: &str) -> Option<&ResourceSpec> {
        self.resources.get(key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warning,
    Info,
}

/// A non-fatal message recorded during a run. Output ordering is list
/// position; `at` is informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub at: DateTime<Utc>,
}

impl Condition {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self { severity, message: message.into(), function: None, at: Utc::now() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Record the originating function unless one is already set.
    pub fn attribute(mut self, function: &str) -> Self {
        if self.function.is_none() {
            self.function = Some(function.to_string());
        }
        self
    }
}

/// Outcome of a single function invocation: a delta to merge plus
/// non-fatal conditions, or a fatal error that aborts the run.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    Delta { delta: DesiredState, conditions: Conditions },
    Fatal { message: String },
}

impl FunctionResult {
    /// A no-op result: empty delta, no conditions.
    pub fn empty() -> Self {
        Self::Delta { delta: DesiredState::default(), conditions: Conditions::new() }
    }

    pub fn delta(delta: DesiredState) -> Self {
        Self::Delta { delta, conditions: Conditions::new() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }
}

pub mod prelude {
    pub use super::{
        CompositeResource, Condition, Conditions, DesiredState, EngineError, FunctionResult,
        ObjectMeta, ObservedState, Ready, ResourceSpec, Severity,
    };
}
