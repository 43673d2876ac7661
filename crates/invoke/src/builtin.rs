//! Built-in composition functions.

use serde::Deserialize;
use serde_json::json;
use xfn_core::{DesiredState, FunctionResult, ObjectMeta, ResourceSpec};

use crate::{parse_input, CompositionFunction, FunctionRequest};

/// Input accepted by [`NetworkFunction`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInput {
    /// Provider config referenced by emitted resources. Defaults to "default".
    pub provider_config_name: Option<String>,
}

/// Emits a VPC managed resource when the observed composite's spec carries
/// a `cidr` string; contributes nothing otherwise.
pub struct NetworkFunction;

#[async_trait::async_trait]
impl CompositionFunction for NetworkFunction {
    fn name(&self) -> &str {
        "network"
    }

    async fn invoke(&self, req: FunctionRequest) -> anyhow::Result<FunctionResult> {
        let input: NetworkInput = parse_input(&req.input)?;
        let cidr = match req.observed.composite.spec.get("cidr").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return Ok(FunctionResult::empty()),
        };

        let base = req.observed.composite.name().unwrap_or("network").to_string();
        let provider_config = input.provider_config_name.unwrap_or_else(|| "default".to_string());

        let mut delta = DesiredState::default();
        delta.insert(
            "network-vpc",
            ResourceSpec {
                api_version: "ec2.aws.crossplane.io/v1beta1".into(),
                kind: "VPC".into(),
                metadata: Some(ObjectMeta { name: Some(format!("{base}-vpc")), ..Default::default() }),
                spec: json!({
                    "forProvider": {
                        "cidrBlock": cidr,
                        "enableDnsHostnames": true,
                        "enableDnsSupport": true,
                    },
                    "providerConfigRef": { "name": provider_config },
                }),
                ..Default::default()
            },
        );
        Ok(FunctionResult::delta(delta))
    }
}

/// Wraps a plain closure as a composition function. Useful for embedders
/// and tests.
pub struct ClosureFunction<F> {
    name: String,
    f: F,
}

impl<F> ClosureFunction<F>
where
    F: Fn(FunctionRequest) -> anyhow::Result<FunctionResult> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait::async_trait]
impl<F> CompositionFunction for ClosureFunction<F>
where
    F: Fn(FunctionRequest) -> anyhow::Result<FunctionResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, req: FunctionRequest) -> anyhow::Result<FunctionResult> {
        (self.f)(req)
    }
}
