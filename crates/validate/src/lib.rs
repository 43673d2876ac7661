//! Final invariant checks over a resolved desired state.
//!
//! Violations are collected exhaustively so the caller sees the complete
//! list, in check order and then key order within each check.

#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;
use xfn_core::{DesiredState, ValidationReport};

/// Cross-resource references are object nodes of the form
/// `{"resourceRef": "<key>"}` anywhere inside a resource's `spec`.
const RESOURCE_REF_FIELD: &str = "resourceRef";

pub fn validate(desired: &DesiredState) -> Result<(), ValidationReport> {
    let mut report = ValidationReport::default();

    // Required type fields.
    for (key, spec) in &desired.resources {
        if spec.api_version.is_empty() {
            report.push(key, "missing apiVersion");
        }
        if spec.kind.is_empty() {
            report.push(key, "missing kind");
        }
    }

    // Duplicate external identities across distinct keys. Reported on every
    // key in the clash, even though resource keys themselves are unique.
    let mut identities: FxHashMap<(String, Option<String>), usize> = FxHashMap::default();
    for spec in desired.resources.values() {
        if let Some(id) = spec.identity() {
            *identities.entry(id).or_insert(0) += 1;
        }
    }
    for (key, spec) in &desired.resources {
        if let Some(id) = spec.identity() {
            if identities.get(&id).copied().unwrap_or(0) > 1 {
                report.push(key, format!("duplicate external identity {}", display_identity(&id)));
            }
        }
    }

    // Dangling cross-resource references.
    for (key, spec) in &desired.resources {
        let mut refs = Vec::new();
        collect_refs(&spec.spec, &mut refs);
        for target in refs {
            if !desired.resources.contains_key(&target) {
                report.push(key, format!("references missing resource {target:?}"));
            }
        }
    }

    if report.is_empty() {
        Ok(())
    } else {
        debug!(violations = report.len(), "desired state invalid");
        Err(report)
    }
}

fn display_identity(id: &(String, Option<String>)) -> String {
    match &id.1 {
        Some(ns) => format!("{}/{}", ns, id.0),
        None => id.0.clone(),
    }
}

fn collect_refs(v: &Json, out: &mut Vec<String>) {
    match v {
        Json::Object(map) => {
            if let Some(Json::String(target)) = map.get(RESOURCE_REF_FIELD) {
                out.push(target.clone());
            }
            for (k, vv) in map {
                if k != RESOURCE_REF_FIELD {
                    collect_refs(vv, out);
                }
            }
        }
        Json::Array(items) => {
            for vv in items {
                collect_refs(vv, out);
            }
        }
        _ => {}
    }
}
