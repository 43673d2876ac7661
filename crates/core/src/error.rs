//! Engine error taxonomy. Kept serializable so failures can cross an RPC
//! boundary when a remote hosting layer appears.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One validation failure: the offending resource key and the reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub key: String,
    pub reason: String,
}

/// Exhaustive list of validation failures for one desired state.
/// Collected in full, never short-circuited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn push(&mut self, key: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(Violation { key: key.into(), reason: reason.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", v.key, v.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum EngineError {
    /// Two functions claimed the same resource key with incompatible types.
    #[error("conflict on key {key:?}: {reason}")]
    Conflict { key: String, reason: String },

    /// A function did not respond within its bound. Fatal class.
    #[error("function {function:?} timed out after {timeout_ms}ms")]
    Timeout { function: String, timeout_ms: u64 },

    /// A function reported a fatal result (or crashed inside the invoker).
    #[error("function {function:?} failed: {message}")]
    Fatal { function: String, message: String },

    /// The final desired state violated one or more invariants.
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    /// The caller aborted the run. Never retried automatically.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short stable label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            EngineError::Conflict { .. } => "conflict",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Fatal { .. } => "fatal",
            EngineError::Validation(_) => "validation",
            EngineError::Cancelled => "cancelled",
        }
    }
}
