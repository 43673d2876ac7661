//! Per-run state store: an immutable observed snapshot plus the desired
//! state accumulated by the pipeline so far. One run owns its store
//! exclusively, so there is no synchronization here.

#![forbid(unsafe_code)]

use tracing::debug;
use xfn_core::{DesiredState, EngineError, ObservedState};

/// Policy for a function re-claiming an already-present resource key.
///
/// A key claimed with a different `apiVersion`/`kind` is always a conflict.
/// For a same-type re-claim, `Replace` lets later steps refine earlier
/// output; `DenyRespec` rejects anything but an identical re-assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    #[default]
    Replace,
    DenyRespec,
}

pub struct StateStore {
    observed: ObservedState,
    desired: DesiredState,
    policy: MergePolicy,
}

impl StateStore {
    pub fn new(observed: ObservedState) -> Self {
        Self::with_policy(observed, MergePolicy::default())
    }

    pub fn with_policy(observed: ObservedState, policy: MergePolicy) -> Self {
        Self { observed, desired: DesiredState::default(), policy }
    }

    /// Seed the desired state with prior partial state supplied by the caller.
    pub fn seed(mut self, prior: DesiredState) -> Self {
        self.desired = prior;
        self
    }

    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }

    /// Read view for the next function: owned copies, no aliasing of the
    /// store's internals.
    pub fn snapshot(&self) -> (ObservedState, DesiredState) {
        (self.observed.clone(), self.desired.clone())
    }

    /// Apply one function's delta. Atomic: when any entry conflicts,
    /// nothing from the delta is applied.
    pub fn merge(&mut self, delta: DesiredState) -> Result<(), EngineError> {
        for (key, spec) in &delta.resources {
            if let Some(current) = self.desired.get(key) {
                if !current.same_type(spec) {
                    return Err(EngineError::Conflict {
                        key: key.clone(),
                        reason: format!(
                            "claimed as {}/{} but already present as {}/{}",
                            spec.api_version, spec.kind, current.api_version, current.kind
                        ),
                    });
                }
                if self.policy == MergePolicy::DenyRespec && current != spec {
                    return Err(EngineError::Conflict {
                        key: key.clone(),
                        reason: "re-claimed with a different specification".into(),
                    });
                }
            }
        }

        let mut inserted = 0usize;
        let mut replaced = 0usize;
        let mut idempotent = 0usize;
        for (key, spec) in delta.resources {
            match self.desired.get(&key) {
                Some(current) if *current == spec => idempotent += 1,
                Some(_) => {
                    replaced += 1;
                    self.desired.insert(key, spec);
                }
                None => {
                    inserted += 1;
                    self.desired.insert(key, spec);
                }
            }
        }
        debug!(inserted, replaced, idempotent, total = self.desired.len(), "delta merged");
        Ok(())
    }

    /// Consume the store, releasing the accumulated desired state.
    pub fn into_desired(self) -> DesiredState {
        self.desired
    }
}
