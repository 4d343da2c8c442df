//! State Merge & Patch Emitter
//!
//! After each wave, the outputs of succeeded invocations are staged into the
//! request's transaction and recorded as patches, in wave order and, within
//! a wave, in the order the plan lists its members.
//!
//! Every output has a single producer, so two invocations of one request
//! writing the same property means the graph was built wrong. That is
//! reported as a [`ConsistencyViolation`] and nothing of the wave is staged.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value as Json;
use tracing::error;

use super::Transaction;
use crate::error::ConsistencyViolation;
use crate::graph::{CallbackId, PropRef};
use crate::wire::{Value, WireProp};

/// A single property update for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    target: PropRef,
    value: Value,
    wire: Json,
}

impl Patch {
    /// A patch whose value has already been serialized to `wire`.
    pub fn new(target: PropRef, value: Value, wire: Json) -> Self {
        Self { target, value, wire }
    }

    pub fn target(&self) -> &PropRef {
        &self.target
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn wire(&self) -> &Json {
        &self.wire
    }

    pub fn to_wire(&self) -> WireProp {
        WireProp::new(&self.target, self.wire.clone())
    }
}

/// Accumulates the patches of one request.
#[derive(Debug, Default)]
pub struct Merger {
    written_by: IndexMap<PropRef, CallbackId>,
    patches: Vec<Patch>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one wave's writes, given as `(callback, patches)` in plan order.
    pub fn merge_wave(
        &mut self,
        tx: &mut Transaction<'_>,
        wave: usize,
        writes: Vec<(CallbackId, Vec<Patch>)>,
    ) -> Result<(), ConsistencyViolation> {
        let mut owners: HashMap<&PropRef, &CallbackId> = HashMap::new();
        for (callback, patches) in &writes {
            for patch in patches {
                let first = self
                    .written_by
                    .get(&patch.target)
                    .or_else(|| owners.get(&patch.target).copied());
                match first {
                    Some(first) if first != callback => {
                        let violation = ConsistencyViolation {
                            wave,
                            target: patch.target.clone(),
                            first: first.clone(),
                            second: callback.clone(),
                        };
                        let members: Vec<&str> =
                            writes.iter().map(|(id, _)| id.as_str()).collect();
                        error!(
                            wave,
                            target = %violation.target,
                            first = %violation.first,
                            second = %violation.second,
                            ?members,
                            "conflicting writes in one request"
                        );
                        return Err(violation);
                    }
                    _ => {
                        owners.insert(&patch.target, callback);
                    }
                }
            }
        }

        for (callback, patches) in writes {
            for patch in patches {
                tx.stage(patch.target.clone(), patch.value.clone());
                self.written_by.insert(patch.target.clone(), callback.clone());
                self.patches.push(patch);
            }
        }
        Ok(())
    }

    /// Whether any earlier wave of this request wrote `target`.
    pub fn is_written(&self, target: &PropRef) -> bool {
        self.written_by.contains_key(target)
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Patches in merge order.
    pub fn finish(self) -> Vec<Patch> {
        self.patches
    }
}
