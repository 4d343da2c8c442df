//! Execution Requests
//!
//! A [`ChangeRequest`] is what the transport layer hands in when the client
//! observes a property change. The engine stamps it into an
//! [`ExecutionRequest`] with a fresh [`RequestId`] before resolving it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::SerializationError;
use crate::graph::PropRef;
use crate::wire::WireProp;

/// Monotonic request identifier. Later requests compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Issues request ids for one engine.
#[derive(Debug, Default)]
pub(crate) struct RequestCounter(AtomicU64);

impl RequestCounter {
    pub(crate) fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Inbound change event from the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Properties the client reports as changed.
    pub triggers: Vec<PropRef>,

    /// Client-observed values, including the new values of the triggers.
    #[serde(default)]
    pub values: Vec<WireProp>,
}

impl ChangeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `target` as changed to `value`.
    pub fn trigger(mut self, target: impl Into<PropRef>, value: Json) -> Self {
        let target = target.into();
        self.values.push(WireProp::new(&target, value));
        self.triggers.push(target);
        self
    }

    /// Report a current value without marking it as changed.
    pub fn value(mut self, target: impl Into<PropRef>, value: Json) -> Self {
        self.values.push(WireProp::new(&target.into(), value));
        self
    }

    pub fn from_json(json: &str) -> Result<Self, SerializationError> {
        serde_json::from_str(json).map_err(|e| SerializationError::Encoding {
            format: "json",
            reason: e.to_string(),
        })
    }
}

/// A stamped request being processed by the engine.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: RequestId,
    triggers: IndexSet<PropRef>,
    received_at: Instant,
    bootstrap: bool,
}

impl ExecutionRequest {
    pub fn new(id: RequestId, triggers: impl IntoIterator<Item = PropRef>) -> Self {
        Self {
            id,
            triggers: triggers.into_iter().collect(),
            received_at: Instant::now(),
            bootstrap: false,
        }
    }

    /// The initial request fired when a page loads.
    pub fn bootstrap(id: RequestId) -> Self {
        Self {
            id,
            triggers: IndexSet::new(),
            received_at: Instant::now(),
            bootstrap: true,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn triggers(&self) -> &IndexSet<PropRef> {
        &self.triggers
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }
}
