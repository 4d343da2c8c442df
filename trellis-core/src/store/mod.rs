//! Property Store
//!
//! The store holds the current value of every component property. It is the
//! only shared mutable state in the engine and is injected where needed,
//! never reached through a global.
//!
//! # Consistency
//!
//! - Readers take a [`Snapshot`]: an `Arc` of the last committed map. Taking
//!   one is a pointer clone, so resolution and callback input gathering never
//!   wait on a merge in progress.
//! - Writers stage changes in a [`Transaction`] and commit them atomically.
//!   Commits are serialized by the store's write lock, so no two requests
//!   merge at the same time.
//! - Each property remembers the request that last wrote it. A commit from an
//!   older request never overwrites a value written by a newer one.

mod layout;
mod merge;
mod transaction;

pub use layout::ComponentTree;
pub use merge::{Merger, Patch};
pub use transaction::{CommitSummary, Transaction};

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::graph::PropRef;
use crate::request::RequestId;
use crate::wire::Value;

/// Immutable view of the store at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    values: Arc<IndexMap<PropRef, Value>>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, target: &PropRef) -> Option<&Value> {
        self.values.get(target)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PropRef, &Value)> {
        self.values.iter()
    }
}

#[derive(Debug, Default)]
struct Committed {
    snapshot: Snapshot,
    writers: HashMap<PropRef, RequestId>,
}

/// Authoritative property values.
#[derive(Debug, Default)]
pub struct PropertyStore {
    committed: RwLock<Committed>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a layout's initial values.
    pub fn from_tree(tree: &ComponentTree) -> Self {
        let values: IndexMap<PropRef, Value> = tree
            .initial_values()
            .map(|(target, value)| (target, value.clone()))
            .collect();
        Self {
            committed: RwLock::new(Committed {
                snapshot: Snapshot {
                    version: 0,
                    values: Arc::new(values),
                },
                writers: HashMap::new(),
            }),
        }
    }

    /// The last committed state.
    pub fn snapshot(&self) -> Snapshot {
        self.committed.read().snapshot.clone()
    }

    pub fn get(&self, target: &PropRef) -> Option<Value> {
        self.committed.read().snapshot.get(target).cloned()
    }

    pub fn version(&self) -> u64 {
        self.committed.read().snapshot.version
    }

    /// Begin staging writes against the current snapshot.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self, self.snapshot())
    }

    /// Apply staged writes for `request` in one step.
    pub(crate) fn apply(
        &self,
        request: RequestId,
        staged: IndexMap<PropRef, Value>,
    ) -> CommitSummary {
        let mut committed = self.committed.write();
        let mut summary = CommitSummary::default();
        if staged.is_empty() {
            summary.version = committed.snapshot.version;
            return summary;
        }

        let mut values = (*committed.snapshot.values).clone();
        for (target, value) in staged {
            let superseded =
                matches!(committed.writers.get(&target), Some(newer) if *newer > request);
            if superseded {
                summary.stale.push(target);
            } else {
                committed.writers.insert(target.clone(), request);
                values.insert(target, value);
                summary.applied += 1;
            }
        }

        let version = committed.snapshot.version + 1;
        committed.snapshot = Snapshot {
            version,
            values: Arc::new(values),
        };
        summary.version = version;
        summary
    }
}
