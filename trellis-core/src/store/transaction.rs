//! Store Transactions
//!
//! A request stages every write in a transaction. Reads through the
//! transaction see staged values first, then the snapshot taken when the
//! transaction began, so callbacks in later waves observe the outputs of
//! earlier waves while other requests keep reading the committed state.
//! Dropping a transaction without committing discards it.

use indexmap::IndexMap;

use super::{PropertyStore, Snapshot};
use crate::graph::PropRef;
use crate::request::RequestId;
use crate::wire::Value;

/// Result of committing a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Store version after the commit.
    pub version: u64,
    /// Number of properties written.
    pub applied: usize,
    /// Properties skipped because a newer request already wrote them.
    pub stale: Vec<PropRef>,
}

/// Staged writes of one request.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s PropertyStore,
    base: Snapshot,
    staged: IndexMap<PropRef, Value>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s PropertyStore, base: Snapshot) -> Self {
        Self {
            store,
            base,
            staged: IndexMap::new(),
        }
    }

    /// Current value as seen by this request.
    pub fn get(&self, target: &PropRef) -> Option<&Value> {
        self.staged.get(target).or_else(|| self.base.get(target))
    }

    pub fn stage(&mut self, target: PropRef, value: Value) {
        self.staged.insert(target, value);
    }

    pub fn is_staged(&self, target: &PropRef) -> bool {
        self.staged.contains_key(target)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Version of the snapshot this transaction reads from.
    pub fn base_version(&self) -> u64 {
        self.base.version()
    }

    pub fn commit(self, request: RequestId) -> CommitSummary {
        self.store.apply(request, self.staged)
    }
}
