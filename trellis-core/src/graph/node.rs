//! Graph Nodes
//!
//! This module defines the node type that lives in the dependency graph:
//! one node per registered callback, carrying its binding plus the edges
//! derived from it.

use indexmap::IndexSet;

use super::binding::CallbackBinding;
use super::reference::CallbackId;

/// How a callback consumes a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumption {
    /// A change to the property triggers the callback.
    Input,

    /// The property is read at call time but never triggers.
    State,
}

/// One consumer entry in the graph's consumer map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    callback: CallbackId,
    kind: Consumption,
}

impl Consumer {
    pub fn new(callback: CallbackId, kind: Consumption) -> Self {
        Self { callback, kind }
    }

    pub fn callback(&self) -> &CallbackId {
        &self.callback
    }

    pub fn kind(&self) -> Consumption {
        self.kind
    }

    pub fn is_input(&self) -> bool {
        self.kind == Consumption::Input
    }
}

/// A callback in the dependency graph.
#[derive(Debug, Clone)]
pub struct CallbackNode {
    binding: CallbackBinding,

    /// Callbacks producing one of this callback's inputs (parents in the DAG).
    dependencies: IndexSet<CallbackId>,

    /// Callbacks consuming one of this callback's outputs as an input
    /// (children in the DAG).
    dependents: IndexSet<CallbackId>,
}

impl CallbackNode {
    pub fn new(binding: CallbackBinding) -> Self {
        Self {
            binding,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn id(&self) -> &CallbackId {
        self.binding.id()
    }

    pub fn binding(&self) -> &CallbackBinding {
        &self.binding
    }

    /// Add a dependency (a callback that produces one of our inputs).
    pub fn add_dependency(&mut self, id: CallbackId) {
        self.dependencies.insert(id);
    }

    pub fn dependencies(&self) -> &IndexSet<CallbackId> {
        &self.dependencies
    }

    /// Add a dependent (a callback that reads one of our outputs).
    pub fn add_dependent(&mut self, id: CallbackId) {
        self.dependents.insert(id);
    }

    pub fn dependents(&self) -> &IndexSet<CallbackId> {
        &self.dependents
    }
}
