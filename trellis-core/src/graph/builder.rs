//! Dependency Graph Builder
//!
//! Bindings are registered one at a time; each registration claims the
//! binding's outputs in the producer map and appends its inputs and state to
//! the consumer map. [`GraphBuilder::build`] then derives callback-to-callback
//! edges and runs validation, producing an immutable [`DependencyGraph`].

use std::collections::HashSet;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::debug;

use super::binding::CallbackBinding;
use super::node::{CallbackNode, Consumer, Consumption};
use super::reference::{CallbackId, PropRef};
use super::validate;
use crate::error::GraphError;
use crate::store::ComponentTree;

type Consumers = SmallVec<[Consumer; 2]>;

/// Collects bindings before the graph is frozen.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexMap<CallbackId, CallbackNode>,
    producers: IndexMap<PropRef, CallbackId>,
    consumers: IndexMap<PropRef, Consumers>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding.
    ///
    /// A failed registration leaves the builder unchanged.
    pub fn add(&mut self, binding: CallbackBinding) -> Result<&mut Self, GraphError> {
        let id = binding.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateCallback(id));
        }
        if binding.outputs().is_empty() {
            return Err(GraphError::EmptyOutputs(id));
        }

        let mut claimed = HashSet::new();
        for target in binding.outputs() {
            if let Some(first) = self.producers.get(target) {
                return Err(GraphError::DuplicateOutput {
                    target: target.clone(),
                    first: first.clone(),
                    second: id,
                });
            }
            if !claimed.insert(target) {
                return Err(GraphError::DuplicateOutput {
                    target: target.clone(),
                    first: id.clone(),
                    second: id,
                });
            }
        }

        for target in binding.outputs() {
            self.producers.insert(target.clone(), id.clone());
        }
        for target in binding.inputs() {
            self.consumers
                .entry(target.clone())
                .or_default()
                .push(Consumer::new(id.clone(), Consumption::Input));
        }
        for target in binding.state() {
            self.consumers
                .entry(target.clone())
                .or_default()
                .push(Consumer::new(id.clone(), Consumption::State));
        }

        self.nodes.insert(id, CallbackNode::new(binding));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Derive edges, validate against `layout`, and freeze the graph.
    pub fn build(self, layout: &ComponentTree) -> Result<DependencyGraph, GraphError> {
        let Self {
            mut nodes,
            producers,
            consumers,
        } = self;

        let mut edges = Vec::new();
        for (id, node) in &nodes {
            for input in node.binding().inputs() {
                if let Some(producer) = producers.get(input) {
                    edges.push((producer.clone(), id.clone()));
                }
            }
        }
        for (from, to) in edges {
            if let Some(node) = nodes.get_mut(&from) {
                node.add_dependent(to.clone());
            }
            if let Some(node) = nodes.get_mut(&to) {
                node.add_dependency(from);
            }
        }

        validate::check_components(&nodes, layout)?;
        if let Some(cycle) = validate::find_cycle(&nodes) {
            return Err(GraphError::CyclicDependency { cycle });
        }
        let order = validate::topological_order(&nodes);
        let position = order
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();

        debug!(
            callbacks = nodes.len(),
            outputs = producers.len(),
            "dependency graph built"
        );

        Ok(DependencyGraph {
            nodes,
            producers,
            consumers,
            order,
            position,
        })
    }
}

/// Immutable, validated callback graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: IndexMap<CallbackId, CallbackNode>,
    producers: IndexMap<PropRef, CallbackId>,
    consumers: IndexMap<PropRef, Consumers>,
    order: Vec<CallbackId>,
    position: IndexMap<CallbackId, usize>,
}

impl DependencyGraph {
    /// The callback that writes `target`, if any.
    pub fn producers_of(&self, target: &PropRef) -> Option<&CallbackId> {
        self.producers.get(target)
    }

    /// Callbacks reading `target`, in registration order.
    pub fn consumers_of(&self, target: &PropRef) -> &[Consumer] {
        self.consumers
            .get(target)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Callbacks with an input produced by `id`.
    pub fn successors(&self, id: &CallbackId) -> impl Iterator<Item = &CallbackId> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.dependents().iter())
    }

    /// Callbacks producing one of `id`'s inputs.
    pub fn predecessors(&self, id: &CallbackId) -> impl Iterator<Item = &CallbackId> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.dependencies().iter())
    }

    pub fn binding(&self, id: &CallbackId) -> Option<&CallbackBinding> {
        self.nodes.get(id).map(CallbackNode::binding)
    }

    /// All bindings in declaration order.
    pub fn bindings(&self) -> impl Iterator<Item = &CallbackBinding> {
        self.nodes.values().map(CallbackNode::binding)
    }

    /// A valid linearization, ties broken by declaration order.
    pub fn topological_order(&self) -> &[CallbackId] {
        &self.order
    }

    /// Index of `id` in [`topological_order`](Self::topological_order).
    pub fn position(&self, id: &CallbackId) -> Option<usize> {
        self.position.get(id).copied()
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
