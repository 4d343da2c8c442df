//! Trigger Resolver
//!
//! Turns a set of changed properties into an [`ExecutionPlan`]: an ordered
//! list of waves, each a set of mutually independent callbacks.
//!
//! # Algorithm
//!
//! 1. Seed with every callback that consumes a changed property as an input.
//!    State consumption never triggers.
//! 2. Expand breadth-first through `successors`, visiting each callback once.
//! 3. Walk the affected set in topological order and assign
//!    `level = 1 + max(level of affected predecessors)`, or 0 when none of the
//!    callback's predecessors are affected. Wave *k* holds every callback at
//!    level *k*, so a fan-in callback lands right after its latest
//!    predecessor.
//!
//! Resolution only reads the immutable graph, so resolving the same input
//! twice yields the same plan.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use tracing::trace;

use super::builder::DependencyGraph;
use super::reference::{CallbackId, PropRef};

/// Callbacks that may run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wave {
    members: Vec<CallbackId>,
}

impl Wave {
    /// Members in topological order.
    pub fn members(&self) -> &[CallbackId] {
        &self.members
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The resolved work for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    waves: Vec<Wave>,
    triggered_by: IndexMap<CallbackId, Vec<PropRef>>,
    bootstrap: bool,
}

impl ExecutionPlan {
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Every planned callback, wave by wave.
    pub fn callbacks(&self) -> impl Iterator<Item = &CallbackId> {
        self.waves.iter().flat_map(|wave| wave.members.iter())
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Wave::len).sum()
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.wave_of(id).is_some()
    }

    /// Index of the wave `id` runs in.
    pub fn wave_of(&self, id: &CallbackId) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(id))
    }

    /// Changed properties that fed `id` directly. Empty for callbacks reached
    /// only through an upstream callback.
    pub fn triggered_by(&self, id: &CallbackId) -> &[PropRef] {
        self.triggered_by
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether this is the initial-call plan.
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }
}

/// Resolves changes against a built graph.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'g> {
    graph: &'g DependencyGraph,
}

impl<'g> Resolver<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self { graph }
    }

    /// Plan the callbacks affected by `changed`.
    pub fn resolve<'a>(&self, changed: impl IntoIterator<Item = &'a PropRef>) -> ExecutionPlan {
        let mut triggered_by: IndexMap<CallbackId, Vec<PropRef>> = IndexMap::new();
        let mut queue = VecDeque::new();

        for target in changed {
            for consumer in self.graph.consumers_of(target) {
                if !consumer.is_input() {
                    continue;
                }
                let refs = triggered_by.entry(consumer.callback().clone()).or_default();
                if !refs.contains(target) {
                    refs.push(target.clone());
                }
                queue.push_back(consumer.callback());
            }
        }

        let mut affected: HashSet<&CallbackId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !affected.insert(id) {
                continue;
            }
            queue.extend(self.graph.successors(id));
        }

        let waves = self.group(&affected);
        trace!(
            callbacks = affected.len(),
            waves = waves.len(),
            "resolved change"
        );

        ExecutionPlan {
            waves,
            triggered_by,
            bootstrap: false,
        }
    }

    /// Plan the initial call: every callback not marked `prevent_initial_call`.
    pub fn resolve_bootstrap(&self) -> ExecutionPlan {
        let affected: HashSet<&CallbackId> = self
            .graph
            .bindings()
            .filter(|binding| !binding.prevent_initial_call())
            .map(|binding| binding.id())
            .collect();

        ExecutionPlan {
            waves: self.group(&affected),
            triggered_by: IndexMap::new(),
            bootstrap: true,
        }
    }

    fn group(&self, affected: &HashSet<&CallbackId>) -> Vec<Wave> {
        let mut levels: IndexMap<&CallbackId, usize> = IndexMap::new();
        let mut waves: Vec<Wave> = Vec::new();

        for id in self.graph.topological_order() {
            if !affected.contains(id) {
                continue;
            }
            let level = self
                .graph
                .predecessors(id)
                .filter_map(|pred| levels.get(pred))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(id, level);

            if waves.len() <= level {
                waves.resize_with(level + 1, Wave::default);
            }
            waves[level].members.push(id.clone());
        }
        waves
    }
}
