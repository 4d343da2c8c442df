//! Cycle & Conflict Validator
//!
//! Runs once, after edges are derived:
//!
//! 1. Every referenced component must be declared in the layout.
//! 2. Input edges must not form a cycle. We walk the graph depth-first,
//!    marking nodes as visiting/done; reaching a node that is still being
//!    visited closes a cycle, which is reported in path order.
//! 3. A topological order is computed with Kahn's algorithm. When several
//!    callbacks are ready at once, the one declared first goes first, so the
//!    order is deterministic.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;

use super::node::CallbackNode;
use super::reference::CallbackId;
use crate::error::GraphError;
use crate::store::ComponentTree;

type Nodes = IndexMap<CallbackId, CallbackNode>;

pub(crate) fn check_components(nodes: &Nodes, layout: &ComponentTree) -> Result<(), GraphError> {
    for (id, node) in nodes {
        if let Some(target) = node.binding().refs().find(|r| !layout.contains(r.id())) {
            return Err(GraphError::UnknownComponent {
                callback: id.clone(),
                target: target.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Returns the callbacks on the first cycle found, in edge order.
///
/// The walk keeps its own stack of `(callback, next dependent index)` frames,
/// so chain depth is bounded by memory rather than the thread stack.
pub(crate) fn find_cycle(nodes: &Nodes) -> Option<Vec<CallbackId>> {
    let mut marks: HashMap<&CallbackId, Mark> = HashMap::new();
    let mut path: Vec<&CallbackId> = Vec::new();
    let mut frames: Vec<(&CallbackId, usize)> = Vec::new();

    for root in nodes.keys() {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        path.push(root);
        frames.push((root, 0));

        while let Some(frame) = frames.last_mut() {
            let (id, cursor) = *frame;
            frame.1 += 1;

            let Some(next) = nodes
                .get(id)
                .and_then(|node| node.dependents().get_index(cursor))
            else {
                marks.insert(id, Mark::Done);
                path.pop();
                frames.pop();
                continue;
            };

            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == next).unwrap_or(0);
                    return Some(path[start..].iter().map(|p| (*p).clone()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Visiting);
                    path.push(next);
                    frames.push((next, 0));
                }
            }
        }
    }
    None
}

/// Kahn's algorithm over input edges. Assumes the graph is acyclic.
pub(crate) fn topological_order(nodes: &Nodes) -> Vec<CallbackId> {
    let mut in_degree: Vec<usize> = nodes
        .values()
        .map(|node| node.dependencies().len())
        .collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| index)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(index) = ready.pop_first() {
        let Some((id, node)) = nodes.get_index(index) else {
            continue;
        };
        order.push(id.clone());

        for dependent in node.dependents() {
            if let Some(next) = nodes.get_index_of(dependent) {
                in_degree[next] = in_degree[next].saturating_sub(1);
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
    }
    order
}
