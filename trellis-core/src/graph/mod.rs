//! Dependency Graph
//!
//! This module holds the static structure of an application: which callback
//! writes which property, which callbacks read it, and how callbacks depend
//! on each other as a result.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are callbacks, each carrying its [`CallbackBinding`]
//! - Edges follow data: if an output of A is an input of B, there is an edge
//!   from A to B
//!
//! State references are recorded as consumers but never create edges, since
//! a state change does not trigger anything.
//!
//! # Lifecycle
//!
//! 1. Bindings are collected into a [`GraphBuilder`], which enforces the
//!    single-writer rule as each one is added.
//! 2. [`GraphBuilder::build`] derives edges and validates the result against
//!    the component layout: unknown components and cycles are rejected.
//! 3. The resulting [`DependencyGraph`] is immutable and shared by every
//!    request. The [`Resolver`] reads it to plan execution waves.
//!
//! Both directions of every edge are kept so the resolver can walk forward
//! (who is affected) and backward (when can this run) cheaply.

mod binding;
mod builder;
mod node;
mod reference;
mod resolver;
mod validate;

pub use binding::{BindingBuilder, CallbackBinding, ExecutionMode};
pub use builder::{DependencyGraph, GraphBuilder};
pub use node::{CallbackNode, Consumer, Consumption};
pub use reference::{CallbackId, PropRef};
pub use resolver::{ExecutionPlan, Resolver, Wave};
