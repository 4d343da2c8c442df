//! Trellis Core
//!
//! This crate provides the callback engine of the Trellis reactive web
//! framework. Given declared bindings between component properties, it
//! decides which callbacks fire when a property changes, in what order and
//! with what concurrency, and merges their results back into the property
//! store as patches.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: bindings, the dependency graph, validation and trigger
//!   resolution
//! - `exec`: callbacks, invocations, the wave scheduler and background
//!   executors
//! - `store`: the property store, per-request transactions and patch merging
//! - `wire`: in-memory values and their wire representation
//! - `engine`: the request pipeline tying the above together
//!
//! Rendering, component libraries and transport framing live outside this
//! crate. The engine consumes a component tree and a callback table and
//! hands back patches.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{CallbackBinding, ChangeRequest, ComponentTree, Engine, Output, Value};
//!
//! let engine = Engine::builder()
//!     .layout(
//!         ComponentTree::new()
//!             .component("slider", [("value", Value::Int(3))])
//!             .component("label", [("children", Value::Null)]),
//!     )
//!     .register_fn(
//!         CallbackBinding::builder("show")
//!             .input(("slider", "value"))
//!             .output(("label", "children"))
//!             .build(),
//!         |ctx| {
//!             let n = ctx.input(0).and_then(Value::as_i64).unwrap_or(0);
//!             Ok(vec![Output::set(format!("value is {n}"))])
//!         },
//!     )
//!     .build()?;
//!
//! engine.bootstrap().await?;
//! let outcome = engine
//!     .handle(ChangeRequest::new().trigger(("slider", "value"), 7.into()))
//!     .await?;
//! // outcome.patches: label.children = "value is 7"
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod graph;
pub mod request;
pub mod store;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, FailureReport, RequestOutcome};
pub use error::{
    CallbackError, ConfigError, ConsistencyViolation, EngineError, ErrorKind, ExecutorError,
    GraphError, SerializationError,
};
pub use exec::{
    from_async, from_fn, BackgroundExecutor, Callback, CallbackContext, Output, ProgressSink,
    TaskPoolExecutor,
};
pub use graph::{CallbackBinding, CallbackId, DependencyGraph, ExecutionMode, PropRef};
pub use request::{ChangeRequest, ExecutionRequest, RequestId};
pub use store::{ComponentTree, Patch, PropertyStore};
pub use wire::{CustomSerializer, Record, Table, Value, WireCodec, WireFormat};
