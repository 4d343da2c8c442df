//! Error Types
//!
//! Errors fall into two groups:
//!
//! - Build-time errors ([`GraphError`], [`ConfigError`]) are detected while the
//!   engine is assembled and abort startup.
//! - Request-time failures are reported per callback as data
//!   ([`ErrorKind`] inside a [`FailureReport`](crate::engine::FailureReport))
//!   and never take the process down. The single exception is
//!   [`ConsistencyViolation`], which aborts the request it occurred in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::InvocationStatus;
use crate::graph::{CallbackId, PropRef};

/// Errors raised while building or validating the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two bindings (or one binding twice) claim the same output.
    #[error("output `{target}` is produced by both `{first}` and `{second}`")]
    DuplicateOutput {
        target: PropRef,
        first: CallbackId,
        second: CallbackId,
    },

    /// A callback id was registered more than once.
    #[error("callback `{0}` is registered more than once")]
    DuplicateCallback(CallbackId),

    /// A binding declares no outputs.
    #[error("callback `{0}` declares no outputs")]
    EmptyOutputs(CallbackId),

    /// A binding references a component that is not in the layout.
    #[error(
        "callback `{callback}` references `{target}`, but component `{}` is not declared",
        .target.id()
    )]
    UnknownComponent { callback: CallbackId, target: PropRef },

    /// The input edges between callbacks form a cycle.
    #[error("circular dependency between callbacks: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<CallbackId> },
}

fn format_cycle(cycle: &[CallbackId]) -> String {
    let mut names: Vec<&str> = cycle.iter().map(CallbackId::as_str).collect();
    if let Some(first) = cycle.first() {
        names.push(first.as_str());
    }
    names.join(" -> ")
}

/// Failure to parse a `component.property` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid property reference `{0}`, expected `component.property`")]
pub struct ParsePropRefError(pub String);

/// Errors crossing the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    /// No handler can represent the value on the wire.
    #[error("value of type `{type_name}` is not serializable: {reason}")]
    NotSerializable { type_name: String, reason: String },

    /// The wire value does not have the shape its tag promises.
    #[error("malformed wire value: {0}")]
    Malformed(String),

    /// Encoding or decoding a whole message failed.
    #[error("{format} encoding failed: {reason}")]
    Encoding { format: &'static str, reason: String },
}

impl SerializationError {
    pub(crate) fn not_serializable(
        type_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::NotSerializable {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by application callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// The callback declines to update any of its outputs.
    #[error("update prevented")]
    PreventUpdate,

    /// The callback raised an application error.
    #[error("{0}")]
    Failed(String),
}

impl CallbackError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from a background executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor rejected job for `{callback}`: {reason}")]
    Rejected { callback: CallbackId, reason: String },

    #[error("unknown background job {0}")]
    UnknownJob(u64),
}

/// A rejected invocation state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid invocation transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: InvocationStatus,
    pub to: InvocationStatus,
}

/// Errors in engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Two invocations in one request wrote the same output.
///
/// The graph builder rejects duplicate outputs, so this only fires on a
/// construction bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wave {wave}: `{target}` written by both `{first}` and `{second}`")]
pub struct ConsistencyViolation {
    pub wave: usize,
    pub target: PropRef,
    pub first: CallbackId,
    pub second: CallbackId,
}

/// Top-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    ConsistencyViolation(#[from] ConsistencyViolation),

    /// A binding was added without a callback to run.
    #[error("no callback registered for binding `{0}`")]
    MissingCallback(CallbackId),

    /// A request referenced a component that is not in the layout.
    #[error("request references undeclared component in `{0}`")]
    UnknownComponent(PropRef),
}

/// Classification of a per-callback failure in a request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Application code returned an error or panicked.
    CallbackExecution,
    /// The invocation exceeded its deadline.
    Timeout,
    /// An output value could not cross the wire boundary.
    NotSerializable,
    /// Not invoked because an upstream callback failed.
    UpstreamFailed,
}
