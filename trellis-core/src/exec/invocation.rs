//! Callback Invocations
//!
//! One invocation is one run (or non-run) of a callback within a request.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──► Running ──► Succeeded
//!    │           ├──────► Failed
//!    │           └──────► Cancelled
//!    ├──────────────────► Cancelled   (superseded before it started)
//!    ├──────────────────► Failed      (an upstream callback failed)
//!    └──────────────────► Skipped     (none of its inputs changed)
//! ```
//!
//! Terminal states never change again.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, InvalidTransition};
use crate::graph::{CallbackId, PropRef};
use crate::request::RequestId;
use crate::store::Patch;
use crate::wire::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    fn can_move_to(self, next: Self) -> bool {
        use InvocationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// A callback run tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct Invocation {
    callback_id: CallbackId,
    request_id: RequestId,
    inputs: Vec<(PropRef, Value)>,
    state: Vec<(PropRef, Value)>,
    status: InvocationStatus,
}

impl Invocation {
    pub fn new(callback_id: CallbackId, request_id: RequestId) -> Self {
        Self {
            callback_id,
            request_id,
            inputs: Vec::new(),
            state: Vec::new(),
            status: InvocationStatus::Pending,
        }
    }

    /// Record the values the callback will be called with.
    pub fn with_values(
        mut self,
        inputs: Vec<(PropRef, Value)>,
        state: Vec<(PropRef, Value)>,
    ) -> Self {
        self.inputs = inputs;
        self.state = state;
        self
    }

    pub fn callback_id(&self) -> &CallbackId {
        &self.callback_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn inputs(&self) -> &[(PropRef, Value)] {
        &self.inputs
    }

    pub fn state(&self) -> &[(PropRef, Value)] {
        &self.state
    }

    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    pub fn transition(&mut self, next: InvocationStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_move_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move to the terminal state matching `completion`.
    pub fn complete(&mut self, completion: &Completion) -> Result<(), InvalidTransition> {
        self.transition(completion.status())
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Ran to completion. Holds one patch per output that was set.
    Succeeded(Vec<Patch>),
    Failed {
        kind: ErrorKind,
        message: String,
        /// The failing upstream callback, for [`ErrorKind::UpstreamFailed`].
        cause: Option<CallbackId>,
    },
    Cancelled,
    Skipped,
}

impl Completion {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn status(&self) -> InvocationStatus {
        match self {
            Self::Succeeded(_) => InvocationStatus::Succeeded,
            Self::Failed { .. } => InvocationStatus::Failed,
            Self::Cancelled => InvocationStatus::Cancelled,
            Self::Skipped => InvocationStatus::Skipped,
        }
    }
}

/// A finished invocation, as returned by the scheduler.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub invocation: Invocation,
    pub completion: Completion,
}
