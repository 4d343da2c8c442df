//! Callback Bindings
//!
//! A binding declares which properties a callback reads and writes. Bindings
//! are built once with [`CallbackBinding::builder`] and handed to the engine
//! before any request is served; they never change afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::reference::{CallbackId, PropRef};

/// Where a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run directly on the scheduler's invocation task.
    #[default]
    Inline,

    /// Submit to the background executor and poll for completion.
    Background,
}

/// Declared (input, state, output) binding of one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackBinding {
    id: CallbackId,
    outputs: Vec<PropRef>,
    inputs: Vec<PropRef>,
    state: Vec<PropRef>,
    prevent_initial_call: bool,
    mode: ExecutionMode,
    timeout: Option<Duration>,
}

impl CallbackBinding {
    /// Start declaring a binding for the callback `id`.
    pub fn builder(id: impl Into<CallbackId>) -> BindingBuilder {
        BindingBuilder {
            binding: Self {
                id: id.into(),
                outputs: Vec::new(),
                inputs: Vec::new(),
                state: Vec::new(),
                prevent_initial_call: false,
                mode: ExecutionMode::Inline,
                timeout: None,
            },
        }
    }

    pub fn id(&self) -> &CallbackId {
        &self.id
    }

    pub fn outputs(&self) -> &[PropRef] {
        &self.outputs
    }

    /// Properties whose change triggers this callback.
    pub fn inputs(&self) -> &[PropRef] {
        &self.inputs
    }

    /// Properties read at call time without triggering.
    pub fn state(&self) -> &[PropRef] {
        &self.state
    }

    pub fn prevent_initial_call(&self) -> bool {
        self.prevent_initial_call
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Every reference in the binding: outputs, then inputs, then state.
    pub fn refs(&self) -> impl Iterator<Item = &PropRef> {
        self.outputs
            .iter()
            .chain(self.inputs.iter())
            .chain(self.state.iter())
    }
}

/// Builder returned by [`CallbackBinding::builder`].
#[derive(Debug, Clone)]
pub struct BindingBuilder {
    binding: CallbackBinding,
}

impl BindingBuilder {
    pub fn output(mut self, target: impl Into<PropRef>) -> Self {
        self.binding.outputs.push(target.into());
        self
    }

    pub fn input(mut self, target: impl Into<PropRef>) -> Self {
        self.binding.inputs.push(target.into());
        self
    }

    pub fn state(mut self, target: impl Into<PropRef>) -> Self {
        self.binding.state.push(target.into());
        self
    }

    /// Skip this callback on the bootstrap request.
    pub fn prevent_initial_call(mut self, prevent: bool) -> Self {
        self.binding.prevent_initial_call = prevent;
        self
    }

    /// Run through the background executor instead of inline.
    pub fn background(mut self) -> Self {
        self.binding.mode = ExecutionMode::Background;
        self
    }

    /// Deadline for a single invocation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.binding.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> CallbackBinding {
        self.binding
    }
}
