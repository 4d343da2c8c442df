//! Callback Context
//!
//! The values a callback sees when it runs. Inputs and state are gathered
//! from the request's transaction just before the callback's wave starts,
//! so they include everything earlier waves of the same request wrote.

use std::fmt;
use std::sync::Arc;

use crate::graph::{CallbackId, PropRef};
use crate::request::RequestId;
use crate::wire::Value;

/// Receives progress updates from long-running callbacks.
pub trait ProgressSink: Send + Sync {
    fn report(&self, callback: &CallbackId, request: RequestId, progress: Value);
}

/// Input snapshot handed to a callback.
#[derive(Clone)]
pub struct CallbackContext {
    callback_id: CallbackId,
    request_id: RequestId,
    inputs: Vec<(PropRef, Value)>,
    state: Vec<(PropRef, Value)>,
    triggered: Vec<PropRef>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl CallbackContext {
    pub fn new(
        callback_id: CallbackId,
        request_id: RequestId,
        inputs: Vec<(PropRef, Value)>,
        state: Vec<(PropRef, Value)>,
        triggered: Vec<PropRef>,
    ) -> Self {
        Self {
            callback_id,
            request_id,
            inputs,
            state,
            triggered,
            progress: None,
        }
    }

    pub(crate) fn with_progress(mut self, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        self.progress = sink;
        self
    }

    pub fn callback_id(&self) -> &CallbackId {
        &self.callback_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Value of the `index`-th declared input.
    pub fn input(&self, index: usize) -> Option<&Value> {
        self.inputs.get(index).map(|(_, value)| value)
    }

    pub fn inputs(&self) -> &[(PropRef, Value)] {
        &self.inputs
    }

    /// Value of the `index`-th declared state reference.
    pub fn state_value(&self, index: usize) -> Option<&Value> {
        self.state.get(index).map(|(_, value)| value)
    }

    pub fn state(&self) -> &[(PropRef, Value)] {
        &self.state
    }

    /// Look up any input or state value by reference.
    pub fn value_of(&self, target: &PropRef) -> Option<&Value> {
        self.inputs
            .iter()
            .chain(self.state.iter())
            .find(|(r, _)| r == target)
            .map(|(_, value)| value)
    }

    /// Inputs whose change triggered this call.
    ///
    /// Empty on the initial call and for callbacks reached only through an
    /// upstream callback.
    pub fn triggered(&self) -> &[PropRef] {
        &self.triggered
    }

    pub fn was_triggered_by(&self, target: &PropRef) -> bool {
        self.triggered.contains(target)
    }

    /// Forward a progress update, if anyone is listening.
    pub fn report_progress(&self, progress: impl Into<Value>) {
        if let Some(sink) = &self.progress {
            sink.report(&self.callback_id, self.request_id, progress.into());
        }
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("callback_id", &self.callback_id)
            .field("request_id", &self.request_id)
            .field("inputs", &self.inputs)
            .field("state", &self.state)
            .field("triggered", &self.triggered)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Value)>>);

    impl ProgressSink for Recorder {
        fn report(&self, callback: &CallbackId, _request: RequestId, progress: Value) {
            self.0.lock().push((callback.to_string(), progress));
        }
    }

    fn context() -> CallbackContext {
        CallbackContext::new(
            CallbackId::from("update"),
            RequestId::from(4),
            vec![(PropRef::new("slider", "value"), Value::Int(3))],
            vec![(PropRef::new("text", "value"), Value::from("hi"))],
            vec![PropRef::new("slider", "value")],
        )
    }

    #[test]
    fn positional_and_keyed_lookups() {
        let ctx = context();
        assert_eq!(ctx.input(0), Some(&Value::Int(3)));
        assert_eq!(ctx.input(1), None);
        assert_eq!(ctx.state_value(0), Some(&Value::from("hi")));
        assert_eq!(
            ctx.value_of(&PropRef::new("text", "value")),
            Some(&Value::from("hi"))
        );
        assert!(ctx.was_triggered_by(&PropRef::new("slider", "value")));
        assert!(!ctx.was_triggered_by(&PropRef::new("text", "value")));
    }

    #[test]
    fn progress_goes_to_the_sink() {
        let recorder = Arc::new(Recorder::default());
        let ctx = context().with_progress(Some(recorder.clone()));

        ctx.report_progress(0.5);
        context().report_progress(1.0);

        let seen = recorder.0.lock();
        assert_eq!(seen.as_slice(), &[("update".to_string(), Value::Float(0.5))]);
    }
}
