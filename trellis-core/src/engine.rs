//! Engine
//!
//! The engine ties the pieces together. It owns the frozen dependency graph,
//! the registered callbacks, the property store and the scheduler, and turns
//! each inbound [`ChangeRequest`] into a [`RequestOutcome`].
//!
//! # Request Flow
//!
//! 1. The client-observed values are decoded and staged in a fresh
//!    transaction, so callbacks see exactly what the client saw.
//! 2. The triggers are resolved into waves.
//! 3. The request claims every callback in its plan. A claim held by an
//!    older request is taken over and that request's invocation of the
//!    callback is cancelled (last request wins).
//! 4. Waves run in order. Before each wave, every member is checked:
//!    - a member downstream of a failure fails with `UpstreamFailed`
//!    - a member whose claim was lost, or downstream of a cancelled member,
//!      is cancelled
//!    - in a change request, a member none of whose inputs changed is
//!      skipped
//!
//!    Everything else is dispatched with inputs read from the transaction.
//! 5. Succeeded outputs are merged after each wave. Outputs of an invocation
//!    whose claim was lost while it ran are dropped.
//! 6. Claims are released and the transaction is committed. Values a newer
//!    request has already written are left alone and their patches dropped.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, GraphError, SerializationError};
use crate::exec::{
    from_fn, BackgroundExecutor, Callback, CallbackContext, CallbackResult, Completion, Dispatch,
    Invocation, InvocationStatus, ProgressSink, Scheduler, TaskPoolExecutor,
};
use crate::graph::{
    CallbackBinding, CallbackId, DependencyGraph, ExecutionPlan, GraphBuilder, PropRef, Resolver,
};
use crate::request::{ChangeRequest, ExecutionRequest, RequestCounter, RequestId};
use crate::store::{ComponentTree, Merger, Patch, PropertyStore, Snapshot, Transaction};
use crate::wire::{CustomSerializer, Value, WireCodec, WireResponse};

/// Structured report of a callback that did not produce its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub callback_id: CallbackId,
    pub kind: ErrorKind,
    pub message: String,
    /// The callback whose failure this one inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<CallbackId>,
}

/// Result of one request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    /// Property updates in merge order.
    pub patches: Vec<Patch>,
    pub failures: Vec<FailureReport>,
    /// Invocations superseded by a newer request.
    pub cancelled: Vec<CallbackId>,
    /// Invocations pruned because none of their inputs changed.
    pub skipped: Vec<CallbackId>,
    /// Final status of every planned callback, in plan order.
    pub statuses: IndexMap<CallbackId, InvocationStatus>,
}

impl RequestOutcome {
    pub fn status_of(&self, callback: &CallbackId) -> Option<InvocationStatus> {
        self.statuses.get(callback).copied()
    }

    pub fn failure_for(&self, callback: &CallbackId) -> Option<&FailureReport> {
        self.failures.iter().find(|f| &f.callback_id == callback)
    }

    pub fn patch_for(&self, target: &PropRef) -> Option<&Patch> {
        self.patches.iter().find(|p| p.target() == target)
    }

    /// Whether every planned callback either succeeded or was skipped.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cancelled.is_empty()
    }

    pub fn to_wire(&self) -> WireResponse {
        WireResponse {
            request_id: self.request_id.raw(),
            patches: self.patches.iter().map(Patch::to_wire).collect(),
            failures: self.failures.clone(),
            cancelled: self.cancelled.clone(),
        }
    }
}

/// Assembles an [`Engine`].
///
/// Registration errors are held until [`build`](Self::build) so calls can
/// be chained.
pub struct EngineBuilder {
    layout: ComponentTree,
    graph: GraphBuilder,
    callbacks: IndexMap<CallbackId, Arc<dyn Callback>>,
    config: EngineConfig,
    executor: Option<Arc<dyn BackgroundExecutor>>,
    codec: WireCodec,
    progress: Option<Arc<dyn ProgressSink>>,
    error: Option<GraphError>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            layout: ComponentTree::new(),
            graph: GraphBuilder::new(),
            callbacks: IndexMap::new(),
            config: EngineConfig::default(),
            executor: None,
            codec: WireCodec::new(),
            progress: None,
            error: None,
        }
    }

    pub fn layout(mut self, layout: ComponentTree) -> Self {
        self.layout = layout;
        self
    }

    /// Declare a binding and the callback that implements it.
    pub fn register(self, binding: CallbackBinding, callback: impl Callback + 'static) -> Self {
        let id = binding.id().clone();
        self.binding(binding).callback(id, Arc::new(callback))
    }

    /// Shorthand for [`register`](Self::register) with a synchronous closure.
    pub fn register_fn<F>(self, binding: CallbackBinding, f: F) -> Self
    where
        F: Fn(&CallbackContext) -> CallbackResult + Send + Sync + 'static,
    {
        self.register(binding, from_fn(f))
    }

    /// Declare a binding whose callback is supplied separately.
    pub fn binding(mut self, binding: CallbackBinding) -> Self {
        if self.error.is_none() {
            if let Err(err) = self.graph.add(binding) {
                self.error = Some(err);
            }
        }
        self
    }

    /// Supply the callback for a declared binding.
    pub fn callback(mut self, id: impl Into<CallbackId>, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.insert(id.into(), callback);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `executor` for background callbacks instead of the built-in
    /// [`TaskPoolExecutor`].
    pub fn executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Register a serializer for a custom record type.
    pub fn serializer(mut self, serializer: impl CustomSerializer + 'static) -> Self {
        self.codec.register(Arc::new(serializer));
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        self.config.validate()?;

        let graph = self.graph.build(&self.layout)?;
        if let Some(missing) = graph
            .bindings()
            .find(|binding| !self.callbacks.contains_key(binding.id()))
        {
            return Err(EngineError::MissingCallback(missing.id().clone()));
        }
        for id in self.callbacks.keys().filter(|id| !graph.contains(id)) {
            warn!(callback = %id, "callback has no binding and will never run");
        }

        let executor: Arc<dyn BackgroundExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(TaskPoolExecutor::new(self.config.background_workers)),
        };
        let codec = Arc::new(self.codec);
        let scheduler = Scheduler::new(&self.config, executor, Arc::clone(&codec));
        let store = Arc::new(PropertyStore::from_tree(&self.layout));

        info!(
            callbacks = graph.len(),
            components = self.layout.len(),
            max_concurrency = self.config.max_concurrency,
            "engine ready"
        );

        Ok(Engine {
            graph: Arc::new(graph),
            layout: self.layout,
            callbacks: self.callbacks,
            store,
            scheduler,
            codec,
            claims: DashMap::new(),
            progress: self.progress,
            requests: RequestCounter::default(),
            config: self.config,
        })
    }
}

#[derive(Debug)]
struct Claim {
    request: RequestId,
    token: CancellationToken,
}

/// Releases a request's claims when it finishes, however it finishes.
struct ClaimGuard<'e> {
    claims: &'e DashMap<CallbackId, Claim>,
    request: RequestId,
    callbacks: Vec<CallbackId>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        for id in &self.callbacks {
            self.claims
                .remove_if(id, |_, claim| claim.request == self.request);
        }
    }
}

/// Per-request bookkeeping while waves run.
#[derive(Default)]
struct Ledger {
    statuses: IndexMap<CallbackId, InvocationStatus>,
    failures: Vec<FailureReport>,
    cancelled: Vec<CallbackId>,
    skipped: Vec<CallbackId>,
    /// Failed callback to the callback whose failure started the chain.
    root_cause: HashMap<CallbackId, CallbackId>,
}

impl Ledger {
    fn fail(
        &mut self,
        id: CallbackId,
        kind: ErrorKind,
        message: String,
        cause: Option<CallbackId>,
    ) {
        warn!(callback = %id, ?kind, %message, "callback failed");
        self.root_cause
            .insert(id.clone(), cause.clone().unwrap_or_else(|| id.clone()));
        self.statuses.insert(id.clone(), InvocationStatus::Failed);
        self.failures.push(FailureReport {
            callback_id: id,
            kind,
            message,
            cause,
        });
    }

    fn cancel(&mut self, id: CallbackId) {
        self.statuses.insert(id.clone(), InvocationStatus::Cancelled);
        self.cancelled.push(id);
    }

    fn skip(&mut self, id: CallbackId) {
        self.statuses.insert(id.clone(), InvocationStatus::Skipped);
        self.skipped.push(id);
    }

    fn is_cancelled(&self, id: &CallbackId) -> bool {
        self.statuses.get(id) == Some(&InvocationStatus::Cancelled)
    }
}

/// The callback engine.
pub struct Engine {
    graph: Arc<DependencyGraph>,
    layout: ComponentTree,
    callbacks: IndexMap<CallbackId, Arc<dyn Callback>>,
    store: Arc<PropertyStore>,
    scheduler: Scheduler,
    codec: Arc<WireCodec>,
    claims: DashMap<CallbackId, Claim>,
    progress: Option<Arc<dyn ProgressSink>>,
    requests: RequestCounter,
    config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn layout(&self) -> &ComponentTree {
        &self.layout
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    /// The last committed property values.
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the initial call for a freshly loaded page.
    pub async fn bootstrap(&self) -> Result<RequestOutcome, EngineError> {
        let request = ExecutionRequest::bootstrap(self.requests.next());
        let plan = Resolver::new(&self.graph).resolve_bootstrap();
        let span = info_span!("request", id = %request.id(), bootstrap = true);
        self.execute(request, plan, Vec::new())
            .instrument(span)
            .await
    }

    /// Handle a client-observed change.
    pub async fn handle(&self, change: ChangeRequest) -> Result<RequestOutcome, EngineError> {
        for target in &change.triggers {
            if !self.layout.contains(target.id()) {
                return Err(EngineError::UnknownComponent(target.clone()));
            }
        }
        let mut values = Vec::with_capacity(change.values.len());
        for prop in &change.values {
            let target = prop.target();
            if !self.layout.contains(target.id()) {
                return Err(EngineError::UnknownComponent(target));
            }
            let value = self.codec.deserialize(&prop.value)?;
            values.push((target, value));
        }

        let request = ExecutionRequest::new(self.requests.next(), change.triggers);
        let plan = Resolver::new(&self.graph).resolve(request.triggers());
        let span = info_span!(
            "request",
            id = %request.id(),
            triggers = request.triggers().len()
        );
        self.execute(request, plan, values).instrument(span).await
    }

    /// Encode an outcome in the configured wire format.
    pub fn encode(&self, outcome: &RequestOutcome) -> Result<Vec<u8>, SerializationError> {
        self.config.wire_format.encode(&outcome.to_wire())
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        plan: ExecutionPlan,
        values: Vec<(PropRef, Value)>,
    ) -> Result<RequestOutcome, EngineError> {
        let id = request.id();
        let (tokens, guard) = self.claim(id, &plan);

        let mut tx = self.store.transaction();
        for (target, value) in values {
            tx.stage(target, value);
        }

        let mut merger = Merger::new();
        let mut ledger = Ledger::default();

        for (index, wave) in plan.waves().iter().enumerate() {
            let mut dispatches = Vec::with_capacity(wave.len());
            for callback_id in wave.members() {
                if let Some(dispatch) =
                    self.prepare(&request, &plan, callback_id, &tokens, &tx, &merger, &mut ledger)
                {
                    dispatches.push(dispatch);
                }
            }
            if dispatches.is_empty() {
                continue;
            }

            debug!(wave = index, size = dispatches.len(), "running wave");
            let mut writes = Vec::new();
            for outcome in self.scheduler.run_wave(dispatches).await {
                let callback_id = outcome.invocation.callback_id().clone();
                let lost = tokens
                    .get(&callback_id)
                    .is_some_and(CancellationToken::is_cancelled);
                match outcome.completion {
                    Completion::Succeeded(_) if lost => ledger.cancel(callback_id),
                    Completion::Succeeded(patches) => {
                        ledger
                            .statuses
                            .insert(callback_id.clone(), InvocationStatus::Succeeded);
                        writes.push((callback_id, patches));
                    }
                    Completion::Failed {
                        kind,
                        message,
                        cause,
                    } => ledger.fail(callback_id, kind, message, cause),
                    Completion::Cancelled => ledger.cancel(callback_id),
                    Completion::Skipped => ledger.skip(callback_id),
                }
            }
            merger.merge_wave(&mut tx, index, writes)?;
        }

        drop(guard);
        let summary = tx.commit(id);
        let mut patches = merger.finish();
        if !summary.stale.is_empty() {
            debug!(stale = summary.stale.len(), "newer request already wrote some outputs");
            patches.retain(|patch| !summary.stale.contains(patch.target()));
        }

        info!(
            patches = patches.len(),
            failures = ledger.failures.len(),
            cancelled = ledger.cancelled.len(),
            skipped = ledger.skipped.len(),
            version = summary.version,
            elapsed_ms = request.received_at().elapsed().as_millis() as u64,
            "request complete"
        );

        Ok(RequestOutcome {
            request_id: id,
            patches,
            failures: ledger.failures,
            cancelled: ledger.cancelled,
            skipped: ledger.skipped,
            statuses: ledger.statuses,
        })
    }

    /// Decide what happens to one planned callback. Returns a dispatch when
    /// it should actually run.
    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        request: &ExecutionRequest,
        plan: &ExecutionPlan,
        callback_id: &CallbackId,
        tokens: &IndexMap<CallbackId, CancellationToken>,
        tx: &Transaction<'_>,
        merger: &Merger,
        ledger: &mut Ledger,
    ) -> Option<Dispatch> {
        let binding = self.graph.binding(callback_id)?;

        let upstream = self
            .graph
            .predecessors(callback_id)
            .find_map(|pred| ledger.root_cause.get(pred))
            .cloned();
        if let Some(cause) = upstream {
            let message = format!("upstream callback `{cause}` failed");
            ledger.fail(
                callback_id.clone(),
                ErrorKind::UpstreamFailed,
                message,
                Some(cause),
            );
            return None;
        }

        let token = tokens
            .get(callback_id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);
        if token.is_cancelled()
            || self
                .graph
                .predecessors(callback_id)
                .any(|pred| ledger.is_cancelled(pred))
        {
            ledger.cancel(callback_id.clone());
            return None;
        }

        if !request.is_bootstrap() {
            let fresh = binding
                .inputs()
                .iter()
                .any(|input| request.triggers().contains(input) || merger.is_written(input));
            if !fresh {
                ledger.skip(callback_id.clone());
                return None;
            }
        }

        let Some(callback) = self.callbacks.get(callback_id) else {
            ledger.fail(
                callback_id.clone(),
                ErrorKind::CallbackExecution,
                "no callback registered".to_string(),
                None,
            );
            return None;
        };

        let read = |refs: &[PropRef]| -> Vec<(PropRef, Value)> {
            refs.iter()
                .map(|target| (target.clone(), tx.get(target).cloned().unwrap_or_default()))
                .collect()
        };
        let inputs = read(binding.inputs());
        let state = read(binding.state());

        let context = CallbackContext::new(
            callback_id.clone(),
            request.id(),
            inputs.clone(),
            state.clone(),
            plan.triggered_by(callback_id).to_vec(),
        )
        .with_progress(self.progress.clone());

        Some(Dispatch {
            invocation: Invocation::new(callback_id.clone(), request.id())
                .with_values(inputs, state),
            binding: binding.clone(),
            callback: Arc::clone(callback),
            context,
            token,
        })
    }

    /// Take over every callback in `plan` for `request`.
    fn claim(
        &self,
        request: RequestId,
        plan: &ExecutionPlan,
    ) -> (IndexMap<CallbackId, CancellationToken>, ClaimGuard<'_>) {
        let mut tokens = IndexMap::with_capacity(plan.len());
        for callback_id in plan.callbacks() {
            let token = CancellationToken::new();
            match self.claims.entry(callback_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let held = entry.get();
                    if held.request < request {
                        debug!(
                            callback = %callback_id,
                            superseded = %held.request,
                            "cancelling superseded invocation"
                        );
                        held.token.cancel();
                        entry.insert(Claim {
                            request,
                            token: token.clone(),
                        });
                    } else {
                        // A newer request got here first.
                        token.cancel();
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Claim {
                        request,
                        token: token.clone(),
                    });
                }
            }
            tokens.insert(callback_id.clone(), token);
        }

        let guard = ClaimGuard {
            claims: &self.claims,
            request,
            callbacks: tokens.keys().cloned().collect(),
        };
        (tokens, guard)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("callbacks", &self.graph.len())
            .field("components", &self.layout.len())
            .field("store_version", &self.store.version())
            .field("in_flight", &self.claims.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Output;
    use serde_json::json;

    fn layout() -> ComponentTree {
        ComponentTree::new()
            .component("input", [("value", Value::Int(1))])
            .component("double", [("value", Value::Null)])
            .component("label", [("children", Value::Null)])
    }

    fn engine() -> Engine {
        Engine::builder()
            .layout(layout())
            .register_fn(
                CallbackBinding::builder("double")
                    .input(("input", "value"))
                    .output(("double", "value"))
                    .build(),
                |ctx| {
                    let n = ctx.input(0).and_then(Value::as_i64).unwrap_or(0);
                    Ok(vec![Output::set(n * 2)])
                },
            )
            .register_fn(
                CallbackBinding::builder("label")
                    .input(("double", "value"))
                    .output(("label", "children"))
                    .build(),
                |ctx| {
                    let n = ctx.input(0).and_then(Value::as_i64).unwrap_or(0);
                    Ok(vec![Output::set(format!("doubled: {n}"))])
                },
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_runs_the_chain() {
        let engine = engine();
        let outcome = engine.bootstrap().await.unwrap();

        assert!(outcome.is_clean());
        assert_eq!(
            outcome.patch_for(&PropRef::new("label", "children")).map(Patch::value),
            Some(&Value::from("doubled: 2"))
        );
        assert_eq!(
            engine.store().get(&PropRef::new("double", "value")),
            Some(Value::Int(2))
        );
    }

    #[tokio::test]
    async fn change_uses_client_values() {
        let engine = engine();
        let outcome = engine
            .handle(ChangeRequest::new().trigger(("input", "value"), json!(21)))
            .await
            .unwrap();

        let wire = outcome.to_wire();
        assert_eq!(wire.patches.len(), 2);
        assert_eq!(wire.patches[0].value, json!(42));
        assert_eq!(wire.patches[1].value, json!("doubled: 42"));
        assert_eq!(
            engine.store().get(&PropRef::new("input", "value")),
            Some(Value::Int(21))
        );
    }

    #[tokio::test]
    async fn unknown_trigger_component_is_rejected() {
        let engine = engine();
        let err = engine
            .handle(ChangeRequest::new().trigger(("ghost", "value"), json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownComponent(_)));
    }

    #[test]
    fn missing_callback_is_a_build_error() {
        let err = Engine::builder()
            .layout(layout())
            .binding(
                CallbackBinding::builder("orphan")
                    .input(("input", "value"))
                    .output(("double", "value"))
                    .build(),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingCallback(id) if id.as_str() == "orphan"));
    }

    #[test]
    fn registration_errors_surface_at_build() {
        let binding = || {
            CallbackBinding::builder("twin")
                .input(("input", "value"))
                .output(("double", "value"))
                .build()
        };
        let err = Engine::builder()
            .layout(layout())
            .register_fn(binding(), |_| Ok(vec![Output::NoUpdate]))
            .register_fn(binding(), |_| Ok(vec![Output::NoUpdate]))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::DuplicateCallback(_))
        ));
    }

    #[tokio::test]
    async fn encode_uses_configured_format() {
        let engine = Engine::builder()
            .layout(layout())
            .config(EngineConfig {
                wire_format: crate::wire::WireFormat::MessagePack,
                ..EngineConfig::default()
            })
            .build()
            .unwrap();
        let outcome = engine.bootstrap().await.unwrap();
        let bytes = engine.encode(&outcome).unwrap();
        let decoded: WireResponse = crate::wire::WireFormat::MessagePack.decode(&bytes).unwrap();
        assert_eq!(decoded, outcome.to_wire());
    }
}
