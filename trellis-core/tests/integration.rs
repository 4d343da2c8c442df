//! Integration Tests for the Callback Engine
//!
//! These tests drive the engine end to end: graph construction, wave
//! resolution, scheduling, merging and the wire boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::json;

use trellis_core::error::ExecutorError;
use trellis_core::exec::{BackgroundJob, JobHandle, JobStatus};
use trellis_core::graph::{GraphBuilder, Resolver};
use trellis_core::wire::FieldsSerializer;
use trellis_core::{
    from_async, BackgroundExecutor, CallbackBinding, CallbackContext, CallbackError, CallbackId,
    ChangeRequest, ComponentTree, Engine, EngineConfig, EngineError, ErrorKind, GraphError,
    Output, ProgressSink, PropRef, Record, RequestId, Table, TaskPoolExecutor, Value, WireCodec,
};

fn value(id: &str) -> PropRef {
    PropRef::new(id, "value")
}

fn layout(ids: &[&str]) -> ComponentTree {
    let mut tree = ComponentTree::new();
    for id in ids {
        tree.insert(*id, [("value", Value::Null)]);
    }
    tree
}

fn link(id: &str, inputs: &[&str], output: &str) -> CallbackBinding {
    let mut builder = CallbackBinding::builder(id).output((output, "value"));
    for input in inputs {
        builder = builder.input((*input, "value"));
    }
    builder.build()
}

fn int_input(ctx: &CallbackContext, index: usize) -> i64 {
    ctx.input(index).and_then(Value::as_i64).unwrap_or(0)
}

/// Diamond: src -> A -> {B, C} -> D.
fn diamond_bindings() -> Vec<CallbackBinding> {
    vec![
        link("A", &["src"], "a"),
        link("B", &["a"], "b"),
        link("C", &["a"], "c"),
        link("D", &["b", "c"], "d"),
    ]
}

const DIAMOND: &[&str] = &["src", "a", "b", "c", "d"];

/// Test that a generated acyclic graph answers lookups consistently in
/// both directions.
#[test]
fn graph_lookups_are_mutually_consistent() {
    // Layered graph: each node reads up to three outputs of the layer above.
    let mut bindings = Vec::new();
    let mut components = vec!["root".to_string()];
    for layer in 0..4 {
        for slot in 0..5 {
            let id = format!("n{layer}_{slot}");
            let mut builder = CallbackBinding::builder(id.as_str()).output((id.as_str(), "value"));
            if layer == 0 {
                builder = builder.input(("root", "value"));
            } else {
                for offset in 0..3 {
                    let parent = format!("n{}_{}", layer - 1, (slot + offset) % 5);
                    builder = builder.input((parent.as_str(), "value"));
                }
                builder = builder.state(("root", "value"));
            }
            bindings.push(builder.build());
            components.push(id);
        }
    }

    let mut tree = ComponentTree::new();
    for id in &components {
        tree.insert(id.clone(), [("value", Value::Null)]);
    }
    let mut builder = GraphBuilder::new();
    for binding in bindings {
        builder.add(binding).unwrap();
    }
    let graph = builder.build(&tree).unwrap();

    for binding in graph.bindings() {
        let id = binding.id();
        for output in binding.outputs() {
            assert_eq!(graph.producers_of(output), Some(id));
        }
        for input in binding.inputs() {
            assert!(graph.consumers_of(input).iter().any(|c| c.callback() == id));
            if let Some(producer) = graph.producers_of(input) {
                assert!(graph.successors(producer).any(|s| s == id));
                assert!(graph.predecessors(id).any(|p| p == producer));
            }
        }
        for next in graph.successors(id) {
            let next_inputs = graph.binding(next).unwrap().inputs();
            assert!(next_inputs
                .iter()
                .any(|input| graph.producers_of(input) == Some(id)));
        }
    }
    assert_eq!(graph.topological_order().len(), graph.len());
}

/// Test that a cycle among input edges aborts engine construction and names
/// the callbacks on it.
#[test]
fn cyclic_bindings_are_rejected_at_startup() {
    let err = Engine::builder()
        .layout(layout(&["src", "p", "q"]))
        .register_fn(link("ping", &["src", "q"], "p"), |_| Ok(vec![Output::NoUpdate]))
        .register_fn(link("pong", &["p"], "q"), |_| Ok(vec![Output::NoUpdate]))
        .build()
        .unwrap_err();

    match err {
        EngineError::Graph(GraphError::CyclicDependency { cycle }) => {
            assert!(cycle.contains(&CallbackId::from("ping")));
            assert!(cycle.contains(&CallbackId::from("pong")));
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

/// Test that a duplicate output is rejected before anything runs.
#[test]
fn duplicate_outputs_are_rejected_at_startup() {
    let err = Engine::builder()
        .layout(layout(&["src", "out"]))
        .register_fn(link("one", &["src"], "out"), |_| Ok(vec![Output::NoUpdate]))
        .register_fn(link("two", &["src"], "out"), |_| Ok(vec![Output::NoUpdate]))
        .build()
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Graph(GraphError::DuplicateOutput { .. })
    ));
}

/// Test that resolving the same change twice yields the same waves.
#[test]
fn resolution_is_idempotent() {
    let mut builder = GraphBuilder::new();
    for binding in diamond_bindings() {
        builder.add(binding).unwrap();
    }
    let graph = builder.build(&layout(DIAMOND)).unwrap();
    let resolver = Resolver::new(&graph);

    let changed = [value("src"), value("b")];
    let first = resolver.resolve(&changed);
    let second = resolver.resolve(&changed);
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

/// Test the diamond: changing A's output runs B and C together, then D.
#[test]
fn diamond_resolves_into_two_waves() {
    let mut builder = GraphBuilder::new();
    for binding in diamond_bindings() {
        builder.add(binding).unwrap();
    }
    let graph = builder.build(&layout(DIAMOND)).unwrap();

    let plan = Resolver::new(&graph).resolve([&value("a")]);
    let waves: Vec<Vec<&str>> = plan
        .waves()
        .iter()
        .map(|wave| wave.members().iter().map(CallbackId::as_str).collect())
        .collect();
    assert_eq!(waves, vec![vec!["B", "C"], vec!["D"]]);
}

/// Test fail-fast: when B fails, D is failed without running and blames B,
/// while C still delivers its patch.
#[tokio::test]
async fn failure_short_circuits_dependents() {
    let d_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&d_calls);

    let engine = Engine::builder()
        .layout(layout(DIAMOND))
        .register_fn(link("A", &["src"], "a"), |ctx| {
            Ok(vec![Output::set(int_input(ctx, 0) + 1)])
        })
        .register_fn(link("B", &["a"], "b"), |_| {
            Err(CallbackError::failed("division by zero"))
        })
        .register_fn(link("C", &["a"], "c"), |ctx| {
            Ok(vec![Output::set(int_input(ctx, 0) * 10)])
        })
        .register_fn(link("D", &["b", "c"], "d"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Output::NoUpdate])
        })
        .build()
        .unwrap();

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(1)))
        .await
        .unwrap();

    assert_eq!(d_calls.load(Ordering::SeqCst), 0);

    let b = outcome.failure_for(&CallbackId::from("B")).unwrap();
    assert_eq!(b.kind, ErrorKind::CallbackExecution);
    assert_eq!(b.message, "division by zero");

    let d = outcome.failure_for(&CallbackId::from("D")).unwrap();
    assert_eq!(d.kind, ErrorKind::UpstreamFailed);
    assert_eq!(d.cause, Some(CallbackId::from("B")));

    assert_eq!(
        outcome.patch_for(&value("c")).map(|p| p.value().clone()),
        Some(Value::Int(20))
    );
    assert_eq!(engine.store().get(&value("c")), Some(Value::Int(20)));
    assert_eq!(engine.store().get(&value("d")), Some(Value::Null));
}

/// Test that the root cause travels through a longer chain.
#[tokio::test]
async fn upstream_cause_names_the_root_failure() {
    let engine = Engine::builder()
        .layout(layout(&["src", "a", "b", "c"]))
        .register_fn(link("first", &["src"], "a"), |_| {
            Err(CallbackError::failed("bad input"))
        })
        .register_fn(link("second", &["a"], "b"), |_| Ok(vec![Output::set(1i64)]))
        .register_fn(link("third", &["b"], "c"), |_| Ok(vec![Output::set(2i64)]))
        .build()
        .unwrap();

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!("x")))
        .await
        .unwrap();

    let third = outcome.failure_for(&CallbackId::from("third")).unwrap();
    assert_eq!(third.cause, Some(CallbackId::from("first")));
    assert!(outcome.patches.is_empty());
}

/// Test that an expired deadline fails the callback with a timeout and
/// propagates like any other failure.
#[tokio::test]
async fn deadline_expiry_fails_fast() {
    let engine = Engine::builder()
        .layout(layout(&["src", "slow", "after"]))
        .config(EngineConfig::default().with_default_timeout(Duration::from_millis(30)))
        .register(
            link("slow", &["src"], "slow"),
            from_async(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallbackError>(vec![Output::set(1i64)])
            }),
        )
        .register_fn(link("after", &["slow"], "after"), |_| Ok(vec![Output::set(2i64)]))
        .build()
        .unwrap();

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(0)))
        .await
        .unwrap();

    assert_eq!(
        outcome.failure_for(&CallbackId::from("slow")).map(|f| f.kind),
        Some(ErrorKind::Timeout)
    );
    assert_eq!(
        outcome.failure_for(&CallbackId::from("after")).map(|f| f.kind),
        Some(ErrorKind::UpstreamFailed)
    );
}

/// Background executor that delegates to the task pool and counts cancels.
struct CountingExecutor {
    inner: TaskPoolExecutor,
    submitted: AtomicUsize,
    cancelled: AtomicUsize,
}

impl CountingExecutor {
    fn new() -> Self {
        Self {
            inner: TaskPoolExecutor::new(4),
            submitted: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackgroundExecutor for CountingExecutor {
    async fn submit(&self, job: BackgroundJob) -> Result<JobHandle, ExecutorError> {
        let handle = self.inner.submit(job).await?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, ExecutorError> {
        self.inner.poll(handle).await
    }

    async fn cancel(&self, handle: &JobHandle) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel(handle).await;
    }
}

/// Test the cancellation race: a newer request overlapping a running one
/// cancels it through the executor, and only the newer result lands.
#[tokio::test]
async fn newer_request_cancels_running_invocation() {
    let executor = Arc::new(CountingExecutor::new());
    let engine = Arc::new(
        Engine::builder()
            .layout(layout(&["text", "shout"]))
            .config(EngineConfig::default().with_poll_interval(Duration::from_millis(2)))
            .executor(executor.clone())
            .register(
                CallbackBinding::builder("shout")
                    .input(("text", "value"))
                    .output(("shout", "value"))
                    .background()
                    .build(),
                from_async(|ctx: CallbackContext| async move {
                    let text = ctx
                        .input(0)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if text == "first" {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Ok::<_, CallbackError>(vec![Output::set(text.to_uppercase())])
                }),
            )
            .build()
            .unwrap(),
    );

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .handle(ChangeRequest::new().trigger(("text", "value"), json!("first")))
                .await
        }
    });
    while executor.submitted.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let second = engine
        .handle(ChangeRequest::new().trigger(("text", "value"), json!("second")))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(executor.cancelled.load(Ordering::SeqCst) >= 1);
    assert_eq!(first.cancelled, vec![CallbackId::from("shout")]);
    assert!(first.patches.is_empty());
    assert!(first.request_id < second.request_id);

    assert_eq!(
        second.patch_for(&value("shout")).map(|p| p.value().clone()),
        Some(Value::from("SECOND"))
    );
    assert_eq!(engine.store().get(&value("shout")), Some(Value::from("SECOND")));
    assert_eq!(engine.store().get(&value("text")), Some(Value::from("second")));
}

fn sleeper(timeout: Option<Duration>) -> CallbackBinding {
    let builder = CallbackBinding::builder("sleeper")
        .input(("src", "value"))
        .output(("out", "value"))
        .background();
    match timeout {
        Some(limit) => builder.timeout(limit).build(),
        None => builder.build(),
    }
}

fn sleeper_engine(executor: Arc<CountingExecutor>, timeout: Option<Duration>) -> Engine {
    Engine::builder()
        .layout(layout(&["src", "out"]))
        .config(EngineConfig::default().with_poll_interval(Duration::from_millis(2)))
        .executor(executor)
        .register(
            sleeper(timeout),
            from_async(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, CallbackError>(vec![Output::set("woke")])
            }),
        )
        .build()
        .unwrap()
}

/// Test that a background job past its deadline is cancelled in the executor
/// and reported as a timeout.
#[tokio::test]
async fn background_deadline_expiry_cancels_the_job() {
    let executor = Arc::new(CountingExecutor::new());
    let engine = sleeper_engine(executor.clone(), Some(Duration::from_millis(30)));

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(1)))
        .await
        .unwrap();

    assert_eq!(
        outcome.failure_for(&CallbackId::from("sleeper")).map(|f| f.kind),
        Some(ErrorKind::Timeout)
    );
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 1);
    assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(executor.inner.pending_jobs(), 0);
}

/// Test that abandoning a request mid-flight cancels its background jobs.
#[tokio::test]
async fn dropped_request_cancels_background_jobs() {
    let executor = Arc::new(CountingExecutor::new());
    let engine = sleeper_engine(executor.clone(), None);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        engine.handle(ChangeRequest::new().trigger(("src", "value"), json!(1))),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 1);
    assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(executor.inner.pending_jobs(), 0);
    assert_eq!(engine.store().get(&value("out")), Some(Value::Null));
}

/// Test that every supported value category survives the wire.
#[test]
fn values_round_trip_through_the_wire() {
    let codec = WireCodec::new().with_serializer(FieldsSerializer::new("Point"));

    let mut map = IndexMap::new();
    map.insert("name".to_string(), Value::from("origin"));
    map.insert("tags".to_string(), Value::List(vec![Value::from("a")]));

    let table = Table::new(["city", "population"])
        .with_row(vec![Value::from("Lyon"), Value::Int(522_000)])
        .unwrap()
        .with_row(vec![Value::from("Nice"), Value::Null])
        .unwrap();

    let point = Record::new("Point")
        .with_field("x", 1.5)
        .with_field("y", Value::Int(-2));

    // Plain maps whose keys look like wire tags.
    let mut table_shaped = IndexMap::new();
    table_shaped.insert(
        "__table__".to_string(),
        Value::Map(IndexMap::from([
            ("columns".to_string(), Value::List(Vec::new())),
            ("rows".to_string(), Value::List(Vec::new())),
        ])),
    );
    let mut record_shaped = IndexMap::new();
    record_shaped.insert("__record__".to_string(), Value::from("x"));

    let samples = vec![
        Value::Null,
        Value::Bool(false),
        Value::Int(i64::MIN),
        Value::Float(3.25),
        Value::from("text"),
        Value::List(vec![Value::Int(1), Value::Null, Value::from("x")]),
        Value::Map(map),
        Value::Table(table),
        Value::Record(point),
        Value::Map(table_shaped),
        Value::Map(record_shaped),
    ];

    for sample in samples {
        let wire = codec.serialize(&sample).unwrap();
        let back = codec.deserialize(&wire).unwrap();
        assert_eq!(back, sample, "wire form was {wire}");
    }
}

/// Test that a record without a registered serializer fails the callback
/// instead of being coerced.
#[tokio::test]
async fn unserializable_output_is_reported() {
    let engine = Engine::builder()
        .layout(layout(&["src", "out"]))
        .register_fn(link("opaque", &["src"], "out"), |_| {
            Ok(vec![Output::set(Record::new("Handle"))])
        })
        .build()
        .unwrap();

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(1)))
        .await
        .unwrap();

    let failure = outcome.failure_for(&CallbackId::from("opaque")).unwrap();
    assert_eq!(failure.kind, ErrorKind::NotSerializable);
    assert!(outcome.patches.is_empty());
}

/// Test the concurrency bound: six ready callbacks, at most two running.
#[tokio::test]
async fn running_invocations_never_exceed_the_limit() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = vec!["src".to_string()];
    let mut builder = Engine::builder().config(EngineConfig::default().with_max_concurrency(2));
    for i in 0..6 {
        let id = format!("worker{i}");
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        builder = builder.register(
            link(&id, &["src"], &id),
            from_async(move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, CallbackError>(vec![Output::set(now as i64)])
                }
            }),
        );
        ids.push(id);
    }
    let names: Vec<&str> = ids.iter().map(String::as_str).collect();
    let engine = builder.layout(layout(&names)).build().unwrap();

    let outcome = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(true)))
        .await
        .unwrap();

    assert_eq!(outcome.patches.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

/// Test that state references are read but never trigger.
#[tokio::test]
async fn state_is_read_without_triggering() {
    let engine = Engine::builder()
        .layout(
            ComponentTree::new()
                .component("button", [("clicks", Value::Int(0))])
                .component("name", [("value", Value::from("Ada"))])
                .component("greeting", [("children", Value::Null)]),
        )
        .register_fn(
            CallbackBinding::builder("greet")
                .input(("button", "clicks"))
                .state(("name", "value"))
                .output(("greeting", "children"))
                .prevent_initial_call(true)
                .build(),
            |ctx| {
                let name = ctx.state_value(0).and_then(Value::as_str).unwrap_or("?");
                Ok(vec![Output::set(format!("Hello, {name}"))])
            },
        )
        .build()
        .unwrap();

    let bootstrap = engine.bootstrap().await.unwrap();
    assert!(bootstrap.statuses.is_empty());

    let typed = engine
        .handle(ChangeRequest::new().trigger(("name", "value"), json!("Grace")))
        .await
        .unwrap();
    assert!(typed.patches.is_empty());
    assert!(typed.statuses.is_empty());

    let clicked = engine
        .handle(
            ChangeRequest::new()
                .trigger(("button", "clicks"), json!(1))
                .value(("name", "value"), json!("Grace")),
        )
        .await
        .unwrap();
    assert_eq!(
        clicked.to_wire().patches[0].value,
        json!("Hello, Grace")
    );
}

/// Test that a callback preventing its update stops the chain below it.
#[tokio::test]
async fn prevented_update_skips_dependents() {
    let engine = Engine::builder()
        .layout(layout(&["src", "gate", "after"]))
        .register_fn(link("gate", &["src"], "gate"), |ctx| {
            if int_input(ctx, 0) < 0 {
                return Err(CallbackError::PreventUpdate);
            }
            Ok(vec![Output::set(int_input(ctx, 0))])
        })
        .register_fn(link("after", &["gate"], "after"), |ctx| {
            Ok(vec![Output::set(int_input(ctx, 0) + 100)])
        })
        .build()
        .unwrap();

    let blocked = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(-1)))
        .await
        .unwrap();
    assert!(blocked.patches.is_empty());
    assert_eq!(blocked.skipped, vec![CallbackId::from("after")]);

    let open = engine
        .handle(ChangeRequest::new().trigger(("src", "value"), json!(5)))
        .await
        .unwrap();
    assert_eq!(open.patches.len(), 2);
    assert_eq!(engine.store().get(&value("after")), Some(Value::Int(105)));
}

/// Test that callbacks see which input triggered them.
#[tokio::test]
async fn callbacks_see_their_triggers() {
    let seen: Arc<Mutex<Vec<PropRef>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let engine = Engine::builder()
        .layout(layout(&["left", "right", "out"]))
        .register_fn(link("which", &["left", "right"], "out"), move |ctx| {
            sink.lock().extend(ctx.triggered().iter().cloned());
            Ok(vec![Output::NoUpdate])
        })
        .build()
        .unwrap();

    engine
        .handle(ChangeRequest::new().trigger(("right", "value"), json!(1)))
        .await
        .unwrap();
    assert_eq!(seen.lock().as_slice(), &[value("right")]);
}

struct CollectProgress(Mutex<Vec<(CallbackId, RequestId, Value)>>);

impl ProgressSink for CollectProgress {
    fn report(&self, callback: &CallbackId, request: RequestId, progress: Value) {
        self.0.lock().push((callback.clone(), request, progress));
    }
}

/// Test that progress reported by a background callback reaches the sink.
#[tokio::test]
async fn background_progress_reaches_the_sink() {
    let progress = Arc::new(CollectProgress(Mutex::new(Vec::new())));
    let engine = Engine::builder()
        .layout(layout(&["src", "job"]))
        .config(EngineConfig::default().with_poll_interval(Duration::from_millis(2)))
        .progress_sink(progress.clone())
        .register(
            CallbackBinding::builder("job")
                .input(("src", "value"))
                .output(("job", "value"))
                .background()
                .build(),
            from_async(|ctx: CallbackContext| async move {
                for step in 1..=3i64 {
                    ctx.report_progress(step);
                }
                Ok::<_, CallbackError>(vec![Output::set("done")])
            }),
        )
        .build()
        .unwrap();

    let outcome = engine.bootstrap().await.unwrap();
    assert!(outcome.is_clean());

    let reports = progress.0.lock();
    let steps: Vec<&Value> = reports.iter().map(|(_, _, v)| v).collect();
    assert_eq!(steps, vec![&Value::Int(1), &Value::Int(2), &Value::Int(3)]);
    assert!(reports
        .iter()
        .all(|(id, request, _)| id.as_str() == "job" && *request == outcome.request_id));
}
