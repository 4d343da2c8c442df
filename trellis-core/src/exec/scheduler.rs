//! Execution Scheduler
//!
//! The scheduler runs one wave at a time. Every member of a wave is spawned
//! onto a [`JoinSet`] at once; the wave is done when all of them have
//! reached a terminal state.
//!
//! # Invocation Steps
//!
//! 1. Wait for a permit from the engine-wide semaphore. While waiting the
//!    invocation is still Pending, and cancelling its token ends it as
//!    Cancelled without running.
//! 2. Run the callback. Inline callbacks are awaited in the invocation task;
//!    background callbacks are submitted to the [`BackgroundExecutor`] and
//!    polled every `poll_interval`.
//! 3. Race the run against the request's cancellation token and the
//!    invocation deadline. Whichever fires first wins; a background job that
//!    loses the race is cancelled in the executor.
//! 4. Check the result against the binding (one output per declared output)
//!    and serialize every value that was set. Anything that cannot cross the
//!    wire fails the invocation.
//!
//! A panic inside an inline callback takes down only its own task and is
//! reported as a failed invocation.

use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use super::callback::{Callback, CallbackResult, Output};
use super::context::CallbackContext;
use super::executor::{BackgroundExecutor, BackgroundJob, JobHandle, JobStatus};
use super::invocation::{Completion, Invocation, InvocationOutcome, InvocationStatus};
use crate::config::EngineConfig;
use crate::error::{CallbackError, ErrorKind};
use crate::graph::{CallbackBinding, ExecutionMode};
use crate::store::Patch;
use crate::wire::WireCodec;

/// Everything needed to run one invocation.
pub struct Dispatch {
    pub invocation: Invocation,
    pub binding: CallbackBinding,
    pub callback: Arc<dyn Callback>,
    pub context: CallbackContext,
    pub token: CancellationToken,
}

enum Ran {
    Completed(CallbackResult),
    TimedOut(Duration),
    Cancelled,
    Crashed(String),
}

/// Runs waves of invocations under a shared concurrency limit.
#[derive(Clone)]
pub struct Scheduler {
    permits: Arc<Semaphore>,
    executor: Arc<dyn BackgroundExecutor>,
    codec: Arc<WireCodec>,
    default_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        config: &EngineConfig,
        executor: Arc<dyn BackgroundExecutor>,
        codec: Arc<WireCodec>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            executor,
            codec,
            default_timeout: config.default_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Permits not currently held by a running invocation.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run every dispatch to a terminal state. Outcomes come back in
    /// dispatch order.
    pub async fn run_wave(&self, dispatches: Vec<Dispatch>) -> Vec<InvocationOutcome> {
        let mut slots: Vec<Option<InvocationOutcome>> = Vec::with_capacity(dispatches.len());
        let mut fallback = Vec::with_capacity(dispatches.len());
        let mut set = JoinSet::new();

        for (index, dispatch) in dispatches.into_iter().enumerate() {
            slots.push(None);
            fallback.push(dispatch.invocation.clone());

            let span = debug_span!("invocation", callback = %dispatch.invocation.callback_id());
            let scheduler = self.clone();
            set.spawn(async move { (index, scheduler.run_one(dispatch).await) }.instrument(span));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => warn!(error = %err, "invocation task ended abnormally"),
            }
        }

        slots
            .into_iter()
            .zip(fallback)
            .map(|(slot, invocation)| {
                slot.unwrap_or_else(|| {
                    let completion =
                        Completion::failed(ErrorKind::CallbackExecution, "callback panicked");
                    finish(invocation, completion)
                })
            })
            .collect()
    }

    async fn run_one(&self, dispatch: Dispatch) -> InvocationOutcome {
        let Dispatch {
            mut invocation,
            binding,
            callback,
            context,
            token,
        } = dispatch;

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return finish(invocation, Completion::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let completion =
                        Completion::failed(ErrorKind::CallbackExecution, "scheduler is shut down");
                    return finish(invocation, completion);
                }
            },
        };

        if let Err(err) = invocation.transition(InvocationStatus::Running) {
            warn!(error = %err, "invocation could not start");
        }
        let started = Instant::now();
        let deadline = binding.timeout().or(self.default_timeout);

        let ran = match binding.mode() {
            ExecutionMode::Inline => run_inline(callback, context, &token, deadline).await,
            ExecutionMode::Background => {
                self.run_background(&binding, callback, context, &token, deadline)
                    .await
            }
        };
        drop(permit);

        let completion = match ran {
            Ran::Completed(Ok(outputs)) => self.collect_writes(&binding, outputs),
            Ran::Completed(Err(CallbackError::PreventUpdate)) => Completion::Succeeded(Vec::new()),
            Ran::Completed(Err(CallbackError::Failed(message))) => {
                Completion::failed(ErrorKind::CallbackExecution, message)
            }
            Ran::TimedOut(limit) => Completion::failed(
                ErrorKind::Timeout,
                format!("exceeded deadline of {} ms", limit.as_millis()),
            ),
            Ran::Cancelled => Completion::Cancelled,
            Ran::Crashed(message) => Completion::failed(ErrorKind::CallbackExecution, message),
        };

        debug!(
            status = ?completion.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invocation finished"
        );
        finish(invocation, completion)
    }

    async fn run_background(
        &self,
        binding: &CallbackBinding,
        callback: Arc<dyn Callback>,
        context: CallbackContext,
        token: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Ran {
        let job = BackgroundJob {
            callback_id: binding.id().clone(),
            callback,
            context,
        };
        let handle = match self.executor.submit(job).await {
            Ok(handle) => handle,
            Err(err) => return Ran::Crashed(err.to_string()),
        };
        let mut guard = JobGuard {
            executor: Arc::clone(&self.executor),
            handle: Some(handle.clone()),
        };

        let expiry = expire(deadline);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    guard.cancel().await;
                    return Ran::Cancelled;
                }
                _ = &mut expiry => {
                    guard.cancel().await;
                    return Ran::TimedOut(deadline.unwrap_or_default());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let ran = match self.executor.poll(&handle).await {
                Ok(JobStatus::Running) => continue,
                Ok(JobStatus::Succeeded(outputs)) => Ran::Completed(Ok(outputs)),
                Ok(JobStatus::Failed(err)) => Ran::Completed(Err(err)),
                Err(err) => Ran::Crashed(err.to_string()),
            };
            guard.handle = None;
            return ran;
        }
    }

    fn collect_writes(&self, binding: &CallbackBinding, outputs: Vec<Output>) -> Completion {
        let declared = binding.outputs();
        if outputs.len() != declared.len() {
            return Completion::failed(
                ErrorKind::CallbackExecution,
                format!(
                    "returned {} outputs but {} are declared",
                    outputs.len(),
                    declared.len()
                ),
            );
        }

        let mut patches = Vec::with_capacity(declared.len());
        for (target, output) in declared.iter().zip(outputs) {
            let Output::Set(value) = output else {
                continue;
            };
            match self.codec.serialize(&value) {
                Ok(wire) => patches.push(Patch::new(target.clone(), value, wire)),
                Err(err) => {
                    return Completion::failed(
                        ErrorKind::NotSerializable,
                        format!("output `{target}`: {err}"),
                    )
                }
            }
        }
        Completion::Succeeded(patches)
    }
}

/// Cancels a submitted job unless its result was collected, including when
/// the invocation future is dropped while polling.
struct JobGuard {
    executor: Arc<dyn BackgroundExecutor>,
    handle: Option<JobHandle>,
}

impl JobGuard {
    async fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.executor.cancel(&handle).await;
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(job = %handle.id, "request dropped, cancelling background job");
                let executor = Arc::clone(&self.executor);
                runtime.spawn(async move { executor.cancel(&handle).await });
            }
            Err(_) => warn!(job = %handle.id, "no runtime to cancel abandoned background job"),
        }
    }
}

async fn run_inline(
    callback: Arc<dyn Callback>,
    context: CallbackContext,
    token: &CancellationToken,
    deadline: Option<Duration>,
) -> Ran {
    tokio::select! {
        biased;
        _ = token.cancelled() => Ran::Cancelled,
        _ = expire(deadline) => Ran::TimedOut(deadline.unwrap_or_default()),
        result = callback.call(context) => Ran::Completed(result),
    }
}

/// Completes after `deadline`, or never.
async fn expire(deadline: Option<Duration>) {
    match deadline {
        Some(limit) => tokio::time::sleep(limit).await,
        None => pending().await,
    }
}

fn finish(mut invocation: Invocation, completion: Completion) -> InvocationOutcome {
    if let Err(err) = invocation.complete(&completion) {
        warn!(
            callback = %invocation.callback_id(),
            error = %err,
            "invocation already finished"
        );
    }
    InvocationOutcome {
        invocation,
        completion,
    }
}
