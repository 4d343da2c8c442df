//! Callback Execution
//!
//! Everything between "this callback must run" and "here are its patches":
//!
//! - [`Callback`]: the application function behind a binding
//! - [`CallbackContext`]: the input and state values it is called with
//! - [`Invocation`]: the per-request lifecycle of one callback run
//! - [`Scheduler`]: runs a wave under the engine-wide concurrency limit,
//!   with deadlines and cancellation
//! - [`BackgroundExecutor`]: the worker-pool contract for long-running
//!   callbacks, with [`TaskPoolExecutor`] as the in-process implementation

mod callback;
mod context;
mod executor;
mod invocation;
mod scheduler;

pub use callback::{
    from_async, from_fn, AsyncFnCallback, Callback, CallbackResult, FnCallback, Output,
};
pub use context::{CallbackContext, ProgressSink};
pub use executor::{
    BackgroundExecutor, BackgroundJob, JobHandle, JobId, JobStatus, TaskPoolExecutor,
};
pub use invocation::{Completion, Invocation, InvocationOutcome, InvocationStatus};
pub use scheduler::{Dispatch, Scheduler};
