//! Background Executors
//!
//! Callbacks bound with [`ExecutionMode::Background`](crate::graph::ExecutionMode)
//! are not run inside the invocation task. They are submitted to a
//! [`BackgroundExecutor`] and polled until they finish, which lets long
//! computations live on a worker pool whose lifetime is independent of any
//! single request.
//!
//! The contract:
//!
//! - `submit(job) -> handle`
//! - `poll(handle) -> Running | Succeeded(outputs) | Failed(error)`
//! - `cancel(handle)`
//!
//! A job whose status has been reported as finished by `poll`, or that has
//! been cancelled, is forgotten by the executor; polling it again yields
//! [`ExecutorError::UnknownJob`].
//!
//! [`TaskPoolExecutor`] is the in-process implementation backed by tokio
//! tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::callback::{Callback, CallbackResult, Output};
use super::context::CallbackContext;
use crate::error::{CallbackError, ExecutorError};
use crate::graph::CallbackId;

/// Identifies a submitted job within one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Returned by [`BackgroundExecutor::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub callback_id: CallbackId,
}

/// Reported by [`BackgroundExecutor::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Running,
    Succeeded(Vec<Output>),
    Failed(CallbackError),
}

/// Work handed to a background executor.
pub struct BackgroundJob {
    pub callback_id: CallbackId,
    pub callback: Arc<dyn Callback>,
    pub context: CallbackContext,
}

impl BackgroundJob {
    /// Run the callback to completion.
    pub async fn run(self) -> CallbackResult {
        self.callback.call(self.context).await
    }
}

impl fmt::Debug for BackgroundJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundJob")
            .field("callback_id", &self.callback_id)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// External worker pool used for background callbacks.
#[async_trait]
pub trait BackgroundExecutor: Send + Sync {
    async fn submit(&self, job: BackgroundJob) -> Result<JobHandle, ExecutorError>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, ExecutorError>;

    /// Stop the job if it is still running. Cancelling an unknown or
    /// finished job is a no-op.
    async fn cancel(&self, handle: &JobHandle);
}

#[derive(Default)]
struct JobEntry {
    abort: Option<AbortHandle>,
    result: Option<CallbackResult>,
}

/// Runs background jobs on tokio tasks, at most `workers` at a time.
pub struct TaskPoolExecutor {
    workers: Arc<Semaphore>,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    next_id: AtomicU64,
}

impl TaskPoolExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            jobs: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Jobs submitted and not yet collected or cancelled.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

impl fmt::Debug for TaskPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPoolExecutor")
            .field("idle_workers", &self.workers.available_permits())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

#[async_trait]
impl BackgroundExecutor for TaskPoolExecutor {
    async fn submit(&self, job: BackgroundJob) -> Result<JobHandle, ExecutorError> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = JobHandle {
            id,
            callback_id: job.callback_id.clone(),
        };
        self.jobs.insert(id, JobEntry::default());

        let workers = Arc::clone(&self.workers);
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                if let Some(mut entry) = jobs.get_mut(&id) {
                    entry.result = Some(Err(CallbackError::failed("worker pool closed")));
                }
                return;
            };

            let callback_id = job.callback_id.clone();
            let task = {
                // Cancelled while waiting for a worker.
                let Some(mut entry) = jobs.get_mut(&id) else {
                    return;
                };
                let task = tokio::spawn(job.run());
                entry.abort = Some(task.abort_handle());
                task
            };

            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    warn!(callback = %callback_id, job = %id, "background callback panicked");
                    Err(CallbackError::failed("callback panicked"))
                }
                Err(_) => return,
            };
            if let Some(mut entry) = jobs.get_mut(&id) {
                entry.result = Some(result);
            }
        });

        debug!(callback = %handle.callback_id, job = %id, "background job submitted");
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, ExecutorError> {
        let status = match self.jobs.get(&handle.id) {
            None => return Err(ExecutorError::UnknownJob(handle.id.raw())),
            Some(entry) => match &entry.result {
                None => JobStatus::Running,
                Some(Ok(outputs)) => JobStatus::Succeeded(outputs.clone()),
                Some(Err(err)) => JobStatus::Failed(err.clone()),
            },
        };
        if status != JobStatus::Running {
            self.jobs.remove(&handle.id);
        }
        Ok(status)
    }

    async fn cancel(&self, handle: &JobHandle) {
        if let Some((_, entry)) = self.jobs.remove(&handle.id) {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            debug!(callback = %handle.callback_id, job = %handle.id, "background job cancelled");
        }
    }
}
