//! Callback Functions
//!
//! A [`Callback`] is the application code behind a binding. It receives a
//! [`CallbackContext`] with the current input and state values and returns
//! one [`Output`] per declared output, in declaration order.
//!
//! Most callbacks are plain functions; [`from_fn`] and [`from_async`] wrap
//! closures so they can be registered without a hand-written impl.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::CallbackContext;
use crate::error::CallbackError;
use crate::wire::Value;

/// One output slot of a callback result.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Write this value to the output.
    Set(Value),

    /// Leave the output unchanged. No patch is emitted.
    NoUpdate,
}

impl Output {
    pub fn set(value: impl Into<Value>) -> Self {
        Self::Set(value.into())
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Self::Set(value)
    }
}

pub type CallbackResult = Result<Vec<Output>, CallbackError>;

/// Application code bound to a [`CallbackBinding`](crate::graph::CallbackBinding).
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, ctx: CallbackContext) -> CallbackResult;
}

/// A synchronous closure callback. See [`from_fn`].
pub struct FnCallback<F> {
    f: F,
}

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(&CallbackContext) -> CallbackResult + Send + Sync,
{
    async fn call(&self, ctx: CallbackContext) -> CallbackResult {
        (self.f)(&ctx)
    }
}

/// Wrap a synchronous closure.
///
/// # Example
///
/// ```rust,ignore
/// let double = from_fn(|ctx| {
///     let n = ctx.input(0).and_then(Value::as_i64).unwrap_or(0);
///     Ok(vec![Output::set(n * 2)])
/// });
/// ```
pub fn from_fn<F>(f: F) -> FnCallback<F>
where
    F: Fn(&CallbackContext) -> CallbackResult + Send + Sync,
{
    FnCallback { f }
}

/// An async closure callback. See [`from_async`].
pub struct AsyncFnCallback<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Callback for AsyncFnCallback<F, Fut>
where
    F: Fn(CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    async fn call(&self, ctx: CallbackContext) -> CallbackResult {
        (self.f)(ctx).await
    }
}

/// Wrap a closure returning a future.
pub fn from_async<F, Fut>(f: F) -> AsyncFnCallback<F, Fut>
where
    F: Fn(CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    AsyncFnCallback {
        f,
        _future: PhantomData,
    }
}
