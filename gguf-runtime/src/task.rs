//! One-shot background operations with a deferred result.
//!
//! An [`AsyncTask`] splits an operation in two halves:
//!
//! - [`AsyncTask::execute`] runs on a blocking worker thread and performs the
//!   native call. Panics are caught and turned into [`ModelError::TaskFailed`].
//! - [`AsyncTask::complete`] runs as an async task on the runtime and
//!   receives the outcome. State changes visible to callers, such as resource
//!   accounting, happen only here.
//!
//! The task value owns every strong reference the operation needs, so those
//! references are released exactly once, when the task is dropped after
//! completion (or when the runtime discards it).

use crate::error::{ModelError, Result};
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

pub trait AsyncTask: Send + 'static {
    /// Value produced on the worker thread
    type Output: Send + 'static;
    /// Value the pending result resolves to
    type Resolved: Send + 'static;

    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Worker-thread half; may block
    fn execute(&mut self) -> Result<Self::Output>;

    /// Runtime half; receives the worker outcome, including caught panics
    fn complete(self, outcome: Result<Self::Output>) -> BoxFuture<'static, Result<Self::Resolved>>;
}

/// Deferred result of a background operation
#[must_use = "a pending result does nothing unless awaited"]
pub struct PendingResult<T> {
    inner: Pending<T>,
}

enum Pending<T> {
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Result<T>>),
    Boxed(BoxFuture<'static, Result<T>>),
}

impl<T> PendingResult<T> {
    pub fn ready(value: T) -> Self {
        Self {
            inner: Pending::Ready(Some(Ok(value))),
        }
    }

    pub fn failed(error: ModelError) -> Self {
        Self {
            inner: Pending::Ready(Some(Err(error))),
        }
    }

    pub(crate) fn from_future(future: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self {
            inner: Pending::Boxed(Box::pin(future)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: Pending::Waiting(receiver),
        }
    }
}

// The resolved value is only ever moved, never pinned
impl<T> Unpin for PendingResult<T> {}

impl<T> Future for PendingResult<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Pending::Ready(value) => Poll::Ready(value.take().unwrap_or(Err(ModelError::TaskCancelled))),
            Pending::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(ModelError::TaskCancelled))),
            Pending::Boxed(future) => future.as_mut().poll(cx),
        }
    }
}

/// Schedule `task` on the current runtime
///
/// Fails with [`ModelError::NoRuntime`] when called outside a Tokio runtime.
pub fn queue<T: AsyncTask>(task: T) -> Result<PendingResult<T::Resolved>> {
    let runtime = Handle::try_current().map_err(|_| ModelError::NoRuntime)?;
    let (sender, receiver) = oneshot::channel();
    let worker = runtime.clone();

    runtime.spawn(async move {
        let name = task.name();
        log::debug!("Queued {} task", name);

        let joined = worker
            .spawn_blocking(move || {
                let mut task = task;
                let outcome = catch_unwind(AssertUnwindSafe(|| task.execute()))
                    .unwrap_or_else(|panic| Err(ModelError::TaskFailed(panic_message(panic))));
                (task, outcome)
            })
            .await;

        let result = match joined {
            Ok((task, outcome)) => {
                if let Err(e) = &outcome {
                    log::debug!("{} task failed on worker: {}", name, e);
                }
                task.complete(outcome).await
            }
            Err(e) => {
                log::warn!("{} task was dropped by the runtime: {}", name, e);
                Err(ModelError::TaskCancelled)
            }
        };

        // The caller may have stopped waiting
        let _ = sender.send(result);
    });

    Ok(PendingResult::waiting(receiver))
}

/// Text of a caught panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
