//! Delayed-task scheduling
//!
//! Retry waits and bundle delay flushes are one-shot tasks handed to a
//! [`Scheduler`]. Nothing in the crate sleeps on a worker thread; a delayed
//! task simply re-enters the engine when its timer fires.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Handle to a scheduled task; cancelling a task that already ran is a no-op.
pub struct ScheduledTask {
    abort: Option<AbortHandle>,
}

impl ScheduledTask {
    /// A handle that controls nothing, for schedulers that cannot cancel.
    pub fn detached() -> Self {
        Self { abort: None }
    }

    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("cancellable", &self.abort.is_some())
            .finish()
    }
}

/// Something that can run a task after a delay.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask;

    /// Runs `task` as soon as possible.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> ScheduledTask {
        self.schedule(Duration::ZERO, task)
    }

    /// The Tokio runtime this scheduler runs tasks on, if it has one.
    fn runtime(&self) -> Option<Handle> {
        None
    }
}

/// Scheduler backed by a Tokio runtime's timer and task pool.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let join = if delay.is_zero() {
            self.handle.spawn(task)
        } else {
            self.handle.spawn(async move {
                tokio::time::sleep(delay).await;
                task.await;
            })
        };
        ScheduledTask {
            abort: Some(join.abort_handle()),
        }
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let join = self.handle.spawn(task);
        ScheduledTask {
            abort: Some(join.abort_handle()),
        }
    }

    fn runtime(&self) -> Option<Handle> {
        Some(self.handle.clone())
    }
}
