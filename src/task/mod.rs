//! Tasks: contexts, cancellation, the ready queue and the worker pool.
//!
//! A logical task is a future paired with a [`TaskContext`](context) holding
//! its run state, sleep state and cancellation state. Workers pop ready tasks
//! off a sharded queue and poll them; a pending poll parks the task until a
//! wakeup requeues it on the shard it was pinned to at first push.

pub(crate) mod cancel;
pub(crate) mod context;
mod counter;
pub(crate) mod cx;
mod handle;
mod processor;
pub(crate) mod queue;
pub(crate) mod sleep;
mod timer;

pub use cancel::{CancelReason, CancellationBlocker};
pub use context::TaskId;
pub use cx::TaskCx;
pub use handle::TaskHandle;
pub use processor::{TaskProcessor, TaskProcessorConfig};

use std::future::Future;

use crate::error::Cancelled;
use crate::time::Deadline;

/// Spawns a task on `processor`. See [`TaskProcessor::spawn`].
pub fn spawn<F, Fut, T>(processor: &TaskProcessor, f: F) -> TaskHandle<T>
where
    F: FnOnce(TaskCx) -> Fut,
    Fut: Future<Output = Result<T, Cancelled>> + Send + 'static,
    T: Send + 'static,
{
    processor.spawn(f)
}

/// Spawns a deadline-bounded task on `processor`. See
/// [`TaskProcessor::spawn_with_deadline`].
pub fn spawn_with_deadline<F, Fut, T>(
    processor: &TaskProcessor,
    deadline: Deadline,
    f: F,
) -> TaskHandle<T>
where
    F: FnOnce(TaskCx) -> Fut,
    Fut: Future<Output = Result<T, Cancelled>> + Send + 'static,
    T: Send + 'static,
{
    processor.spawn_with_deadline(deadline, f)
}
