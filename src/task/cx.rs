//! The current-task handle passed to every task body.

use std::sync::Arc;

use crate::error::Cancelled;
use crate::task::cancel::CancelReason;
use crate::task::context::{TaskContext, TaskId, WakeupSource};
use crate::task::sleep::{sleep, NoopWaitStrategy};
use crate::time::Deadline;

/// Handle to the task it was created for.
///
/// The task body receives its `TaskCx` from the spawner; every operation that
/// can suspend or observe cancellation takes it explicitly. Cloning is cheap
/// and gives out another handle to the *same* task; a `TaskCx` must not be
/// used from a different task.
#[derive(Clone)]
pub struct TaskCx {
    context: Arc<TaskContext>,
}

impl TaskCx {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        Self { context }
    }

    pub(crate) fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    /// This task's identifier, for diagnostics.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.context.id()
    }

    /// Whether cancellation has been requested and is currently deliverable.
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        self.context.should_cancel()
    }

    /// The requested cancellation reason, delivered or not.
    #[must_use]
    pub fn cancellation_reason(&self) -> Option<CancelReason> {
        self.context.cancellation_reason()
    }

    /// An explicit cancellation point: errors if cancellation is deliverable.
    ///
    /// Code between two cancellation points runs atomically with respect to
    /// cancellation.
    pub fn cancellation_point(&self) -> Result<(), Cancelled> {
        if self.should_cancel() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    /// The error value for this task's cancellation.
    pub(crate) fn cancelled(&self) -> Cancelled {
        Cancelled {
            reason: self
                .context
                .cancellation_reason()
                .unwrap_or(CancelReason::UserRequest),
        }
    }

    /// Reschedules this task to the back of its shard, letting queued tasks
    /// run first. A cancellation point.
    pub async fn yield_now(&self) -> Result<(), Cancelled> {
        self.cancellation_point()?;
        // Pre-arm the wakeup: the suspension resolves immediately after the
        // worker requeues us.
        self.context.wakeup_current();
        match sleep(&self.context, NoopWaitStrategy, Deadline::unreachable()).await {
            WakeupSource::CancelRequest => Err(self.cancelled()),
            WakeupSource::WaitList | WakeupSource::DeadlineTimer => Ok(()),
        }
    }

    /// Suspends this task until `deadline`. A cancellation point.
    pub async fn sleep_until(&self, deadline: Deadline) -> Result<(), Cancelled> {
        loop {
            if deadline.is_reached() {
                return Ok(());
            }
            match sleep(&self.context, NoopWaitStrategy, deadline).await {
                WakeupSource::DeadlineTimer => return Ok(()),
                WakeupSource::CancelRequest => return Err(self.cancelled()),
                // Spurious wakeup; park again for the remaining time.
                WakeupSource::WaitList => {}
            }
        }
    }

    /// Suspends this task for `duration`. A cancellation point.
    pub async fn sleep_for(&self, duration: std::time::Duration) -> Result<(), Cancelled> {
        self.sleep_until(Deadline::from_duration(duration)).await
    }

    /// A context over a detached task, for unit tests of the primitives.
    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        Self::new(TaskContext::new_detached())
    }
}

impl std::fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCx")
            .field("task_id", &self.task_id())
            .finish()
    }
}
