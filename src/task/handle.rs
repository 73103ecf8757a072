//! External handle to a spawned task.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Cancelled, TaskError};
use crate::task::cancel::CancelReason;
use crate::task::context::{TaskContext, TaskId, WakeupSource};
use crate::task::cx::TaskCx;
use crate::task::sleep::{sleep, EarlyWakeup, WaitStrategy};
use crate::time::Deadline;

/// Holds the success value until the handle collects it.
pub(crate) struct ResultCell<T>(Mutex<Option<T>>);

impl<T> ResultCell<T> {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub(crate) fn put(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

/// Owner's handle to a spawned task.
///
/// Dropping the handle without [`detach`](Self::detach) requests cancellation
/// with reason `abandoned`: a task nobody can observe any more has no business
/// running to completion.
#[must_use = "dropping a task handle cancels the task; detach it to let it run"]
pub struct TaskHandle<T> {
    context: Arc<TaskContext>,
    result: Arc<ResultCell<T>>,
    detached: bool,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(context: Arc<TaskContext>, result: Arc<ResultCell<T>>) -> Self {
        Self {
            context,
            result,
            detached: false,
        }
    }

    /// The target task's identifier.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.context.id()
    }

    /// Whether the target task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Requests cancellation of the target task with reason `user request`.
    /// Returns immediately; the task observes it at its next cancellation
    /// point.
    pub fn request_cancel(&self) {
        self.context.request_cancel(CancelReason::UserRequest);
    }

    /// Lets the task run to completion unobserved.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Suspends the calling task until the target finishes. Errors if the
    /// *calling* task is cancelled while waiting.
    pub async fn wait(&self, cx: &TaskCx) -> Result<(), Cancelled> {
        self.wait_with_deadline(cx, Deadline::unreachable())
            .await
            .map(|_| ())
    }

    /// Deadline-bounded [`wait`](Self::wait); `Ok(false)` means the deadline
    /// arrived with the target still running.
    pub async fn wait_with_deadline(
        &self,
        cx: &TaskCx,
        deadline: Deadline,
    ) -> Result<bool, Cancelled> {
        assert!(
            !Arc::ptr_eq(&self.context, cx.context()),
            "task waiting on its own handle would deadlock"
        );
        loop {
            if self.context.is_finished() {
                return Ok(true);
            }
            let strategy = FinishWaitStrategy {
                target: &self.context,
            };
            match sleep(cx.context(), strategy, deadline).await {
                // Either the target finished or the wakeup was spurious;
                // the recheck at the top settles it.
                WakeupSource::WaitList => {}
                WakeupSource::DeadlineTimer => return Ok(self.context.is_finished()),
                WakeupSource::CancelRequest => return Err(cx.cancelled()),
            }
        }
    }

    /// Waits for the target and collects its result.
    ///
    /// Cancellation of the *calling* task surfaces as
    /// [`TaskError::WaitInterrupted`]; the target keeps running (and is then
    /// cancelled as abandoned when this consumed handle drops).
    pub async fn get(self, cx: &TaskCx) -> Result<T, TaskError> {
        match self.wait(cx).await {
            Ok(()) => self.take_result(),
            Err(cancelled) => Err(TaskError::WaitInterrupted(cancelled.reason)),
        }
    }

    /// Blocks the calling OS thread until the target finishes and collects
    /// its result. The bridge for threads outside the scheduler; never call
    /// from a task.
    pub fn get_blocking(self) -> Result<T, TaskError> {
        self.context.block_until_finished();
        self.take_result()
    }

    /// Collects the result if the target has already finished. The value is
    /// handed out at most once.
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        if self.context.is_finished() {
            Some(self.take_result())
        } else {
            None
        }
    }

    fn take_result(&self) -> Result<T, TaskError> {
        if let Some(value) = self.result.take() {
            return Ok(value);
        }
        if let Some(message) = self.context.panic_message() {
            return Err(TaskError::Panicked(message));
        }
        let reason = self
            .context
            .cancellation_reason()
            .unwrap_or(CancelReason::UserRequest);
        Err(TaskError::Cancelled(reason))
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.detached && !self.context.is_finished() {
            self.context.request_cancel(CancelReason::Abandoned);
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Registers the caller on the target's finish wait list.
struct FinishWaitStrategy<'a> {
    target: &'a Arc<TaskContext>,
}

impl WaitStrategy for FinishWaitStrategy<'_> {
    fn setup_wakeups(&mut self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.target
            .finish_waiters
            .append(Arc::clone(waiter), waiter.epoch());
        // Registered first: a finish landing in between drains the list and
        // flips the state, so the recheck below cannot miss it.
        if self.target.is_finished() {
            self.target.finish_waiters.remove(waiter);
            EarlyWakeup::Ready
        } else {
            EarlyWakeup::Parked
        }
    }

    fn disable_wakeups(&mut self, waiter: &Arc<TaskContext>) {
        self.target.finish_waiters.remove(waiter);
    }
}
