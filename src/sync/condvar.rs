//! Coroutine-level condition variable.

use std::sync::Arc;

use crate::sync::mutex::MutexGuard;
use crate::sync::wait_list::WaitList;
use crate::task::cancel::CancellationBlocker;
use crate::task::context::{TaskContext, WakeupSource};
use crate::task::cx::TaskCx;
use crate::task::sleep::{sleep, EarlyWakeup, WaitStrategy};
use crate::time::Deadline;

/// How a condition variable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvStatus {
    /// Woken by a notify (possibly spurious with respect to the condition).
    Ok,
    /// The deadline arrived first.
    Timeout,
    /// The calling task was cancelled while waiting.
    Cancelled,
}

/// A condition variable paired with the task-level [`Mutex`](crate::Mutex).
///
/// Waiting atomically registers on the notify list and releases the lock, so
/// a notify issued after the lock was released is never lost. On wakeup the
/// lock is reacquired before control returns; cancellation is blocked during
/// the reacquire, so the guard always comes back valid.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: WaitList,
}

impl ConditionVariable {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one waiter, if any.
    pub fn notify_one(&self) {
        self.waiters.wake_one();
    }

    /// Wakes all current waiters.
    pub fn notify_all(&self) {
        self.waiters.wake_all();
    }

    /// Releases `guard`, parks until a notify, and reacquires.
    pub async fn wait<'a, T>(
        &self,
        cx: &TaskCx,
        guard: MutexGuard<'a, T>,
    ) -> (MutexGuard<'a, T>, CvStatus) {
        self.wait_with_deadline(cx, guard, Deadline::unreachable())
            .await
    }

    /// Deadline-bounded [`wait`](Self::wait).
    pub async fn wait_with_deadline<'a, T>(
        &self,
        cx: &TaskCx,
        guard: MutexGuard<'a, T>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T>, CvStatus) {
        let mutex = guard.mutex();
        let strategy = CvWaitStrategy {
            waiters: &self.waiters,
            guard: Some(guard),
        };
        let status = match sleep(cx.context(), strategy, deadline).await {
            WakeupSource::WaitList => CvStatus::Ok,
            WakeupSource::DeadlineTimer => CvStatus::Timeout,
            WakeupSource::CancelRequest => CvStatus::Cancelled,
        };

        let _blocker = CancellationBlocker::new(cx);
        let guard = match mutex.lock(cx).await {
            Ok(guard) => guard,
            Err(cancelled) => {
                unreachable!("cancellation is blocked during lock reacquire: {cancelled}")
            }
        };
        (guard, status)
    }

    /// Waits until `predicate` holds, reparking on spurious notifies.
    ///
    /// Returns [`CvStatus::Ok`] only with the predicate true. On
    /// [`CvStatus::Timeout`] the predicate got one final check under the
    /// reacquired lock and was still false.
    pub async fn wait_until<'a, T, P>(
        &self,
        cx: &TaskCx,
        mut guard: MutexGuard<'a, T>,
        deadline: Deadline,
        mut predicate: P,
    ) -> (MutexGuard<'a, T>, CvStatus)
    where
        P: FnMut(&mut T) -> bool,
    {
        loop {
            if predicate(&mut guard) {
                return (guard, CvStatus::Ok);
            }
            if deadline.is_reached() {
                return (guard, CvStatus::Timeout);
            }
            let (reacquired, status) = self.wait_with_deadline(cx, guard, deadline).await;
            guard = reacquired;
            if matches!(status, CvStatus::Cancelled) {
                return (guard, CvStatus::Cancelled);
            }
        }
    }
}

struct CvWaitStrategy<'a, 'g, T> {
    waiters: &'a WaitList,
    guard: Option<MutexGuard<'g, T>>,
}

impl<T> WaitStrategy for CvWaitStrategy<'_, '_, T> {
    fn setup_wakeups(&mut self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.waiters.append(Arc::clone(waiter), waiter.epoch());
        // Unlock only after registering: a notify between the unlock and the
        // park still finds us on the list.
        self.guard = None;
        EarlyWakeup::Parked
    }

    fn disable_wakeups(&mut self, waiter: &Arc<TaskContext>) {
        self.waiters.remove(waiter);
    }
}
