//! Coroutine-level mutual exclusion.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Cancelled;
use crate::task::context::{TaskContext, WakeupSource};
use crate::task::cx::TaskCx;
use crate::task::sleep::{sleep, EarlyWakeup, WaitStrategy};
use crate::sync::wait_list::WaitList;
use crate::time::Deadline;

/// A mutex whose contended path suspends the task instead of the OS thread.
///
/// The fast path is a single atomic test-and-set. Losers register on a wait
/// list and park; unlock clears the flag and wakes one waiter. A wakeup never
/// implies the lock was handed over, only that another attempt is worthwhile,
/// so lock acquisition is a retry loop that absorbs spurious wakeups.
///
/// The guard is held across suspension points; do not hold it while calling
/// code that may block for long.
pub struct Mutex<T> {
    locked: AtomicBool,
    waiters: WaitList,
    data: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex owning `value`.
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: WaitList::new(),
            data: parking_lot::Mutex::new(value),
        }
    }

    /// Acquires without suspending, if free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(MutexGuard {
                mutex: self,
                inner: Some(self.data.lock()),
            })
        } else {
            None
        }
    }

    /// Acquires, suspending while contended. Errors only on cancellation of
    /// the calling task.
    pub async fn lock(&self, cx: &TaskCx) -> Result<MutexGuard<'_, T>, Cancelled> {
        loop {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            self.park_for_unlock(cx, Deadline::unreachable()).await?;
        }
    }

    /// Deadline-bounded [`lock`](Self::lock); `Ok(None)` when the deadline
    /// arrives first.
    pub async fn lock_with_deadline(
        &self,
        cx: &TaskCx,
        deadline: Deadline,
    ) -> Result<Option<MutexGuard<'_, T>>, Cancelled> {
        loop {
            if let Some(guard) = self.try_lock() {
                return Ok(Some(guard));
            }
            if !self.park_for_unlock(cx, deadline).await? {
                // One last chance after the deadline fired.
                return Ok(self.try_lock());
            }
        }
    }

    /// Whether the mutex is currently held. Racy; diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Parks until an unlock wakeup or the deadline; `Ok(false)` on deadline.
    async fn park_for_unlock(&self, cx: &TaskCx, deadline: Deadline) -> Result<bool, Cancelled> {
        let strategy = LockWaitStrategy {
            locked: &self.locked,
            waiters: &self.waiters,
        };
        match sleep(cx.context(), strategy, deadline).await {
            WakeupSource::WaitList => Ok(true),
            WakeupSource::DeadlineTimer => Ok(false),
            WakeupSource::CancelRequest => Err(cx.cancelled()),
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        self.waiters.wake_one();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

struct LockWaitStrategy<'a> {
    locked: &'a AtomicBool,
    waiters: &'a WaitList,
}

impl WaitStrategy for LockWaitStrategy<'_> {
    fn setup_wakeups(&mut self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.waiters.append(Arc::clone(waiter), waiter.epoch());
        // Registration before the recheck: an unlock that lands in between
        // will find us on the list.
        if self.locked.load(Ordering::SeqCst) {
            EarlyWakeup::Parked
        } else {
            self.waiters.remove(waiter);
            EarlyWakeup::Ready
        }
    }

    fn disable_wakeups(&mut self, waiter: &Arc<TaskContext>) {
        self.waiters.remove(waiter);
    }
}

/// Exclusive access to the data of a locked [`Mutex`].
#[must_use = "the mutex unlocks when the guard is dropped"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    inner: Option<parking_lot::MutexGuard<'a, T>>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_deref().expect("guard accessed after release")
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
            .as_deref_mut()
            .expect("guard accessed after release")
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data before clearing the lock flag, so the next owner
        // never blocks on the inner lock.
        self.inner = None;
        self.mutex.unlock();
    }
}
