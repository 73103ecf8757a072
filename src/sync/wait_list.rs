//! General multi-waiter wait list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::Cancelled;
use crate::task::context::{TaskContext, WakeupSource};
use crate::task::cx::TaskCx;
use crate::task::sleep::{sleep, EarlyWakeup, WaitStrategy};
use crate::time::Deadline;

struct Waiter {
    context: Arc<TaskContext>,
    epoch: u32,
}

/// FIFO list of parked tasks.
///
/// A notify wakes at least one waiter (all of them for [`wake_all`]); there is
/// no fairness guarantee among waiters, and a woken task must recheck the
/// condition it waited for. Waiters deregister themselves on timeout or
/// cancellation, so the list never holds a task that has moved on.
///
/// A notify is never lost to a departing waiter: a waiter whose registration
/// was consumed by [`wake_one`](Self::wake_one) waits in
/// [`remove`](Self::remove) for that delivery to land, so the wakeup flag is
/// set before the waiter resolves its sleep and the resolution reports the
/// wakeup instead of dropping it.
///
/// [`wake_all`]: WaitList::wake_all
#[derive(Default)]
pub struct WaitList {
    waiters: Mutex<VecDeque<Waiter>>,
    /// Wakeups popped from the list but not yet delivered to their task.
    wakeup_in_flight: AtomicUsize,
}

impl WaitList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, context: Arc<TaskContext>, epoch: u32) {
        self.waiters.lock().push_back(Waiter { context, epoch });
    }

    /// Removes the given task if still present. Returns true if the waiter
    /// reclaimed its own registration; false means a concurrent wakeup popped
    /// it, in which case this spins until every in-flight delivery has landed.
    pub(crate) fn remove(&self, context: &Arc<TaskContext>) -> bool {
        {
            let mut waiters = self.waiters.lock();
            let before = waiters.len();
            waiters.retain(|waiter| !Arc::ptr_eq(&waiter.context, context));
            if waiters.len() < before {
                return true;
            }
        }
        while self.wakeup_in_flight.load(Ordering::SeqCst) > 0 {
            std::hint::spin_loop();
        }
        false
    }

    /// Wakes the longest-parked waiter, if any.
    pub fn wake_one(&self) {
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters.pop_front().map(|waiter| {
                // Counted under the lock so `remove` can tell "absent because
                // never appended" from "absent because a wakeup is in flight".
                self.wakeup_in_flight.fetch_add(1, Ordering::SeqCst);
                waiter
            })
        };
        if let Some(waiter) = waiter {
            waiter.context.wakeup(WakeupSource::WaitList, waiter.epoch);
            self.wakeup_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wakes every current waiter.
    pub fn wake_all(&self) {
        let drained: SmallVec<[Waiter; 8]> = {
            let mut waiters = self.waiters.lock();
            self.wakeup_in_flight
                .fetch_add(waiters.len(), Ordering::SeqCst);
            waiters.drain(..).collect()
        };
        for waiter in drained {
            waiter.context.wakeup(WakeupSource::WaitList, waiter.epoch);
            self.wakeup_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Whether no task is currently registered. Racy; diagnostics only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Parks the current task until woken, the deadline, or cancellation.
    ///
    /// `Ok(true)` on wakeup, `Ok(false)` on deadline expiry. The wakeup may be
    /// spurious with respect to whatever condition the caller guards; recheck
    /// it.
    pub async fn wait(&self, cx: &TaskCx, deadline: Deadline) -> Result<bool, Cancelled> {
        let strategy = ListWaitStrategy { list: self };
        match sleep(cx.context(), strategy, deadline).await {
            WakeupSource::WaitList => Ok(true),
            WakeupSource::DeadlineTimer => Ok(false),
            WakeupSource::CancelRequest => Err(cx.cancelled()),
        }
    }
}

struct ListWaitStrategy<'a> {
    list: &'a WaitList,
}

impl WaitStrategy for ListWaitStrategy<'_> {
    fn setup_wakeups(&mut self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.list.append(Arc::clone(waiter), waiter.epoch());
        EarlyWakeup::Parked
    }

    fn disable_wakeups(&mut self, waiter: &Arc<TaskContext>) {
        self.list.remove(waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::context::flags;

    #[test]
    fn wake_one_is_fifo_and_epoch_checked() {
        let list = WaitList::new();
        let first = TaskContext::new_detached();
        let second = TaskContext::new_detached();

        first.suspend_flags(flags::SLEEPING);
        second.suspend_flags(flags::SLEEPING);
        list.append(Arc::clone(&first), first.epoch());
        list.append(Arc::clone(&second), second.epoch());

        list.wake_one();
        assert_ne!(first.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST, 0);
        assert_eq!(second.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST, 0);

        list.wake_all();
        assert_ne!(second.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST, 0);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_deregisters_only_that_task() {
        let list = WaitList::new();
        let staying = TaskContext::new_detached();
        let leaving = TaskContext::new_detached();
        staying.suspend_flags(flags::SLEEPING);
        list.append(Arc::clone(&staying), staying.epoch());
        list.append(Arc::clone(&leaving), leaving.epoch());

        assert!(list.remove(&leaving));
        list.wake_one();
        assert_ne!(staying.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST, 0);
        assert!(list.is_empty());
    }

    // A waiter that gives up (as a timeout or cancellation does) while a
    // wake_one is consuming its registration must not swallow the delivery:
    // either the wakeup goes to the next waiter, or it lands on the departing
    // task before its sleep resolves, so the resolution reports it.
    #[test]
    fn departing_waiter_cannot_swallow_a_delivery() {
        for _ in 0..500 {
            let list = Arc::new(WaitList::new());
            let leaving = TaskContext::new_detached();
            let staying = TaskContext::new_detached();
            leaving.suspend_flags(flags::SLEEPING);
            staying.suspend_flags(flags::SLEEPING);
            let epoch = leaving.epoch();
            list.append(Arc::clone(&leaving), epoch);
            list.append(Arc::clone(&staying), staying.epoch());

            let waker = {
                let list = Arc::clone(&list);
                std::thread::spawn(move || list.wake_one())
            };
            let reclaimed = list.remove(&leaving);
            let resolved = leaving.resolve_sleep(epoch);
            waker.join().unwrap();

            if reclaimed {
                assert_ne!(
                    staying.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST,
                    0,
                    "the wakeup must have gone to the remaining waiter"
                );
            } else {
                assert_ne!(
                    resolved & flags::WAKEUP_BY_WAIT_LIST,
                    0,
                    "a consumed delivery must land before the sleep resolves"
                );
            }
            list.wake_all();
        }
    }
}
