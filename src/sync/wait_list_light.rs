//! Single-waiter handoff slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Cancelled;
use crate::task::context::{TaskContext, WakeupSource};
use crate::task::cx::TaskCx;
use crate::task::sleep::{sleep, EarlyWakeup, WaitStrategy};
use crate::time::Deadline;

struct Slot {
    context: Arc<TaskContext>,
    epoch: u32,
}

/// A wait list specialized for at most one waiter.
///
/// Cheaper than [`WaitList`](crate::WaitList) where the protocol guarantees a
/// single parked task per slot. Exactly-once handoff: every registration is
/// resolved by exactly one of {wakeup delivered, waiter reclaimed it}, even
/// when [`wakeup_one`](Self::wakeup_one) races the waiter's timeout or
/// cancellation.
///
/// Registering while the slot is occupied is a contract violation and panics.
#[derive(Default)]
pub struct WaitListLight {
    slot: Mutex<Option<Slot>>,
    /// Wakeups that have taken the slot but not yet resumed the task.
    wakeup_in_flight: AtomicUsize,
}

impl WaitListLight {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, context: Arc<TaskContext>, epoch: u32) {
        let mut slot = self.slot.lock();
        assert!(
            slot.is_none(),
            "second waiter registered on a single-waiter slot"
        );
        *slot = Some(Slot { context, epoch });
    }

    /// Resumes the parked task, if any. No-op on an empty slot.
    pub fn wakeup_one(&self) {
        let taken = {
            let mut slot = self.slot.lock();
            slot.take().map(|waiter| {
                // Counted under the lock so `remove` can tell "empty because
                // never appended" from "empty because a wakeup is in flight".
                self.wakeup_in_flight.fetch_add(1, Ordering::SeqCst);
                waiter
            })
        };
        if let Some(waiter) = taken {
            waiter.context.wakeup(WakeupSource::WaitList, waiter.epoch);
            self.wakeup_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Reclaims the registration for `context`. Returns true if the waiter
    /// took its own slot back; false means a concurrent wakeup consumed it,
    /// in which case this spins until that wakeup has fully landed.
    pub(crate) fn remove(&self, context: &Arc<TaskContext>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot
                .as_ref()
                .is_some_and(|waiter| Arc::ptr_eq(&waiter.context, context))
            {
                *slot = None;
                return true;
            }
        }
        while self.wakeup_in_flight.load(Ordering::SeqCst) > 0 {
            std::hint::spin_loop();
        }
        false
    }

    /// Whether the slot is vacant. Racy; diagnostics only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Parks the current task in the slot until woken, the deadline, or
    /// cancellation. `Ok(true)` on wakeup, `Ok(false)` on deadline expiry.
    pub async fn wait(&self, cx: &TaskCx, deadline: Deadline) -> Result<bool, Cancelled> {
        let strategy = LightWaitStrategy { list: self };
        match sleep(cx.context(), strategy, deadline).await {
            WakeupSource::WaitList => Ok(true),
            WakeupSource::DeadlineTimer => Ok(false),
            WakeupSource::CancelRequest => Err(cx.cancelled()),
        }
    }
}

impl Drop for WaitListLight {
    fn drop(&mut self) {
        // Skipped during unwind: a panicking owner (the double-append assert
        // included) would otherwise turn into a process abort.
        if !std::thread::panicking() {
            debug_assert!(
                self.slot.get_mut().is_none(),
                "wait slot destroyed with a task still parked"
            );
        }
    }
}

struct LightWaitStrategy<'a> {
    list: &'a WaitListLight,
}

impl WaitStrategy for LightWaitStrategy<'_> {
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
    fn wakeup_one_on_empty_slot_is_noop() {
        let list = WaitListLight::new();
        list.wakeup_one();
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "second waiter")]
    fn double_append_panics() {
        let list = WaitListLight::new();
        let ctx = TaskContext::new_detached();
        list.append(Arc::clone(&ctx), ctx.epoch());
        list.append(Arc::clone(&ctx), ctx.epoch());
    }

    #[test]
    fn remove_reports_who_resolved_the_handoff() {
        let list = WaitListLight::new();
        let ctx = TaskContext::new_detached();

        list.append(Arc::clone(&ctx), ctx.epoch());
        assert!(list.remove(&ctx));

        list.append(Arc::clone(&ctx), ctx.epoch());
        list.wakeup_one();
        assert!(!list.remove(&ctx));
        assert!(list.is_empty());
    }

    // Exactly-once handoff under a wakeup/remove race.
    #[test]
    fn handoff_race_resolves_exactly_once() {
        for _ in 0..500 {
            let list = Arc::new(WaitListLight::new());
            let ctx = TaskContext::new_detached();
            ctx.suspend_flags(flags::SLEEPING);
            list.append(Arc::clone(&ctx), ctx.epoch());

            let waker = {
                let list = Arc::clone(&list);
                std::thread::spawn(move || list.wakeup_one())
            };
            let reclaimed = list.remove(&ctx);
            waker.join().unwrap();

            let delivered = ctx.suspend_flags(0) & flags::WAKEUP_BY_WAIT_LIST != 0;
            assert_ne!(
                reclaimed, delivered,
                "handoff must resolve to exactly one of wakeup or reclaim"
            );
            assert!(list.is_empty());
        }
    }
}
