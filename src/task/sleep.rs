//! The suspension point: a future that parks the current task.
//!
//! Every blocking primitive suspends through [`Sleep`], parameterized by a
//! [`WaitStrategy`] that knows how to register for (and deregister from) the
//! primitive's wakeups. The future reports which wakeup resumed the task;
//! the caller decides whether that means success, retry, timeout, or
//! cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::task::context::{TaskContext, WakeupSource};
use crate::task::context::primary_wakeup_source;
use crate::task::timer::TimerKind;
use crate::time::Deadline;

/// Outcome of registering with a primitive before parking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EarlyWakeup {
    /// The awaited condition already holds; do not park.
    Ready,
    /// Registered; park until a wakeup.
    Parked,
}

/// Hooks a primitive into the parking protocol.
pub(crate) trait WaitStrategy {
    /// Registers the task for wakeups. Runs before the task is marked
    /// sleeping; returning [`EarlyWakeup::Ready`] skips the park entirely.
    fn setup_wakeups(&mut self, waiter: &Arc<TaskContext>) -> EarlyWakeup;

    /// Deregisters after the park resolves, before the wakeup source is
    /// reported. Must tolerate the registration already being consumed.
    fn disable_wakeups(&mut self, waiter: &Arc<TaskContext>);
}

/// Strategy for sleeps with no primitive to register with (yield, timed
/// sleep); only the timer or a cancel request can end them.
pub(crate) struct NoopWaitStrategy;

impl WaitStrategy for NoopWaitStrategy {
    fn setup_wakeups(&mut self, _waiter: &Arc<TaskContext>) -> EarlyWakeup {
        EarlyWakeup::Parked
    }

    fn disable_wakeups(&mut self, _waiter: &Arc<TaskContext>) {}
}

enum Phase {
    Init,
    Parked { epoch: u32 },
    Done,
}

/// One suspension of the current task, bounded by `deadline`.
pub(crate) struct Sleep<'a, S> {
    context: &'a Arc<TaskContext>,
    strategy: S,
    deadline: Deadline,
    phase: Phase,
}

pub(crate) fn sleep<S: WaitStrategy + Unpin>(
    context: &Arc<TaskContext>,
    strategy: S,
    deadline: Deadline,
) -> Sleep<'_, S> {
    Sleep {
        context,
        strategy,
        deadline,
        phase: Phase::Init,
    }
}

impl<S: WaitStrategy + Unpin> Future for Sleep<'_, S> {
    type Output = WakeupSource;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.phase {
            Phase::Init => {
                if this.context.should_cancel() {
                    this.phase = Phase::Done;
                    return Poll::Ready(WakeupSource::CancelRequest);
                }
                if this.deadline.is_reached() {
                    this.phase = Phase::Done;
                    return Poll::Ready(WakeupSource::DeadlineTimer);
                }
                let epoch = this.context.epoch();
                if matches!(
                    this.strategy.setup_wakeups(this.context),
                    EarlyWakeup::Ready
                ) {
                    // Never parked; still bump the epoch so a wakeup armed
                    // against this sleep cannot land on the next one.
                    this.context.store_resolved_epoch(epoch);
                    this.phase = Phase::Done;
                    return Poll::Ready(WakeupSource::WaitList);
                }
                if this.deadline.is_reachable() {
                    this.context.timer.arm(
                        this.context,
                        this.deadline,
                        TimerKind::Wakeup { epoch },
                    );
                }
                this.phase = Phase::Parked { epoch };
                Poll::Pending
            }
            Phase::Parked { epoch } => {
                this.strategy.disable_wakeups(this.context);
                let sleep_flags = this.context.resolve_sleep(epoch);
                this.phase = Phase::Done;
                Poll::Ready(primary_wakeup_source(sleep_flags))
            }
            Phase::Done => panic!("sleep polled after completion"),
        }
    }
}
