//! Per-task shared state: run state, sleep state, cancellation.
//!
//! The sleep state is the heart of the race-free parking protocol. It is one
//! packed atomic word holding wakeup flags in the low half and a wakeup epoch
//! in the high half. Every suspension bumps the epoch when it resolves, so a
//! wakeup carrying a stale epoch (a timer armed for an earlier sleep, say)
//! lands on a CAS failure instead of resuming the wrong sleep.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::sync::WaitList;
use crate::task::cancel::CancelReason;
use crate::task::counter::TaskCounter;
use crate::task::queue::TaskQueuePinned;
use crate::task::timer::TimerShared;

/// Process-unique task identifier, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// How the task body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishKind {
    Completed,
    Cancelled(CancelReason),
}

/// The erased task body, polled by workers.
pub(crate) type StoredTask = Pin<Box<dyn Future<Output = FinishKind> + Send + 'static>>;

/// Run state. Finished states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    New = 0,
    Queued = 1,
    Running = 2,
    Suspended = 3,
    Completed = 4,
    Cancelled = 5,
}

impl TaskState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Completed,
            5 => Self::Cancelled,
            _ => Self::New,
        }
    }

    pub(crate) const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// What resumed a parked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeupSource {
    WaitList,
    DeadlineTimer,
    CancelRequest,
}

impl WakeupSource {
    const fn flag(self) -> u32 {
        match self {
            Self::WaitList => flags::WAKEUP_BY_WAIT_LIST,
            Self::DeadlineTimer => flags::WAKEUP_BY_DEADLINE_TIMER,
            Self::CancelRequest => flags::WAKEUP_BY_CANCEL_REQUEST,
        }
    }
}

pub(crate) mod flags {
    //! Sleep-state flag bits (low half of the packed word).

    pub(crate) const SLEEPING: u32 = 1;
    pub(crate) const NON_CANCELLABLE: u32 = 2;
    pub(crate) const WAKEUP_BY_WAIT_LIST: u32 = 4;
    pub(crate) const WAKEUP_BY_DEADLINE_TIMER: u32 = 8;
    pub(crate) const WAKEUP_BY_CANCEL_REQUEST: u32 = 16;
}

#[allow(clippy::cast_lossless)]
const fn pack(flags: u32, epoch: u32) -> u64 {
    ((epoch as u64) << 32) | flags as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Decides whether a wakeup that just set its flag must also enqueue the task.
///
/// Exactly one concurrent wakeup observes the task still fully asleep and
/// wins the right to schedule; the rest only leave their flag for the
/// resolution step to report.
fn should_schedule(prev_flags: u32, source: WakeupSource) -> bool {
    if prev_flags & flags::SLEEPING == 0 {
        return false;
    }
    if matches!(source, WakeupSource::CancelRequest) {
        // A cancel wakeup only counts while the task is cancellable and no
        // other wakeup got there first.
        return prev_flags == flags::SLEEPING;
    }
    let mut rest = prev_flags;
    if rest & flags::NON_CANCELLABLE != 0 {
        // A blocked cancel flag does not count as a delivered wakeup.
        rest &= !(flags::NON_CANCELLABLE | flags::WAKEUP_BY_CANCEL_REQUEST);
    }
    rest == flags::SLEEPING
}

/// Reports the strongest wakeup out of a resolved sleep's flags.
pub(crate) fn primary_wakeup_source(sleep_flags: u32) -> WakeupSource {
    if sleep_flags & flags::WAKEUP_BY_WAIT_LIST != 0 {
        WakeupSource::WaitList
    } else if sleep_flags & flags::WAKEUP_BY_DEADLINE_TIMER != 0 {
        WakeupSource::DeadlineTimer
    } else if sleep_flags & flags::WAKEUP_BY_CANCEL_REQUEST != 0
        && sleep_flags & flags::NON_CANCELLABLE == 0
    {
        WakeupSource::CancelRequest
    } else {
        panic!("a parked task resumed without a delivered wakeup (flags {sleep_flags:#b})");
    }
}

/// Shard index sentinel for a task that has never been pushed.
pub(crate) const UNPINNED: usize = usize::MAX;

/// Shared per-task state. One `Arc<TaskContext>` is held by the ready queue
/// while queued, by at most one wait-list slot while parked, and by any number
/// of external handles.
pub(crate) struct TaskContext {
    id: TaskId,
    state: AtomicU8,
    /// Packed {flags, epoch}, see the module doc.
    sleep_state: AtomicU64,
    /// Zero = not requested; otherwise a `CancelReason` encoding. Set once.
    cancellation_reason: AtomicU8,
    cancellable: AtomicBool,
    /// Shard this task is pinned to, or [`UNPINNED`].
    pub(crate) pinned_shard: AtomicUsize,
    started: AtomicBool,
    queue: Arc<TaskQueuePinned>,
    pub(crate) timer: Arc<TimerShared>,
    pub(crate) counter: Arc<TaskCounter>,
    stored: Mutex<Option<StoredTask>>,
    /// Tasks suspended in `TaskHandle::wait` on this task.
    pub(crate) finish_waiters: WaitList,
    panic_message: Mutex<Option<String>>,
    finished_sync: Mutex<bool>,
    finished_cond: Condvar,
}

impl TaskContext {
    /// Creates a context with no body yet; the spawner stores the body via
    /// [`put_stored`](Self::put_stored) once the future capturing this
    /// context exists.
    pub(crate) fn new(
        queue: Arc<TaskQueuePinned>,
        timer: Arc<TimerShared>,
        counter: Arc<TaskCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::New as u8),
            sleep_state: AtomicU64::new(pack(0, 0)),
            cancellation_reason: AtomicU8::new(0),
            cancellable: AtomicBool::new(true),
            pinned_shard: AtomicUsize::new(UNPINNED),
            started: AtomicBool::new(false),
            queue,
            timer,
            counter,
            stored: Mutex::new(None),
            finish_waiters: WaitList::new(),
            panic_message: Mutex::new(None),
            finished_sync: Mutex::new(false),
            finished_cond: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Transitions to a non-terminal state; no-op once finished.
    pub(crate) fn set_state(&self, new: TaskState) {
        debug_assert!(!new.is_finished(), "terminal transitions go through try_finish");
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if TaskState::from_u8(cur).is_finished() {
                return;
            }
            match self.state.compare_exchange_weak(
                cur,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    tracing::trace!(task_id = %self.id, state = ?new, "state transition");
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Transitions into a terminal state; returns false if already finished.
    pub(crate) fn try_finish(&self, terminal: TaskState) -> bool {
        debug_assert!(terminal.is_finished());
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if TaskState::from_u8(cur).is_finished() {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                terminal as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    tracing::trace!(task_id = %self.id, state = ?terminal, "task finished");
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    // --- sleep state -----------------------------------------------------

    /// Current wakeup epoch.
    pub(crate) fn epoch(&self) -> u32 {
        unpack(self.sleep_state.load(Ordering::SeqCst)).1
    }

    /// ORs `add` into the sleep flags without touching the epoch; returns the
    /// previous flags. Used by the worker to publish the sleeping bits after a
    /// pending poll.
    pub(crate) fn suspend_flags(&self, add: u32) -> u32 {
        let prev = self.sleep_state.fetch_or(u64::from(add), Ordering::SeqCst);
        unpack(prev).0
    }

    /// Resolves the sleep for `epoch`: clears all flags, bumps the epoch, and
    /// returns the flags that had accumulated.
    pub(crate) fn resolve_sleep(&self, epoch: u32) -> u32 {
        let prev = self
            .sleep_state
            .swap(pack(0, epoch.wrapping_add(1)), Ordering::AcqRel);
        unpack(prev).0
    }

    /// Bumps the epoch after a sleep that resolved before ever parking, so a
    /// timer armed against the old epoch can no longer land.
    ///
    /// Wakeup flags that landed since the caller read `epoch` are carried into
    /// the new word instead of being cleared: an epochless waker delivery in
    /// that window must survive to resolve the next suspension. A carried flag
    /// is at worst a spurious wakeup, which every wait path absorbs.
    pub(crate) fn store_resolved_epoch(&self, epoch: u32) {
        let wakeups = flags::WAKEUP_BY_WAIT_LIST
            | flags::WAKEUP_BY_DEADLINE_TIMER
            | flags::WAKEUP_BY_CANCEL_REQUEST;
        let _ = self
            .sleep_state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                let (cur_flags, _) = unpack(cur);
                Some(pack(cur_flags & wakeups, epoch.wrapping_add(1)))
            });
    }

    /// Delivers a wakeup against a specific sleep epoch. A stale epoch, an
    /// already-set flag, or a gated cancel wakeup is silently dropped.
    pub(crate) fn wakeup(self: &Arc<Self>, source: WakeupSource, epoch: u32) {
        if self.is_finished() {
            return;
        }
        let flag = source.flag();
        let mut cur = self.sleep_state.load(Ordering::SeqCst);
        loop {
            let (cur_flags, cur_epoch) = unpack(cur);
            if cur_epoch != epoch || cur_flags & flag != 0 {
                return;
            }
            if matches!(source, WakeupSource::CancelRequest)
                && cur_flags & flags::NON_CANCELLABLE != 0
            {
                return;
            }
            match self.sleep_state.compare_exchange_weak(
                cur,
                pack(cur_flags | flag, cur_epoch),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if should_schedule(cur_flags, source) {
                        self.schedule();
                    }
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Delivers a wakeup against whatever sleep is current, if any.
    pub(crate) fn wakeup_no_epoch(self: &Arc<Self>, source: WakeupSource) {
        if self.is_finished() {
            return;
        }
        let prev = self
            .sleep_state
            .fetch_or(u64::from(source.flag()), Ordering::SeqCst);
        if should_schedule(unpack(prev).0, source) {
            self.schedule();
        }
    }

    /// Marks the *current* (not yet parked) sleep as already woken, so the
    /// next suspension resolves immediately. Used by yield.
    pub(crate) fn wakeup_current(&self) {
        self.sleep_state
            .fetch_or(u64::from(flags::WAKEUP_BY_WAIT_LIST), Ordering::SeqCst);
    }

    // --- cancellation ----------------------------------------------------

    /// Requests cancellation. The first reason wins; delivery is a wakeup
    /// observed at the task's next suspension or cancellation point.
    pub(crate) fn request_cancel(self: &Arc<Self>, reason: CancelReason) {
        if self
            .cancellation_reason
            .compare_exchange(0, reason.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::trace!(task_id = %self.id, %reason, "cancellation requested");
            let epoch = self.epoch();
            self.wakeup(WakeupSource::CancelRequest, epoch);
        }
    }

    /// Records a cancel reason without delivering a wakeup. Used when the
    /// scheduler itself decides the task's fate (shutdown spawn, panic path).
    pub(crate) fn note_cancel_reason(&self, reason: CancelReason) {
        let _ = self.cancellation_reason.compare_exchange(
            0,
            reason.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.cancellation_reason.load(Ordering::SeqCst))
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancellation_reason.load(Ordering::SeqCst) != 0
    }

    /// Whether the task must act on cancellation right now.
    pub(crate) fn should_cancel(&self) -> bool {
        self.cancel_requested() && self.is_cancellable()
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.cancellable.load(Ordering::SeqCst)
    }

    /// Sets the cancellable gate, returning the previous value.
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        self.cancellable.swap(value, Ordering::SeqCst)
    }

    // --- scheduling ------------------------------------------------------

    /// Puts the task on the ready queue.
    pub(crate) fn schedule(self: &Arc<Self>) {
        self.set_state(TaskState::Queued);
        self.queue.push(Arc::clone(self));
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn take_stored(&self) -> Option<StoredTask> {
        self.stored.lock().take()
    }

    pub(crate) fn put_stored(&self, task: StoredTask) {
        *self.stored.lock() = Some(task);
    }

    pub(crate) fn set_panic_message(&self, message: String) {
        *self.panic_message.lock() = Some(message);
    }

    pub(crate) fn panic_message(&self) -> Option<String> {
        self.panic_message.lock().clone()
    }

    // --- foreign-thread bridge -------------------------------------------

    /// Publishes the finished flag for threads blocked outside the scheduler.
    pub(crate) fn mark_finished_blocking(&self) {
        let mut finished = self.finished_sync.lock();
        *finished = true;
        self.finished_cond.notify_all();
    }

    /// Blocks the calling OS thread until the task finishes. Never call from
    /// a scheduler task.
    pub(crate) fn block_until_finished(&self) {
        let mut finished = self.finished_sync.lock();
        while !*finished {
            self.finished_cond.wait(&mut finished);
        }
    }

    /// A detached context over a one-shard queue, for unit tests of the
    /// primitives that need a current task but no running processor.
    #[cfg(test)]
    pub(crate) fn new_detached() -> Arc<Self> {
        Self::new(
            TaskQueuePinned::new(1),
            TimerShared::new(),
            Arc::new(TaskCounter::new()),
        )
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_rights_are_exclusive() {
        use WakeupSource::{CancelRequest, DeadlineTimer, WaitList};

        // Not sleeping: nobody schedules.
        assert!(!should_schedule(0, WaitList));
        assert!(!should_schedule(flags::WAKEUP_BY_WAIT_LIST, WaitList));

        // First wakeup on a clean sleep schedules.
        assert!(should_schedule(flags::SLEEPING, WaitList));
        assert!(should_schedule(flags::SLEEPING, DeadlineTimer));
        assert!(should_schedule(flags::SLEEPING, CancelRequest));

        // Second wakeup does not.
        assert!(!should_schedule(
            flags::SLEEPING | flags::WAKEUP_BY_WAIT_LIST,
            DeadlineTimer
        ));
        assert!(!should_schedule(
            flags::SLEEPING | flags::WAKEUP_BY_DEADLINE_TIMER,
            CancelRequest
        ));

        // A gated cancel flag does not count as a delivered wakeup.
        assert!(should_schedule(
            flags::SLEEPING | flags::NON_CANCELLABLE | flags::WAKEUP_BY_CANCEL_REQUEST,
            WaitList
        ));
        assert!(!should_schedule(
            flags::SLEEPING | flags::NON_CANCELLABLE,
            CancelRequest
        ));
    }

    #[test]
    fn stale_epoch_wakeup_is_dropped() {
        let ctx = TaskContext::new_detached();
        let epoch = ctx.epoch();
        ctx.suspend_flags(flags::SLEEPING);

        ctx.wakeup(WakeupSource::WaitList, epoch.wrapping_add(1));
        let resolved = ctx.resolve_sleep(epoch);
        assert_eq!(resolved & flags::WAKEUP_BY_WAIT_LIST, 0);

        // Wakeup against the old epoch after resolution is also dropped.
        ctx.wakeup(WakeupSource::DeadlineTimer, epoch);
        assert_eq!(ctx.epoch(), epoch.wrapping_add(1));
        let (sleep_flags, _) = unpack(ctx.sleep_state.load(Ordering::SeqCst));
        assert_eq!(sleep_flags, 0);
    }

    // An epochless waker delivery racing an early resolution must survive
    // into the new epoch; dropping it would leave the next park unwoken.
    #[test]
    fn early_resolution_carries_epochless_wakeups() {
        let ctx = TaskContext::new_detached();
        let epoch = ctx.epoch();

        ctx.wakeup_no_epoch(WakeupSource::WaitList);
        ctx.store_resolved_epoch(epoch);

        assert_eq!(ctx.epoch(), epoch.wrapping_add(1));
        let (sleep_flags, _) = unpack(ctx.sleep_state.load(Ordering::SeqCst));
        assert_ne!(sleep_flags & flags::WAKEUP_BY_WAIT_LIST, 0);

        // The carried flag resolves the next sleep immediately.
        let resolved = ctx.resolve_sleep(ctx.epoch());
        assert_ne!(resolved & flags::WAKEUP_BY_WAIT_LIST, 0);
    }

    #[test]
    fn first_cancel_reason_wins() {
        let ctx = TaskContext::new_detached();
        ctx.request_cancel(CancelReason::Deadline);
        ctx.request_cancel(CancelReason::UserRequest);
        assert_eq!(ctx.cancellation_reason(), Some(CancelReason::Deadline));
    }

    #[test]
    fn primary_source_prefers_wait_list() {
        let sleep_flags = flags::SLEEPING
            | flags::WAKEUP_BY_WAIT_LIST
            | flags::WAKEUP_BY_DEADLINE_TIMER
            | flags::WAKEUP_BY_CANCEL_REQUEST;
        assert_eq!(primary_wakeup_source(sleep_flags), WakeupSource::WaitList);
        assert_eq!(
            primary_wakeup_source(flags::SLEEPING | flags::WAKEUP_BY_DEADLINE_TIMER),
            WakeupSource::DeadlineTimer
        );
        assert_eq!(
            primary_wakeup_source(flags::SLEEPING | flags::WAKEUP_BY_CANCEL_REQUEST),
            WakeupSource::CancelRequest
        );
    }

    #[test]
    fn resolve_bumps_epoch_and_returns_flags() {
        let ctx = TaskContext::new_detached();
        let epoch = ctx.epoch();
        ctx.suspend_flags(flags::SLEEPING);
        ctx.wakeup(WakeupSource::WaitList, epoch);
        let resolved = ctx.resolve_sleep(epoch);
        assert_ne!(resolved & flags::WAKEUP_BY_WAIT_LIST, 0);
        assert_eq!(ctx.epoch(), epoch.wrapping_add(1));
    }
}
