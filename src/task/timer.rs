//! The timer thread: deadline wakeups and deadline cancellations.
//!
//! One thread per processor sleeps on a binary heap of armed deadlines and
//! fires the due ones. Entries hold weak task references, so a finished and
//! dropped task simply evaporates from the heap when its entry comes due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::task::cancel::CancelReason;
use crate::task::context::{TaskContext, WakeupSource};
use crate::time::{refresh_coarse_now, Deadline};

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerKind {
    /// Resume the sleep that was current at `epoch`.
    Wakeup { epoch: u32 },
    /// Request cancellation with reason `deadline`.
    Cancel,
}

struct TimerEntry {
    deadline: Deadline,
    kind: TimerKind,
    context: Weak<TaskContext>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerInner {
    heap: BinaryHeap<TimerEntry>,
    shutdown: bool,
}

/// Heap plus condvar shared between the timer thread and the arming sites.
pub(crate) struct TimerShared {
    inner: Mutex<TimerInner>,
    cond: Condvar,
}

impl TimerShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Arms an entry. Unreachable deadlines are dropped here, not queued.
    pub(crate) fn arm(&self, context: &Arc<TaskContext>, deadline: Deadline, kind: TimerKind) {
        if !deadline.is_reachable() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.heap.push(TimerEntry {
            deadline,
            kind,
            context: Arc::downgrade(context),
        });
        drop(inner);
        self.cond.notify_one();
    }

    fn run(&self) {
        let mut fired: SmallVec<[(Arc<TaskContext>, TimerKind); 8]> = SmallVec::new();
        let mut inner = self.inner.lock();
        loop {
            refresh_coarse_now();
            loop {
                let due = inner
                    .heap
                    .peek()
                    .is_some_and(|entry| entry.deadline.is_reached());
                if !due {
                    break;
                }
                if let Some(entry) = inner.heap.pop() {
                    if let Some(context) = entry.context.upgrade() {
                        fired.push((context, entry.kind));
                    }
                }
            }
            if !fired.is_empty() {
                // Fire outside the lock: wakeups may take task-side locks.
                drop(inner);
                for (context, kind) in fired.drain(..) {
                    match kind {
                        TimerKind::Wakeup { epoch } => {
                            context.wakeup(WakeupSource::DeadlineTimer, epoch);
                        }
                        TimerKind::Cancel => context.request_cancel(CancelReason::Deadline),
                    }
                }
                inner = self.inner.lock();
                continue;
            }
            if inner.shutdown {
                return;
            }
            match inner.heap.peek().map(|entry| entry.deadline.time_left()) {
                Some(wait) => {
                    let _ = self.cond.wait_for(&mut inner, wait);
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    fn request_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        drop(inner);
        self.cond.notify_all();
    }
}

/// Owns the timer thread; started by the processor, stopped on its shutdown.
pub(crate) struct TimerDriver {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerDriver {
    pub(crate) fn start(shared: Arc<TimerShared>) -> Self {
        let for_thread = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("strand-timer".into())
            .spawn(move || for_thread.run())
            .ok();
        if thread.is_none() {
            tracing::warn!("failed to start the timer thread, deadlines will not fire");
        }
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Idempotent; joins the thread.
    pub(crate) fn shutdown(&self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
