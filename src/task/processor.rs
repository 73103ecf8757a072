//! The worker pool: spawning, polling, shutdown.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use parking_lot::Mutex;

use crate::error::Cancelled;
use crate::task::cancel::CancelReason;
use crate::task::context::{
    flags, FinishKind, TaskContext, TaskState, WakeupSource,
};
use crate::task::counter::TaskCounter;
use crate::task::cx::TaskCx;
use crate::task::handle::{ResultCell, TaskHandle};
use crate::task::queue::TaskQueuePinned;
use crate::task::timer::{TimerDriver, TimerKind, TimerShared};
use crate::time::{refresh_coarse_now, Deadline};

/// Worker pool configuration; a move-based builder.
///
/// ```
/// use strand::TaskProcessorConfig;
///
/// let config = TaskProcessorConfig::new()
///     .worker_threads(4)
///     .thread_name("engine");
/// ```
#[derive(Debug, Clone)]
pub struct TaskProcessorConfig {
    worker_threads: usize,
    thread_name: String,
}

impl TaskProcessorConfig {
    /// Defaults: one worker per available CPU, threads named `strand-worker`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            thread_name: "strand-worker".into(),
        }
    }

    /// Sets the worker count; clamped to at least one.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Sets the worker thread name prefix; threads are named `{prefix}-{i}`.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed pool of worker threads running logical tasks off a sharded ready
/// queue, plus one timer thread arming deadlines.
///
/// Shutdown never cancels by itself: it refuses new spawns (cancelling them
/// with reason `shutdown`), waits for the alive tasks to drain, then closes
/// the queue and joins the threads. Dropping the processor runs shutdown.
pub struct TaskProcessor {
    queue: Arc<TaskQueuePinned>,
    timer_shared: Arc<TimerShared>,
    timer: TimerDriver,
    counter: Arc<TaskCounter>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl TaskProcessor {
    /// Starts the worker and timer threads.
    #[must_use]
    pub fn new(config: TaskProcessorConfig) -> Self {
        let queue = TaskQueuePinned::new(config.worker_threads);
        let timer_shared = TimerShared::new();
        let timer = TimerDriver::start(Arc::clone(&timer_shared));

        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let queue = Arc::clone(&queue);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker_loop(&queue, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    tracing::warn!(index, %error, "failed to start a worker thread");
                }
            }
        }
        tracing::debug!(workers = workers.len(), "task processor started");

        Self {
            queue,
            timer_shared,
            timer,
            counter: Arc::new(TaskCounter::new()),
            workers: Mutex::new(workers),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Spawns a task. The body receives its [`TaskCx`] and returns
    /// `Err(Cancelled)` when it observes cancellation.
    pub fn spawn<F, Fut, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce(TaskCx) -> Fut,
        Fut: Future<Output = Result<T, Cancelled>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with_deadline(Deadline::unreachable(), f)
    }

    /// Spawns a task that is cancelled with reason `deadline` if still
    /// running when `deadline` arrives.
    pub fn spawn_with_deadline<F, Fut, T>(&self, deadline: Deadline, f: F) -> TaskHandle<T>
    where
        F: FnOnce(TaskCx) -> Fut,
        Fut: Future<Output = Result<T, Cancelled>> + Send + 'static,
        T: Send + 'static,
    {
        let context = TaskContext::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.timer_shared),
            Arc::clone(&self.counter),
        );
        let result = Arc::new(ResultCell::new());

        let body = f(TaskCx::new(Arc::clone(&context)));
        let cell = Arc::clone(&result);
        context.put_stored(Box::pin(async move {
            match body.await {
                Ok(value) => {
                    cell.put(value);
                    FinishKind::Completed
                }
                Err(cancelled) => FinishKind::Cancelled(cancelled.reason),
            }
        }));
        self.counter.increment();
        let handle = TaskHandle::new(Arc::clone(&context), result);

        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(task_id = %context.id(), "spawn refused, processor is shutting down");
            drop(context.take_stored());
            finish_task(&context, FinishKind::Cancelled(CancelReason::Shutdown));
            return handle;
        }

        if deadline.is_reachable() {
            self.timer_shared.arm(&context, deadline, TimerKind::Cancel);
        }
        context.schedule();
        handle
    }

    /// Approximate count of queued-but-not-running tasks.
    #[must_use]
    pub fn len_approx(&self) -> usize {
        self.queue.len_approx()
    }

    /// Count of alive (spawned, not yet finished) tasks.
    #[must_use]
    pub fn tasks_alive(&self) -> usize {
        self.counter.alive()
    }

    /// Number of worker shards.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.queue.shard_count()
    }

    /// The least-occupied shard right now, by approximate reads. Exposed for
    /// load-aware callers; the value is stale the moment it returns.
    #[must_use]
    pub fn find_least_occupied_thread(&self) -> usize {
        self.queue.find_least_occupied_thread()
    }

    /// Stops accepting tasks, waits for the alive ones to finish, then joins
    /// the worker and timer threads. Idempotent.
    ///
    /// Nothing is cancelled here; a task that never finishes blocks shutdown
    /// forever. Cancel or drop its handle first.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("task processor shutting down");
        self.counter.wait_for_exhaustion();
        self.queue.shutdown();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        self.timer.shutdown();
        tracing::debug!("task processor stopped");
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &Arc<TaskQueuePinned>, index: usize) {
    tracing::trace!(index, "worker started");
    refresh_coarse_now();
    while let Some(context) = queue.pop_blocking(index) {
        refresh_coarse_now();
        run_ready_task(&context);
    }
    tracing::trace!(index, "worker stopped");
}

/// Resumes one ready task: polls its body once and parks, requeues, or
/// finishes it according to the poll outcome.
fn run_ready_task(context: &Arc<TaskContext>) {
    if context.is_finished() {
        return;
    }
    // Cancelled before ever running: drop the body without polling it.
    if !context.has_started() && context.cancel_requested() && context.is_cancellable() {
        drop(context.take_stored());
        let reason = context
            .cancellation_reason()
            .unwrap_or(CancelReason::UserRequest);
        finish_task(context, FinishKind::Cancelled(reason));
        return;
    }
    let Some(mut stored) = context.take_stored() else {
        // A stale queue entry for a task already resumed elsewhere.
        return;
    };

    context.set_state(TaskState::Running);
    context.mark_started();
    let waker = Waker::from(Arc::new(ContextWaker {
        context: Arc::clone(context),
    }));
    let mut poll_cx = Context::from_waker(&waker);

    match catch_unwind(AssertUnwindSafe(|| stored.as_mut().poll(&mut poll_cx))) {
        Err(payload) => {
            let message = panic_text(payload.as_ref());
            tracing::warn!(task_id = %context.id(), message, "task panicked");
            context.set_panic_message(message);
            drop(stored);
            finish_task(context, FinishKind::Completed);
        }
        Ok(Poll::Ready(kind)) => {
            drop(stored);
            finish_task(context, kind);
        }
        Ok(Poll::Pending) => {
            context.put_stored(stored);
            context.set_state(TaskState::Suspended);
            park_or_requeue(context);
        }
    }
}

/// Publishes the sleeping bits after a pending poll. If a wakeup with the
/// current epoch already landed, its flag is in the previous word and that
/// wakeup did not schedule, so the requeue falls to us.
fn park_or_requeue(context: &Arc<TaskContext>) {
    let mut add = flags::SLEEPING;
    if !context.is_cancellable() {
        add |= flags::NON_CANCELLABLE;
    }
    let prev = context.suspend_flags(add);

    let mut pending = prev
        & (flags::WAKEUP_BY_WAIT_LIST
            | flags::WAKEUP_BY_DEADLINE_TIMER
            | flags::WAKEUP_BY_CANCEL_REQUEST);
    if add & flags::NON_CANCELLABLE != 0 {
        pending &= !flags::WAKEUP_BY_CANCEL_REQUEST;
    }
    if pending != 0 {
        context.schedule();
    }
}

/// Marks the task finished and releases everyone observing it.
pub(crate) fn finish_task(context: &Arc<TaskContext>, kind: FinishKind) {
    let terminal = match kind {
        FinishKind::Completed => TaskState::Completed,
        FinishKind::Cancelled(reason) => {
            context.note_cancel_reason(reason);
            TaskState::Cancelled
        }
    };
    context.try_finish(terminal);
    context.mark_finished_blocking();
    context.finish_waiters.wake_all();
    context.counter.decrement();
    tracing::trace!(task_id = %context.id(), kind = ?kind, "task finished");
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Bridges the std waker protocol onto the sleep-state wakeup, so task bodies
/// may also await foreign futures.
struct ContextWaker {
    context: Arc<TaskContext>,
}

impl Wake for ContextWaker {
    fn wake(self: Arc<Self>) {
        self.context.wakeup_no_epoch(WakeupSource::WaitList);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.context.wakeup_no_epoch(WakeupSource::WaitList);
    }
}
