//! The sharded ready queue: one shard per worker, tasks pinned at first push.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::task::context::{TaskContext, UNPINNED};

struct Shard {
    queue: SegQueue<Arc<TaskContext>>,
    /// Count of items the owning worker has been notified about but not yet
    /// popped; the condvar sleeps idle workers.
    pending: Mutex<usize>,
    available: Condvar,
    /// Occupancy heuristic read by placement; never a correctness dependency.
    size_approx: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pending: Mutex::new(0),
            available: Condvar::new(),
            size_approx: AtomicUsize::new(0),
        }
    }
}

/// Index of the first minimum. Ties go to the lowest index, a deliberate
/// replaceable placement heuristic.
pub(crate) fn index_of_min(occupancies: &[usize]) -> usize {
    let mut best = 0;
    for (index, &occupancy) in occupancies.iter().enumerate().skip(1) {
        if occupancy < occupancies[best] {
            best = index;
        }
    }
    best
}

/// The ready queue. A task is pinned to one shard on its first push and stays
/// there for life; FIFO order holds within a shard only.
pub(crate) struct TaskQueuePinned {
    shards: Box<[Shard]>,
    closed: AtomicBool,
}

impl TaskQueuePinned {
    pub(crate) fn new(workers: usize) -> Arc<Self> {
        debug_assert!(workers > 0);
        Arc::new(Self {
            shards: (0..workers).map(|_| Shard::new()).collect(),
            closed: AtomicBool::new(false),
        })
    }

    /// Picks the shard with the fewest queued tasks by approximate reads.
    pub(crate) fn find_least_occupied_thread(&self) -> usize {
        let occupancies: SmallVec<[usize; 16]> = self
            .shards
            .iter()
            .map(|shard| shard.size_approx.load(Ordering::Relaxed))
            .collect();
        index_of_min(&occupancies)
    }

    /// Enqueues a ready task, pinning it on first push.
    pub(crate) fn push(&self, context: Arc<TaskContext>) {
        let mut shard_index = context.pinned_shard.load(Ordering::Acquire);
        if shard_index == UNPINNED {
            shard_index = self.find_least_occupied_thread();
            context.pinned_shard.store(shard_index, Ordering::Release);
        }
        let shard = &self.shards[shard_index];
        shard.size_approx.fetch_add(1, Ordering::Relaxed);
        shard.queue.push(context);
        let mut pending = shard.pending.lock();
        *pending += 1;
        drop(pending);
        shard.available.notify_one();
    }

    /// Pops the next ready task for `worker_index`, sleeping while the shard
    /// is empty. Returns `None` once the queue is closed and drained.
    pub(crate) fn pop_blocking(&self, worker_index: usize) -> Option<Arc<TaskContext>> {
        let shard = &self.shards[worker_index];
        let mut pending = shard.pending.lock();
        loop {
            if *pending > 0 {
                *pending -= 1;
                drop(pending);
                shard.size_approx.fetch_sub(1, Ordering::Relaxed);
                // The notification may narrowly precede the push landing.
                loop {
                    if let Some(context) = shard.queue.pop() {
                        return Some(context);
                    }
                    std::hint::spin_loop();
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            shard.available.wait(&mut pending);
        }
    }

    /// Closes the queue and wakes every idle worker. Already-queued tasks are
    /// still drained by their owners.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for shard in self.shards.iter() {
            let pending = shard.pending.lock();
            drop(pending);
            shard.available.notify_all();
        }
    }

    /// Approximate total queue length.
    pub(crate) fn len_approx(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.size_approx.load(Ordering::Relaxed))
            .sum()
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
