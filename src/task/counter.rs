//! Count of alive tasks on a processor, used by shutdown to drain.

use parking_lot::{Condvar, Mutex};

pub(crate) struct TaskCounter {
    alive: Mutex<usize>,
    exhausted: Condvar,
}

impl TaskCounter {
    pub(crate) fn new() -> Self {
        Self {
            alive: Mutex::new(0),
            exhausted: Condvar::new(),
        }
    }

    pub(crate) fn increment(&self) {
        *self.alive.lock() += 1;
    }

    pub(crate) fn decrement(&self) {
        let mut alive = self.alive.lock();
        debug_assert!(*alive > 0, "task counter underflow");
        *alive -= 1;
        if *alive == 0 {
            self.exhausted.notify_all();
        }
    }

    pub(crate) fn alive(&self) -> usize {
        *self.alive.lock()
    }

    /// Blocks until every counted task has finished.
    pub(crate) fn wait_for_exhaustion(&self) {
        let mut alive = self.alive.lock();
        while *alive > 0 {
            self.exhausted.wait(&mut alive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exhaustion_unblocks_waiter() {
        let counter = Arc::new(TaskCounter::new());
        counter.increment();
        counter.increment();

        let waiter = {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || counter.wait_for_exhaustion())
        };
        counter.decrement();
        assert_eq!(counter.alive(), 1);
        counter.decrement();
        waiter.join().unwrap();
        assert_eq!(counter.alive(), 0);
    }
}
