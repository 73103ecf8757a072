//! Synchronization primitives exercised from real tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand::{
    spawn, ConditionVariable, CvStatus, Deadline, Mutex, TaskProcessor, TaskProcessorConfig,
    WaitList, WaitListLight,
};

fn processor(workers: usize) -> TaskProcessor {
    strand::test_utils::init_test_logging();
    TaskProcessor::new(
        TaskProcessorConfig::new()
            .worker_threads(workers)
            .thread_name("sync-test"),
    )
}

#[test]
fn mutex_counts_exactly() {
    const TASKS: usize = 8;
    const INCREMENTS: usize = 100;

    let processor = processor(4);
    let counter = Arc::new(Mutex::new(0_usize));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let counter = Arc::clone(&counter);
            spawn(&processor, move |cx| async move {
                for _ in 0..INCREMENTS {
                    let mut guard = counter.lock(&cx).await?;
                    *guard += 1;
                    drop(guard);
                    cx.yield_now().await?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.get_blocking(), Ok(()));
    }
    assert_eq!(counter.try_lock().map(|guard| *guard), Some(TASKS * INCREMENTS));
}

#[test]
fn mutex_deadline_gives_up_but_plain_lock_waits() {
    let processor = processor(2);
    let mutex = Arc::new(Mutex::new(()));
    let holder_has_it = Arc::new(AtomicBool::new(false));

    let holder = {
        let mutex = Arc::clone(&mutex);
        let holder_has_it = Arc::clone(&holder_has_it);
        spawn(&processor, move |cx| async move {
            let guard = mutex.lock(&cx).await?;
            holder_has_it.store(true, Ordering::SeqCst);
            cx.sleep_for(Duration::from_millis(120)).await?;
            drop(guard);
            Ok(())
        })
    };
    while !holder_has_it.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let contender = {
        let mutex = Arc::clone(&mutex);
        spawn(&processor, move |cx| async move {
            let bounded = mutex
                .lock_with_deadline(&cx, Deadline::from_duration(Duration::from_millis(20)))
                .await?;
            assert!(bounded.is_none(), "the holder keeps it far past 20ms");
            // Unbounded lock succeeds once the holder lets go.
            let guard = mutex.lock(&cx).await?;
            drop(guard);
            Ok(())
        })
    };
    assert_eq!(contender.get_blocking(), Ok(()));
    assert_eq!(holder.get_blocking(), Ok(()));
}

// A contender cancelled while parked must never swallow the unlock's only
// wakeup; the remaining contender still has to acquire. Run many rounds to
// hit the cancel/unlock race.
#[test]
fn cancelled_waiter_does_not_strand_the_lock() {
    const ROUNDS: usize = 20;

    let processor = processor(4);
    let mutex = Arc::new(Mutex::new(0_usize));

    for _ in 0..ROUNDS {
        let holding = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));

        let holder = {
            let mutex = Arc::clone(&mutex);
            let holding = Arc::clone(&holding);
            let release = Arc::clone(&release);
            spawn(&processor, move |cx| async move {
                let guard = mutex.lock(&cx).await?;
                holding.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    cx.sleep_for(Duration::from_millis(1)).await?;
                }
                drop(guard);
                Ok(())
            })
        };
        while !holding.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let victim = {
            let mutex = Arc::clone(&mutex);
            spawn(&processor, move |cx| async move {
                let guard = mutex.lock(&cx).await?;
                drop(guard);
                Ok(())
            })
        };
        let survivor = {
            let mutex = Arc::clone(&mutex);
            spawn(&processor, move |cx| async move {
                let mut guard = mutex.lock(&cx).await?;
                *guard += 1;
                Ok(())
            })
        };
        // Let both contenders park, then race the cancel against the unlock.
        std::thread::sleep(Duration::from_millis(10));
        victim.request_cancel();
        release.store(true, Ordering::SeqCst);

        assert_eq!(survivor.get_blocking(), Ok(()));
        // The victim either slipped in before the cancel or was cancelled.
        let _ = victim.get_blocking();
        assert_eq!(holder.get_blocking(), Ok(()));
    }
    assert_eq!(mutex.try_lock().map(|guard| *guard), Some(ROUNDS));
}

#[test]
fn condvar_ignores_spurious_notifies() {
    let processor = processor(2);
    let state = Arc::new(Mutex::new(0_u32));
    let cond = Arc::new(ConditionVariable::new());

    let consumer = {
        let state = Arc::clone(&state);
        let cond = Arc::clone(&cond);
        spawn(&processor, move |cx| async move {
            let guard = state.lock(&cx).await?;
            let (guard, status) = cond
                .wait_until(&cx, guard, Deadline::unreachable(), |value| *value >= 5)
                .await;
            assert_eq!(status, CvStatus::Ok);
            assert!(*guard >= 5, "woke with the predicate still false");
            Ok(*guard)
        })
    };

    // Spurious storm: notify repeatedly without making the predicate true.
    for _ in 0..50 {
        cond.notify_all();
        std::thread::sleep(Duration::from_millis(1));
    }
    let producer = {
        let state = Arc::clone(&state);
        let cond = Arc::clone(&cond);
        spawn(&processor, move |cx| async move {
            for _ in 0..5 {
                let mut guard = state.lock(&cx).await?;
                *guard += 1;
                drop(guard);
                cond.notify_one();
                cx.yield_now().await?;
            }
            Ok(())
        })
    };
    assert_eq!(producer.get_blocking(), Ok(()));
    // Belt and braces against the consumer parking after the last notify.
    while !consumer.is_finished() {
        cond.notify_all();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(consumer.get_blocking(), Ok(5));
}

#[test]
fn condvar_times_out_with_the_lock_back() {
    let processor = processor(2);
    let state = Arc::new(Mutex::new(false));
    let cond = Arc::new(ConditionVariable::new());

    let waiter = {
        let state = Arc::clone(&state);
        let cond = Arc::clone(&cond);
        spawn(&processor, move |cx| async move {
            let guard = state.lock(&cx).await?;
            let (guard, status) = cond
                .wait_until(
                    &cx,
                    guard,
                    Deadline::from_duration(Duration::from_millis(30)),
                    |ready| *ready,
                )
                .await;
            assert_eq!(status, CvStatus::Timeout);
            // The guard is valid and exclusive again.
            assert!(!*guard);
            Ok(())
        })
    };
    assert_eq!(waiter.get_blocking(), Ok(()));
    assert!(!state.is_locked());
}

#[test]
fn condvar_reports_cancellation_of_the_waiter() {
    let processor = processor(2);
    let state = Arc::new(Mutex::new(false));
    let cond = Arc::new(ConditionVariable::new());
    let parked = Arc::new(AtomicBool::new(false));

    let waiter = {
        let state = Arc::clone(&state);
        let cond = Arc::clone(&cond);
        let parked = Arc::clone(&parked);
        spawn(&processor, move |cx| async move {
            let guard = state.lock(&cx).await?;
            parked.store(true, Ordering::SeqCst);
            let (guard, status) = cond.wait(&cx, guard).await;
            drop(guard);
            Ok(status == CvStatus::Cancelled)
        })
    };
    while !parked.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(10));
    waiter.request_cancel();
    assert_eq!(waiter.get_blocking(), Ok(true));
}

#[test]
fn wait_list_wakes_every_parked_task() {
    const WAITERS: usize = 6;

    let processor = processor(3);
    let list = Arc::new(WaitList::new());
    let released = Arc::new(AtomicBool::new(false));
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let list = Arc::clone(&list);
            let released = Arc::clone(&released);
            let woken = Arc::clone(&woken);
            spawn(&processor, move |cx| async move {
                while !released.load(Ordering::SeqCst) {
                    // Deadline-bounded so a wake racing the park cannot hang us.
                    let _ = list
                        .wait(&cx, Deadline::from_duration(Duration::from_millis(20)))
                        .await?;
                }
                woken.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(30));
    released.store(true, Ordering::SeqCst);
    list.wake_all();
    for handle in handles {
        assert_eq!(handle.get_blocking(), Ok(()));
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn wait_list_light_single_handoff() {
    let processor = processor(2);
    let slot = Arc::new(WaitListLight::new());
    let released = Arc::new(AtomicBool::new(false));

    let waiter = {
        let slot = Arc::clone(&slot);
        let released = Arc::clone(&released);
        spawn(&processor, move |cx| async move {
            let mut wakeups = 0_u32;
            while !released.load(Ordering::SeqCst) {
                if slot
                    .wait(&cx, Deadline::from_duration(Duration::from_millis(20)))
                    .await?
                {
                    wakeups += 1;
                }
            }
            Ok(wakeups)
        })
    };

    std::thread::sleep(Duration::from_millis(30));
    released.store(true, Ordering::SeqCst);
    slot.wakeup_one();
    let wakeups = waiter.get_blocking().unwrap();
    // Deadline expiries are not wakeups; at most the final nudge counts.
    assert!(wakeups <= 2, "unexpected wakeup count {wakeups}");
}
