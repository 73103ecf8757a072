//! End-to-end scheduler scenarios.

use std::sync::Arc;
use std::time::Duration;

use strand::{spawn, Deadline, Mutex, TaskProcessor, TaskProcessorConfig};

fn processor(workers: usize) -> TaskProcessor {
    strand::test_utils::init_test_logging();
    TaskProcessor::new(
        TaskProcessorConfig::new()
            .worker_threads(workers)
            .thread_name("engine-test"),
    )
}

#[test]
fn thousand_tasks_share_one_mutex() {
    let processor = processor(4);
    let counter = Arc::new(Mutex::new(0_u64));

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let counter = Arc::clone(&counter);
            spawn(&processor, move |cx| async move {
                let mut guard = counter.lock(&cx).await?;
                *guard += 1;
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.get_blocking(), Ok(()));
    }

    assert_eq!(counter.try_lock().map(|guard| *guard), Some(1000));
    processor.shutdown();
    assert_eq!(processor.len_approx(), 0);
}

#[test]
fn tasks_wait_on_each_other() {
    let processor = Arc::new(processor(4));

    let outer = {
        let pool = Arc::clone(&processor);
        processor.spawn(move |cx| async move {
            let inner = pool.spawn(|cx| async move {
                cx.yield_now().await?;
                Ok(7)
            });
            match inner.get(&cx).await {
                Ok(value) => Ok(value * 6),
                Err(error) => panic!("inner task failed: {error}"),
            }
        })
    };
    assert_eq!(outer.get_blocking(), Ok(42));
}

#[test]
fn wait_with_deadline_reports_unfinished_target() {
    let processor = Arc::new(processor(2));

    let checker = {
        let pool = Arc::clone(&processor);
        processor.spawn(move |cx| async move {
            let slow = pool.spawn(|cx| async move {
                cx.sleep_for(Duration::from_millis(200)).await?;
                Ok(())
            });
            let finished = slow
                .wait_with_deadline(&cx, Deadline::from_duration(Duration::from_millis(20)))
                .await?;
            assert!(!finished, "a 200ms task cannot finish in 20ms");
            // Second wait without a bound sees it through.
            slow.wait(&cx).await?;
            assert!(slow.is_finished());
            Ok(())
        })
    };
    assert_eq!(checker.get_blocking(), Ok(()));
}

#[test]
fn timed_sleep_resumes_on_its_own() {
    let processor = processor(1);
    let handle = spawn(&processor, |cx| async move {
        let before = std::time::Instant::now();
        cx.sleep_for(Duration::from_millis(30)).await?;
        Ok(before.elapsed())
    });
    let slept = handle.get_blocking().unwrap();
    assert!(slept >= Duration::from_millis(30), "woke early: {slept:?}");
}

#[test]
fn detached_task_outlives_its_handle() {
    let processor = processor(2);
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let flag = Arc::clone(&flag);
        spawn(&processor, move |cx| async move {
            cx.sleep_for(Duration::from_millis(20)).await?;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .detach();
    }
    processor.shutdown();
    assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn shutdown_is_idempotent_and_drains() {
    let processor = processor(2);
    for _ in 0..16 {
        spawn(&processor, |cx| async move {
            cx.yield_now().await?;
            Ok(())
        })
        .detach();
    }
    processor.shutdown();
    processor.shutdown();
    assert_eq!(processor.len_approx(), 0);
    assert_eq!(processor.tasks_alive(), 0);
}
