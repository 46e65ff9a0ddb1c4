// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end job queue behavior: saturation, submit-wait ordering, and
//! cancellation of not-yet-started jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use abi::{FutureWait, JobError, JobStatus};
use kern::job::{self, JobQueue, JobResult, QueueConfig};
use kern::sched;
use kern::startup::{self, BootOptions};
use kern::vfs::ramfs::RamFs;

fn boot() {
    static BOOTED: OnceLock<()> = OnceLock::new();
    BOOTED.get_or_init(|| {
        startup::kernel_init(BootOptions {
            mount_root: Some(RamFs::new()),
            autostart: false,
        });
    });
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Queue saturation with a suspended worker: blocked submitters are
/// admitted in order as the worker drains, and the stats add up.
#[test]
fn saturation_and_fifo_submit_wait() {
    boot();
    let queue = JobQueue::create(&QueueConfig {
        capacity: 2,
        worker_count: 1,
        ..QueueConfig::new("q-sat")
    })
    .unwrap();

    // Park the worker before feeding the queue.
    let worker = queue.worker_task_id(0).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    sched::task_suspend(worker).unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> =
        Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let order = order.clone();
        move |_: &Arc<job::Job>| {
            order.lock().unwrap().push(name);
            JobResult::success()
        }
    };

    let ha = queue.submit_with_handle(Box::new(record("A"))).unwrap();
    let hb = queue.submit_with_handle(Box::new(record("B"))).unwrap();
    assert_eq!(
        queue.submit_nowait(Box::new(record("C-rejected"))).unwrap_err(),
        JobError::QueueFull
    );

    // A third submission blocks for space on its own task.
    let admitted = Arc::new(AtomicBool::new(false));
    let hc_slot: Arc<Mutex<Option<Arc<job::Job>>>> =
        Arc::new(Mutex::new(None));
    {
        let queue = queue.clone();
        let admitted = admitted.clone();
        let hc_slot = hc_slot.clone();
        let handler = record("C");
        sched::task_create(
            &sched::TaskOptions {
                name: "t-submit",
                ..sched::TaskOptions::default()
            },
            move || {
                let h = queue
                    .submit_with_handle(Box::new(handler))
                    .unwrap();
                *hc_slot.lock().unwrap() = Some(h);
                admitted.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    }

    // Still full: the submitter must stay blocked.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!admitted.load(Ordering::SeqCst));

    sched::task_resume(worker).unwrap();
    wait_until(|| admitted.load(Ordering::SeqCst), "blocked submitter");

    for h in [&ha, &hb] {
        let r = job::wait_for_job(h).unwrap();
        assert_eq!(r.status, JobStatus::Success);
    }
    let hc = hc_slot.lock().unwrap().clone().unwrap();
    let r = job::wait_for_job(&hc).unwrap();
    assert_eq!(r.status, JobStatus::Success);

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);

    let stats = queue.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.executed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dropped, 0);

    for h in [&ha, &hb, &hc] {
        job::handle_destroy(h).unwrap();
    }
    queue.destroy().unwrap();
}

/// Cancelling a queued-but-unstarted job: the worker must not invoke the
/// handler, waiters see CANCELLED, and the handle destroys cleanly.
#[test]
fn cancellation_of_unstarted_job() {
    boot();
    let queue = JobQueue::create(&QueueConfig {
        capacity: 2,
        worker_count: 1,
        ..QueueConfig::new("q-cancel")
    })
    .unwrap();

    let worker = queue.worker_task_id(0).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    sched::task_suspend(worker).unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r2 = ran.clone();
    let handle = queue
        .submit_with_handle(Box::new(move |_| {
            r2.store(true, Ordering::SeqCst);
            JobResult::success()
        }))
        .unwrap();

    job::cancel(&handle).unwrap();
    sched::task_resume(worker).unwrap();

    let result = job::wait_for_job(&handle).unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(!ran.load(Ordering::SeqCst), "cancelled handler must not run");
    job::handle_destroy(&handle).unwrap();

    let stats = queue.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.executed, 0);
    queue.destroy().unwrap();
}

/// Destroying a queue fails blocked submitters and cancels everything
/// still sitting in the ring.
#[test]
fn destroy_cancels_pending_and_fails_blockers() {
    boot();
    let queue = JobQueue::create(&QueueConfig {
        capacity: 1,
        worker_count: 1,
        ..QueueConfig::new("q-destroy")
    })
    .unwrap();

    let worker = queue.worker_task_id(0).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    sched::task_suspend(worker).unwrap();

    let pending = queue
        .submit_with_handle(Box::new(|_| JobResult::success()))
        .unwrap();

    let blocked_result: Arc<Mutex<Option<JobError>>> =
        Arc::new(Mutex::new(None));
    {
        let queue = queue.clone();
        let blocked_result = blocked_result.clone();
        sched::task_create(
            &sched::TaskOptions {
                name: "t-blocked",
                ..sched::TaskOptions::default()
            },
            move || {
                let err = queue
                    .submit(Box::new(|_| JobResult::success()))
                    .unwrap_err();
                *blocked_result.lock().unwrap() = Some(err);
            },
        )
        .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));

    queue.destroy().unwrap();
    wait_until(
        || blocked_result.lock().unwrap().is_some(),
        "blocked submitter failure",
    );
    assert_eq!(
        blocked_result.lock().unwrap().unwrap(),
        JobError::Destroyed
    );

    let r = job::wait_for_job(&pending).unwrap();
    assert_eq!(r.status, JobStatus::Cancelled);
    job::handle_destroy(&pending).unwrap();

    // Late submissions bounce off the dead queue.
    assert_eq!(
        queue.submit_nowait(Box::new(|_| JobResult::success())),
        Err(JobError::Destroyed)
    );
    assert_eq!(queue.destroy().unwrap_err(), JobError::Destroyed);
}

/// Futures observe results; timed waits expire; try-wait never blocks.
#[test]
fn future_wait_paths_against_live_queue() {
    boot();
    let queue = JobQueue::create(&QueueConfig {
        capacity: 4,
        worker_count: 2,
        ..QueueConfig::new("q-future")
    })
    .unwrap();

    // Slow job: try_wait sees NotReady, timed wait expires, full wait
    // completes.
    let handle = queue
        .submit_with_handle(Box::new(|_| {
            sched::sleep_ms(80);
            JobResult::success()
        }))
        .unwrap();

    match job::try_wait_for_job(&handle) {
        Err(FutureWait::NotReady) => {}
        Ok(r) => assert_eq!(r.status, JobStatus::Success),
        other => panic!("unexpected try_wait result: {other:?}"),
    }
    let deadline = kern::time::Deadline::from_relative(5_000);
    match job::wait_for_job_timed(&handle, Some(&deadline)) {
        Err(FutureWait::Timeout) => {}
        Ok(r) => assert_eq!(r.status, JobStatus::Success),
        other => panic!("unexpected timed wait result: {other:?}"),
    }

    let r = job::wait_for_job(&handle).unwrap();
    assert_eq!(r.status, JobStatus::Success);
    job::handle_destroy(&handle).unwrap();
    queue.destroy().unwrap();
}

/// Handler results flow into queue stats, including failures.
#[test]
fn stats_track_failed_handlers() {
    boot();
    let queue = JobQueue::create(&QueueConfig {
        capacity: 4,
        worker_count: 1,
        ..QueueConfig::new("q-stats")
    })
    .unwrap();

    let ok = queue
        .submit_with_handle(Box::new(|_| JobResult::success()))
        .unwrap();
    let bad = queue
        .submit_with_handle(Box::new(|_| JobResult::error()))
        .unwrap();

    assert_eq!(job::wait_for_job(&ok).unwrap().status, JobStatus::Success);
    assert_eq!(job::wait_for_job(&bad).unwrap().status, JobStatus::Error);

    let stats = queue.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.failed, 1);

    job::handle_destroy(&ok).unwrap();
    job::handle_destroy(&bad).unwrap();
    queue.destroy().unwrap();
}
