// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded job queues.
//!
//! A queue owns a fixed ring of job handles and a pool of worker tasks.
//! Submission blocks while the ring is full (with optional deadline);
//! workers block while it is empty. Submitters queue FIFO for space and
//! are released one per dequeue; workers are woken FIFO as jobs arrive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, Weak};

use abi::{CtxField, JobError, TaskFlags, TaskId, WaitReason, WaitResult};
use arrayvec::ArrayString;

use crate::config::{
    QUEUE_CAPACITY_MAX, QUEUE_NAME_MAX_LEN, QUEUE_WORKER_COUNT_MAX,
    TASK_NAME_MAX_LEN, WORKER_PRIORITY,
};
use crate::ctx;
use crate::job::handle::{
    self, record_cancellation_locked, Job, JobHandler,
};
use crate::job::worker;
use crate::port::Spinlock;
use crate::sched::{self, TaskOptions, WaitContext};
use crate::time::Deadline;

/// Cumulative statistics emitted by the queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct JobStats {
    pub submitted: usize,
    pub executed: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Snapshot of queue depth and worker state.
#[derive(Copy, Clone, Debug)]
pub struct QueueInfo {
    pub depth: usize,
    pub capacity: usize,
    pub worker_count: usize,
    pub active_workers: usize,
    pub shutdown: bool,
    pub destroyed: bool,
}

/// Configuration for [`JobQueue::create`].
#[derive(Clone, Debug)]
pub struct QueueConfig<'a> {
    pub name: &'a str,
    pub capacity: usize,
    pub worker_count: usize,
    pub stack_bytes: usize,
    pub priority: u32,
    pub debug_log: bool,
}

impl<'a> QueueConfig<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            capacity: 8,
            worker_count: 2,
            stack_bytes: 0,
            priority: WORKER_PRIORITY,
            debug_log: false,
        }
    }
}

pub(crate) struct QueueInner {
    capacity: usize,
    head: usize,
    tail: usize,
    count: usize,
    ring: Vec<Option<Arc<Job>>>,
    worker_waiters: VecDeque<Arc<WaitContext>>,
    submit_waiters: Vec<Arc<WaitContext>>,
    stats: JobStats,
    destroyed: bool,
    shutdown_requested: bool,
    pub(crate) active_workers: usize,
    worker_tasks: Vec<TaskId>,
}

pub struct JobQueue {
    qid: u64,
    name: ArrayString<QUEUE_NAME_MAX_LEN>,
    worker_count: usize,
    worker_priority: u32,
    pub(crate) debug_log: bool,
    pub(crate) inner: Spinlock<QueueInner>,
}

static NEXT_QID: AtomicU64 = AtomicU64::new(1);
static QUEUES: Spinlock<Vec<(u64, Weak<JobQueue>)>> =
    Spinlock::new(Vec::new());

/// Resolves a queue by the id workers carry in their task metadata.
pub(crate) fn lookup_queue(qid: u64) -> Option<Arc<JobQueue>> {
    let queues = QUEUES.lock();
    queues
        .iter()
        .find(|(id, _)| *id == qid)
        .and_then(|(_, w)| w.upgrade())
}

fn map_wait_error(result: WaitResult) -> JobError {
    match result {
        WaitResult::Timeout => JobError::Timeout,
        WaitResult::ObjectDestroyed => JobError::Destroyed,
        _ => JobError::Shutdown,
    }
}

fn remove_waiter(list: &mut Vec<Arc<WaitContext>>, w: &Arc<WaitContext>) {
    list.retain(|x| !Arc::ptr_eq(x, w));
}

impl QueueInner {
    fn enqueue_locked(&mut self, job: Arc<Job>) {
        self.ring[self.tail] = Some(job);
        self.tail = (self.tail + 1) % self.capacity;
        self.count += 1;
        self.stats.submitted += 1;
        if let Some(w) = self.worker_waiters.pop_front() {
            w.wake(WaitResult::Ok);
        }
    }

    fn wake_submitter_locked(&mut self) {
        if !self.submit_waiters.is_empty() {
            let w = self.submit_waiters.remove(0);
            w.wake(WaitResult::Ok);
        }
    }
}

impl JobQueue {
    /// Creates a queue and starts its workers.
    pub fn create(
        config: &QueueConfig<'_>,
    ) -> Result<Arc<JobQueue>, JobError> {
        if config.name.is_empty()
            || config.name.len() >= QUEUE_NAME_MAX_LEN
            || config.capacity == 0
            || config.capacity > QUEUE_CAPACITY_MAX
            || config.worker_count == 0
            || config.worker_count > QUEUE_WORKER_COUNT_MAX
        {
            return Err(JobError::InvalidParam);
        }

        let qid = NEXT_QID.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(JobQueue {
            qid,
            name: ArrayString::from(config.name)
                .map_err(|_| JobError::InvalidParam)?,
            worker_count: config.worker_count,
            worker_priority: if config.priority != 0 {
                config.priority
            } else {
                WORKER_PRIORITY
            },
            debug_log: config.debug_log,
            inner: Spinlock::new(QueueInner {
                capacity: config.capacity,
                head: 0,
                tail: 0,
                count: 0,
                ring: (0..config.capacity).map(|_| None).collect(),
                worker_waiters: VecDeque::new(),
                submit_waiters: Vec::new(),
                stats: JobStats::default(),
                destroyed: false,
                shutdown_requested: false,
                active_workers: 0,
                worker_tasks: Vec::new(),
            }),
        });

        {
            let mut queues = QUEUES.lock();
            queues.retain(|(_, w)| w.strong_count() > 0);
            queues.push((qid, Arc::downgrade(&queue)));
        }
        worker::register_scheduler_hooks();

        for i in 0..config.worker_count {
            let worker_name = worker_task_name(&queue.name, i);
            let q2 = queue.clone();
            let created = sched::task_create(
                &TaskOptions {
                    name: &worker_name,
                    tag: queue.name.as_str(),
                    stack_bytes: config.stack_bytes,
                    priority: queue.worker_priority,
                    flags: TaskFlags::WORKER,
                    cpu_affinity: -1,
                    user_data: qid,
                },
                move || worker::worker_entry(q2),
            );
            match created {
                Ok(id) => queue.inner.lock().worker_tasks.push(id),
                Err(_) => {
                    // Unwind: stop the workers already running and leave
                    // the queue unusable.
                    let _ = queue.destroy();
                    return Err(JobError::NoMemory);
                }
            }
        }
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task id of one worker, for diagnostics and tests.
    pub fn worker_task_id(&self, index: usize) -> Option<TaskId> {
        self.inner.lock().worker_tasks.get(index).copied()
    }

    fn create_handle(&self, handler: JobHandler) -> Arc<Job> {
        let parent = ctx::current_job_id();
        let job = handle::handle_create(handler, parent);
        if let Some(jctx) = job.context() {
            let _ = ctx::set_field_kernel(
                &jctx,
                CtxField::PriorityHint,
                &self.worker_priority.to_le_bytes(),
            );
        }
        job
    }

    /// Blocks while the ring is full, honoring `deadline`. On success the
    /// queue lock is returned still held, with space available.
    fn wait_for_space<'a>(
        &'a self,
        deadline: Option<&Deadline>,
        mut g: MutexGuard<'a, QueueInner>,
    ) -> Result<MutexGuard<'a, QueueInner>, JobError> {
        let mut node: Option<Arc<WaitContext>> = None;
        while g.count >= g.capacity {
            if g.destroyed {
                return Err(JobError::Destroyed);
            }
            if g.shutdown_requested {
                return Err(JobError::Shutdown);
            }

            let w = node
                .take()
                .unwrap_or_else(|| Arc::new(WaitContext::new()));
            w.prepare_with_reason(WaitReason::Job);
            g.submit_waiters.push(w.clone());
            drop(g);

            let result = w.block(deadline);

            g = self.inner.lock();
            remove_waiter(&mut g.submit_waiters, &w);
            if result != WaitResult::Ok {
                g.stats.dropped += 1;
                return Err(map_wait_error(result));
            }
        }
        Ok(g)
    }

    /// Submits a job, blocking while the queue is full. Returns the
    /// handle; drop it to let completion reclaim the job, or keep it to
    /// wait, cancel, and destroy explicitly.
    pub fn submit_with_handle(
        &self,
        handler: JobHandler,
    ) -> Result<Arc<Job>, JobError> {
        self.submit_until_with_handle(handler, None)
    }

    pub fn submit(&self, handler: JobHandler) -> Result<(), JobError> {
        self.submit_with_handle(handler).map(|_| ())
    }

    /// Non-blocking submission; `QueueFull` when the ring has no space.
    pub fn submit_nowait_with_handle(
        &self,
        handler: JobHandler,
    ) -> Result<Arc<Job>, JobError> {
        let job = self.create_handle(handler);
        let mut g = self.inner.lock();
        if g.destroyed || g.shutdown_requested {
            return Err(JobError::Destroyed);
        }
        if g.count >= g.capacity {
            return Err(JobError::QueueFull);
        }
        g.enqueue_locked(job.clone());
        Ok(job)
    }

    pub fn submit_nowait(
        &self,
        handler: JobHandler,
    ) -> Result<(), JobError> {
        self.submit_nowait_with_handle(handler).map(|_| ())
    }

    /// Submission with a deadline for space to appear.
    pub fn submit_until_with_handle(
        &self,
        handler: JobHandler,
        deadline: Option<&Deadline>,
    ) -> Result<Arc<Job>, JobError> {
        let job = self.create_handle(handler);
        let g = self.inner.lock();
        if g.destroyed {
            return Err(JobError::Destroyed);
        }
        if g.shutdown_requested {
            return Err(JobError::Shutdown);
        }
        let mut g = self.wait_for_space(deadline, g)?;
        g.enqueue_locked(job.clone());
        Ok(job)
    }

    pub fn submit_until(
        &self,
        handler: JobHandler,
        deadline: Option<&Deadline>,
    ) -> Result<(), JobError> {
        self.submit_until_with_handle(handler, deadline).map(|_| ())
    }

    /// Worker-side dequeue: blocks while the ring is empty, releases one
    /// submit waiter per job taken.
    pub(crate) fn take(
        &self,
        wait: &Arc<WaitContext>,
    ) -> Result<Arc<Job>, JobError> {
        let mut g = self.inner.lock();
        loop {
            if g.count > 0 {
                break;
            }
            if g.destroyed {
                return Err(JobError::Destroyed);
            }
            if g.shutdown_requested {
                return Err(JobError::Shutdown);
            }

            wait.prepare_with_reason(WaitReason::Job);
            g.worker_waiters.push_back(wait.clone());
            drop(g);

            let result = wait.block(None);

            g = self.inner.lock();
            if let Some(pos) = g
                .worker_waiters
                .iter()
                .position(|w| Arc::ptr_eq(w, wait))
            {
                g.worker_waiters.remove(pos);
            }
            if result != WaitResult::Ok {
                return Err(match result {
                    WaitResult::ObjectDestroyed => JobError::Destroyed,
                    _ => JobError::Shutdown,
                });
            }
        }

        let head = g.head;
        let job = g.ring[head].take();
        g.head = (g.head + 1) % g.capacity;
        g.count -= 1;
        g.wake_submitter_locked();
        // The ring slot was occupied by construction of `count`.
        job.ok_or(JobError::Shutdown)
    }

    /// Destroys the queue: cancels every queued-but-unstarted job, fails
    /// all blocked submitters and workers, and stops the worker tasks.
    /// Handlers already running are allowed to complete.
    pub fn destroy(&self) -> Result<(), JobError> {
        let (pending, workers) = {
            let mut g = self.inner.lock();
            if g.destroyed {
                return Err(JobError::Destroyed);
            }
            g.destroyed = true;
            g.shutdown_requested = true;

            let mut pending = Vec::new();
            let mut idx = g.head;
            for _ in 0..g.count {
                if let Some(job) = g.ring[idx].take() {
                    pending.push(job);
                }
                idx = (idx + 1) % g.capacity;
            }
            g.count = 0;

            for w in g.submit_waiters.drain(..) {
                w.wake(WaitResult::ObjectDestroyed);
            }
            for w in g.worker_waiters.drain(..) {
                w.wake(WaitResult::ObjectDestroyed);
            }
            (pending, std::mem::take(&mut g.worker_tasks))
        };

        for job in pending {
            let mut inner = job.inner.lock();
            if !inner.result_ready {
                record_cancellation_locked(&mut inner);
            }
        }
        for id in workers {
            let _ = sched::task_destroy(id);
        }
        QUEUES.lock().retain(|(id, _)| *id != self.qid);
        Ok(())
    }

    pub fn info(&self) -> QueueInfo {
        let g = self.inner.lock();
        QueueInfo {
            depth: g.count,
            capacity: g.capacity,
            worker_count: self.worker_count,
            active_workers: g.active_workers,
            shutdown: g.shutdown_requested,
            destroyed: g.destroyed,
        }
    }

    pub fn stats(&self) -> JobStats {
        self.inner.lock().stats
    }

    pub(crate) fn note_executed(&self, failed: bool) {
        let mut g = self.inner.lock();
        g.stats.executed += 1;
        if failed {
            g.stats.failed += 1;
        }
    }
}

/// Builds the bounded `<queue>-wrk<N>` task name, truncating the queue
/// name as needed to keep the suffix intact.
fn worker_task_name(
    queue_name: &str,
    index: usize,
) -> ArrayString<TASK_NAME_MAX_LEN> {
    let mut name = ArrayString::<TASK_NAME_MAX_LEN>::new();
    let suffix_len = 4 + decimal_digits(index);
    let prefix_len =
        (TASK_NAME_MAX_LEN - 1).saturating_sub(suffix_len);
    let prefix = &queue_name[..queue_name.len().min(prefix_len)];
    let _ = name.try_push_str(prefix);
    let _ = name.try_push_str("-wrk");
    let mut digits = ArrayString::<20>::new();
    let mut n = index;
    loop {
        let _ = digits.try_push((b'0' + (n % 10) as u8) as char);
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for c in digits.chars().rev() {
        let _ = name.try_push(c);
    }
    name
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
