// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Futures: blocking observers on job completion.
//!
//! A future pins the job handle (via `future_count`) so that the handle
//! cannot be destroyed while anyone might still wait on it. The
//! wait-for-job helpers are thin shims that run a throwaway future
//! through init/wait/deinit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abi::{FutureWait, IpcResult, JobError, WaitReason};

use crate::ipc::Waiter;
use crate::job::handle::{Job, JobResult};
use crate::time::Deadline;

pub struct Future {
    job: Option<Arc<Job>>,
    waiter: Arc<Waiter>,
    initialized: bool,
    /// Set while this future's waiter sits on the job's wait queue. A
    /// future holds a single waiter, so a second concurrent `wait` must
    /// be refused rather than enqueuing it twice. Atomic only because
    /// `wait` takes `&self`; every transition happens under the job
    /// lock, which is what actually serializes it.
    waiting: AtomicBool,
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl Future {
    pub fn new() -> Self {
        Self {
            job: None,
            waiter: Arc::new(Waiter::new()),
            initialized: false,
            waiting: AtomicBool::new(false),
        }
    }

    /// Attaches the future to `job`, pinning the handle.
    pub fn init(&mut self, job: &Arc<Job>) -> Result<(), JobError> {
        let mut inner = job.inner.lock();
        if inner.destroyed {
            return Err(JobError::Destroyed);
        }
        inner.future_count += 1;
        drop(inner);
        self.job = Some(job.clone());
        self.initialized = true;
        self.waiting.store(false, Ordering::Relaxed);
        self.waiter.prepare(WaitReason::Job);
        Ok(())
    }

    /// Detaches the future, unpinning the handle.
    pub fn deinit(&mut self) {
        if !self.initialized {
            return;
        }
        if let Some(job) = &self.job {
            let mut inner = job.inner.lock();
            inner.future_count = inner.future_count.saturating_sub(1);
        }
        self.initialized = false;
        self.waiting.store(false, Ordering::Relaxed);
        self.job = None;
    }

    /// Waits for the job to complete, with an optional deadline. A
    /// future supports one wait at a time; overlapping waits on the same
    /// future report `Shutdown`.
    pub fn wait(
        &self,
        deadline: Option<&Deadline>,
    ) -> Result<JobResult, FutureWait> {
        let Some(job) = self.job.as_ref().filter(|_| self.initialized)
        else {
            return Err(FutureWait::Destroyed);
        };

        {
            let mut inner = job.inner.lock();
            if inner.destroyed {
                return Err(FutureWait::Destroyed);
            }
            if inner.result_ready {
                return Ok(inner.result);
            }
            if self.waiting.swap(true, Ordering::Relaxed) {
                return Err(FutureWait::Shutdown);
            }
            self.waiter.prepare(WaitReason::Job);
            inner.waiters.enqueue(self.waiter.clone());
            inner.waiter_count += 1;
        }

        let wait_res = self.waiter.block(deadline);

        let mut inner = job.inner.lock();
        self.waiting.store(false, Ordering::Relaxed);
        inner.waiter_count = inner.waiter_count.saturating_sub(1);
        inner.waiters.remove(&self.waiter);

        if wait_res == IpcResult::Ok {
            if inner.result_ready {
                return Ok(inner.result);
            }
            // Woken without a result: only reachable if the wake was
            // spurious; report not-ready rather than inventing one.
            return Err(FutureWait::NotReady);
        }
        Err(FutureWait::from(wait_res))
    }

    /// Waits with a relative timeout in microseconds.
    pub fn wait_timed(
        &self,
        timeout_us: u64,
    ) -> Result<JobResult, FutureWait> {
        let deadline = Deadline::from_relative(timeout_us);
        self.wait(Some(&deadline))
    }

    /// Non-blocking poll of the job's result.
    pub fn try_wait(&self) -> Result<JobResult, FutureWait> {
        let Some(job) = self.job.as_ref().filter(|_| self.initialized)
        else {
            return Err(FutureWait::Destroyed);
        };
        let inner = job.inner.lock();
        if inner.destroyed {
            return Err(FutureWait::Destroyed);
        }
        if inner.result_ready {
            return Ok(inner.result);
        }
        Err(FutureWait::NotReady)
    }
}

impl Drop for Future {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Blocks until `job` completes and returns its result.
pub fn wait_for_job(job: &Arc<Job>) -> Result<JobResult, FutureWait> {
    wait_for_job_internal(job, None)
}

/// Blocks until `job` completes or `deadline` passes.
pub fn wait_for_job_timed(
    job: &Arc<Job>,
    deadline: Option<&Deadline>,
) -> Result<JobResult, FutureWait> {
    wait_for_job_internal(job, deadline)
}

/// Polls `job` for a result without blocking.
pub fn try_wait_for_job(job: &Arc<Job>) -> Result<JobResult, FutureWait> {
    let mut future = Future::new();
    future
        .init(job)
        .map_err(|_| FutureWait::Destroyed)?;
    let result = future.try_wait();
    future.deinit();
    result
}

fn wait_for_job_internal(
    job: &Arc<Job>,
    deadline: Option<&Deadline>,
) -> Result<JobResult, FutureWait> {
    let mut future = Future::new();
    future
        .init(job)
        .map_err(|_| FutureWait::Destroyed)?;
    let result = future.wait(deadline);
    future.deinit();
    result
}
