// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Job handle lifecycle: creation, results, cancellation, destruction,
//! and policy-checked context field access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use abi::{
    CtxError, CtxField, CtxFieldPolicy, CtxSchedState, IpcResult, JobError,
    JobId, JobState, JobStatus,
};

use crate::ctx::{self, JobCtx};
use crate::ipc::WaitQueue;
use crate::port::Spinlock;
use crate::time::now_us;

/// Handler invoked by a worker on behalf of a job. Receives the job so it
/// can observe cancellation and reach its context.
pub type JobHandler =
    Box<dyn FnOnce(&Arc<Job>) -> JobResult + Send + 'static>;

/// Result descriptor recorded when a job finishes. The payload, if any,
/// points at memory the handler owns (typically in the job's heap).
#[derive(Copy, Clone, Debug)]
pub struct JobResult {
    pub status: JobStatus,
    pub payload: *const u8,
    pub payload_size: usize,
}

// Safety: the payload pointer is an opaque value; the kernel never
// dereferences it, only hands it back to whoever waits on the job.
unsafe impl Send for JobResult {}
unsafe impl Sync for JobResult {}

impl JobResult {
    pub const fn new(status: JobStatus) -> Self {
        Self {
            status,
            payload: core::ptr::null(),
            payload_size: 0,
        }
    }

    pub const fn success() -> Self {
        Self::new(JobStatus::Success)
    }

    pub const fn error() -> Self {
        Self::new(JobStatus::Error)
    }
}

pub(crate) struct JobInner {
    pub handler: Option<JobHandler>,
    pub ctx: Option<Arc<JobCtx>>,
    pub state: JobState,
    pub cancelled: bool,
    pub destroyed: bool,
    pub result_ready: bool,
    pub result: JobResult,
    pub future_count: usize,
    pub waiter_count: usize,
    pub waiters: WaitQueue,
}

/// One submitted unit of work.
pub struct Job {
    id: JobId,
    pub(crate) inner: Spinlock<JobInner>,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The job's context, until the handle is destroyed.
    pub fn context(&self) -> Option<Arc<JobCtx>> {
        self.inner.lock().ctx.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);
static JOBS: Spinlock<Vec<(JobId, Weak<Job>)>> = Spinlock::new(Vec::new());

type DestroyListener = Arc<dyn Fn(JobId) + Send + Sync>;
static DESTROY_LISTENERS: Spinlock<Vec<DestroyListener>> =
    Spinlock::new(Vec::new());

/// Allocates a job handle ready for submission. The context starts with
/// one reference (the handle's) and a default `Error` result so a handle
/// that is never run reads as failed rather than succeeded.
pub(crate) fn handle_create(
    handler: JobHandler,
    parent: JobId,
) -> Arc<Job> {
    let id = JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed));
    let job = Arc::new(Job {
        id,
        inner: Spinlock::new(JobInner {
            handler: Some(handler),
            ctx: Some(ctx::create(id, parent)),
            state: JobState::Pending,
            cancelled: false,
            destroyed: false,
            result_ready: false,
            result: JobResult::error(),
            future_count: 0,
            waiter_count: 0,
            waiters: WaitQueue::new(),
        }),
    });
    let mut jobs = JOBS.lock();
    jobs.retain(|(_, w)| w.strong_count() > 0);
    jobs.push((id, Arc::downgrade(&job)));
    job
}

fn find_by_id(id: JobId) -> Option<Arc<Job>> {
    let jobs = JOBS.lock();
    jobs.iter()
        .find(|(jid, _)| *jid == id)
        .and_then(|(_, w)| w.upgrade())
}

/// Resolves a live job handle by id.
pub(crate) fn lookup(id: JobId) -> Option<Arc<Job>> {
    if !id.is_valid() {
        return None;
    }
    find_by_id(id)
}

/// Records a completed result: first writer wins, later attempts are
/// ignored. Wakes every completion waiter.
pub(crate) fn set_result_locked(inner: &mut JobInner, result: JobResult) {
    if inner.result_ready || inner.destroyed {
        return;
    }
    inner.result = result;
    inner.result_ready = true;
    inner.state = JobState::Completed;
    if let Some(c) = &inner.ctx {
        ctx::set_completed(c, now_us());
        ctx::set_sched_state(c, CtxSchedState::Completed);
    }
    inner.waiters.wake_all(IpcResult::Ok);
}

/// Records a cancellation outcome and wakes every completion waiter.
pub(crate) fn record_cancellation_locked(inner: &mut JobInner) {
    if inner.result_ready || inner.destroyed {
        return;
    }
    inner.cancelled = true;
    inner.result = JobResult::new(JobStatus::Cancelled);
    inner.result_ready = true;
    inner.state = JobState::Completed;
    if let Some(c) = &inner.ctx {
        ctx::mark_cancelled(c);
        ctx::set_completed(c, now_us());
    }
    inner.waiters.wake_all(IpcResult::Ok);
}

/// Cancels a job that has not yet produced a result. The worker will
/// observe the flag and skip the handler if it has not started yet;
/// a handler already running is allowed to finish, but its result loses
/// to the cancellation already recorded.
pub fn cancel(job: &Arc<Job>) -> Result<(), JobError> {
    let mut inner = job.inner.lock();
    if inner.result_ready || inner.destroyed {
        return Err(JobError::State);
    }
    record_cancellation_locked(&mut inner);
    Ok(())
}

/// Cancels a job known only by id (the allocator's misuse path).
pub fn cancel_by_id(id: JobId) -> Result<(), JobError> {
    let job = find_by_id(id).ok_or(JobError::InvalidHandle)?;
    cancel(&job)
}

/// Destroys a handle once its result has been observed and no futures
/// remain attached. Releases the job's context reference, which tears
/// down the job heap if this was the last one.
pub fn handle_destroy(job: &Arc<Job>) -> Result<(), JobError> {
    let taken_ctx = {
        let mut inner = job.inner.lock();
        if inner.destroyed {
            return Err(JobError::Destroyed);
        }
        if !inner.result_ready {
            return Err(JobError::NotReady);
        }
        if inner.future_count > 0 {
            return Err(JobError::Busy);
        }
        inner.destroyed = true;
        inner.ctx.take()
    };
    drop(taken_ctx);

    JOBS.lock().retain(|(jid, _)| *jid != job.id);
    notify_destroyed(job.id);
    Ok(())
}

/// Non-blocking result query.
pub fn query_result(job: &Arc<Job>) -> Result<JobResult, JobError> {
    let inner = job.inner.lock();
    if inner.destroyed {
        return Err(JobError::InvalidHandle);
    }
    if !inner.result_ready {
        return Err(JobError::NotReady);
    }
    Ok(inner.result)
}

/// Registers a callback fired after any job handle is destroyed. Used by
/// layers that key per-job state off the job id (e.g. descriptor
/// tables).
pub fn subscribe_destroy(listener: impl Fn(JobId) + Send + Sync + 'static) {
    DESTROY_LISTENERS.lock().push(Arc::new(listener));
}

fn notify_destroyed(id: JobId) {
    // Snapshot the list so listeners can call back into the job module
    // (or register more listeners) without holding the lock.
    let listeners: Vec<DestroyListener> =
        DESTROY_LISTENERS.lock().clone();
    for listener in listeners {
        listener(id);
    }
}

// --- Policy-checked field access ---------------------------------------------

fn ctx_for_field_access(job: &Arc<Job>) -> Result<Arc<JobCtx>, CtxError> {
    let inner = job.inner.lock();
    if inner.destroyed {
        return Err(CtxError::InvalidField);
    }
    inner.ctx.clone().ok_or(CtxError::InvalidField)
}

/// Reads a context field on behalf of an observer. Private fields are
/// kernel-only and refuse the public surface.
pub fn field_get(
    job: &Arc<Job>,
    field: CtxField,
    out: &mut [u8],
) -> Result<usize, CtxError> {
    let jctx = ctx_for_field_access(job)?;
    if ctx::field_policy(field) == CtxFieldPolicy::Private {
        return Err(CtxError::NoPermission);
    }
    ctx::get_field_kernel(&jctx, field, out)
}

/// Writes a context field on behalf of the owning job. Only public
/// fields are writable, and only by the job the value belongs to.
pub fn field_set(
    job: &Arc<Job>,
    field: CtxField,
    value: &[u8],
) -> Result<(), CtxError> {
    let jctx = ctx_for_field_access(job)?;
    if ctx::field_policy(field) != CtxFieldPolicy::Public {
        return Err(CtxError::NoPermission);
    }
    if ctx::current_job_id() != job.id {
        return Err(CtxError::NoPermission);
    }
    ctx::set_field_kernel(&jctx, field, value)
}

// --- Diagnostics -------------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct JobDiagInfo {
    pub completed: bool,
    pub result_status: JobStatus,
    pub has_payload: bool,
    pub payload_size: usize,
    pub attached_futures: usize,
    pub submitted_at: u64,
    pub started_at: u64,
    pub completed_at: u64,
}

/// Copies out a job's diagnostic view.
pub fn diag_info(job: &Arc<Job>) -> Result<JobDiagInfo, JobError> {
    let (result, ready, futures, jctx) = {
        let inner = job.inner.lock();
        if inner.destroyed {
            return Err(JobError::InvalidHandle);
        }
        (
            inner.result,
            inner.result_ready,
            inner.future_count,
            inner.ctx.clone(),
        )
    };

    let mut info = JobDiagInfo {
        completed: ready,
        result_status: result.status,
        has_payload: !result.payload.is_null() && result.payload_size > 0,
        payload_size: result.payload_size,
        attached_futures: futures,
        submitted_at: 0,
        started_at: 0,
        completed_at: 0,
    };
    if let Some(jctx) = jctx {
        let mut buf = [0u8; 8];
        for (field, slot) in [
            (CtxField::SubmittedAt, &mut info.submitted_at),
            (CtxField::StartedAt, &mut info.started_at),
            (CtxField::CompletedAt, &mut info.completed_at),
        ] {
            if ctx::get_field_kernel(&jctx, field, &mut buf).is_ok() {
                *slot = u64::from_le_bytes(buf);
            }
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_handler() -> JobHandler {
        Box::new(|_| JobResult::success())
    }

    #[test]
    fn cancel_before_result_records_cancelled() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        cancel(&job).unwrap();
        let r = query_result(&job).unwrap();
        assert_eq!(r.status, JobStatus::Cancelled);
        assert!(job.is_cancelled());
        // A second cancel is a state error.
        assert_eq!(cancel(&job), Err(JobError::State));
        handle_destroy(&job).unwrap();
    }

    #[test]
    fn destroy_requires_result_and_no_futures() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        assert_eq!(handle_destroy(&job), Err(JobError::NotReady));

        {
            let mut inner = job.inner.lock();
            set_result_locked(&mut inner, JobResult::success());
        }
        {
            let mut inner = job.inner.lock();
            inner.future_count = 1;
        }
        assert_eq!(handle_destroy(&job), Err(JobError::Busy));
        job.inner.lock().future_count = 0;
        handle_destroy(&job).unwrap();
        assert_eq!(handle_destroy(&job), Err(JobError::Destroyed));
    }

    #[test]
    fn set_result_is_first_writer_wins() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        {
            let mut inner = job.inner.lock();
            set_result_locked(&mut inner, JobResult::success());
            set_result_locked(&mut inner, JobResult::error());
        }
        assert_eq!(
            query_result(&job).unwrap().status,
            JobStatus::Success
        );
        handle_destroy(&job).unwrap();
    }

    #[test]
    fn cancel_by_id_reaches_registered_jobs() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        cancel_by_id(job.id()).unwrap();
        assert!(job.is_cancelled());
        assert_eq!(
            cancel_by_id(JobId(u64::MAX - 1)),
            Err(JobError::InvalidHandle)
        );
        handle_destroy(&job).unwrap();
    }

    #[test]
    fn private_fields_refuse_public_access() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        let mut buf = [0u8; 8];
        assert_eq!(
            field_get(&job, CtxField::InternalRefcount, &mut buf),
            Err(CtxError::NoPermission)
        );
        // Protected fields are readable.
        assert!(field_get(&job, CtxField::Uid, &mut buf[..4]).is_ok());
        // But not writable from outside the job.
        assert_eq!(
            field_set(&job, CtxField::Cwd, b"/x"),
            Err(CtxError::NoPermission)
        );
        cancel(&job).unwrap();
        handle_destroy(&job).unwrap();
    }

    #[test]
    fn field_set_requires_matching_current_ctx() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        let jctx = job.context().unwrap();
        ctx::set_current(Some(jctx));
        assert!(field_set(&job, CtxField::Cwd, b"/data").is_ok());
        let mut buf = [0u8; 16];
        let n = field_get(&job, CtxField::Cwd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"/data\0");
        ctx::set_current(None);
        cancel(&job).unwrap();
        handle_destroy(&job).unwrap();
    }

    #[test]
    fn diag_info_reports_timing_and_futures() {
        let job = handle_create(idle_handler(), JobId::INVALID);
        let info = diag_info(&job).unwrap();
        assert!(!info.completed);
        assert!(info.submitted_at > 0);
        assert_eq!(info.started_at, 0);
        cancel(&job).unwrap();
        let info = diag_info(&job).unwrap();
        assert!(info.completed);
        assert_eq!(info.result_status, JobStatus::Cancelled);
        assert!(info.completed_at >= info.submitted_at);
        handle_destroy(&job).unwrap();
    }
}
