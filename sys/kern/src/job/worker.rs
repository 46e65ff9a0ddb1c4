// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker task logic and scheduler hooks for the job subsystem.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once};

use abi::{CtxSchedState, JobStatus, TaskId};

use crate::ctx;
use crate::job::handle::{
    record_cancellation_locked, set_result_locked, Job, JobResult,
};
use crate::job::queue::{lookup_queue, JobQueue};
use crate::port::TaskKill;
use crate::sched::{self, TaskInfo, WaitContext};
use crate::time::now_us;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    WorkerStarted(TaskId),
    WorkerStopped(TaskId),
    HandlerPanicked(TaskId),
}

ringbuf::ringbuf!(WORKER_TRACE, Trace, 32, Trace::None);

fn hook_start(info: &TaskInfo) {
    let Some(queue) = lookup_queue(info.user_data) else {
        return;
    };
    queue.inner.lock().active_workers += 1;
    if queue.debug_log {
        ringbuf::ringbuf_entry!(WORKER_TRACE, Trace::WorkerStarted(info.id));
    }
}

fn hook_stop(info: &TaskInfo) {
    let Some(queue) = lookup_queue(info.user_data) else {
        return;
    };
    let mut g = queue.inner.lock();
    if g.active_workers > 0 {
        g.active_workers -= 1;
    }
    drop(g);
    if queue.debug_log {
        ringbuf::ringbuf_entry!(WORKER_TRACE, Trace::WorkerStopped(info.id));
    }
}

/// Registers the worker lifecycle hooks with the scheduler, once per
/// process.
pub(crate) fn register_scheduler_hooks() {
    static REGISTERED: Once = Once::new();
    REGISTERED.call_once(|| {
        sched::register_worker_hooks(Some(sched::WorkerHooks {
            on_start: hook_start,
            on_stop: hook_stop,
        }));
    });
}

/// Runs the handler, converting a handler panic into an error result. A
/// kill unwind from task destruction is not a handler failure and keeps
/// propagating.
fn run_handler(
    job: &Arc<Job>,
    handler: crate::job::handle::JobHandler,
) -> JobResult {
    match catch_unwind(AssertUnwindSafe(|| handler(job))) {
        Ok(result) => result,
        Err(payload) => {
            if payload.is::<TaskKill>() {
                resume_unwind(payload);
            }
            let id = sched::current_task()
                .map(|t| t.id())
                .unwrap_or(TaskId::INVALID);
            ringbuf::ringbuf_entry!(
                WORKER_TRACE,
                Trace::HandlerPanicked(id)
            );
            JobResult::error()
        }
    }
}

/// Worker task body: take, run (or record the cancellation), repeat until
/// the queue goes away.
pub(crate) fn worker_entry(queue: Arc<JobQueue>) {
    let wait = Arc::new(WaitContext::new());
    loop {
        let job = match queue.take(&wait) {
            Ok(job) => job,
            Err(_) => break,
        };

        let (should_run, jctx, handler) = {
            let mut inner = job.inner.lock();
            if !inner.cancelled && !inner.result_ready {
                inner.state = abi::JobState::Running;
                (true, inner.ctx.clone(), inner.handler.take())
            } else {
                (false, None, None)
            }
        };

        if should_run {
            if let Some(jctx) = &jctx {
                ctx::set_started(jctx, now_us());
                ctx::set_sched_state(jctx, CtxSchedState::Running);
                ctx::set_current(Some(jctx.clone()));
            }

            let result = match handler {
                Some(handler) => run_handler(&job, handler),
                None => JobResult::error(),
            };
            queue.note_executed(result.status != JobStatus::Success);
            {
                let mut inner = job.inner.lock();
                set_result_locked(&mut inner, result);
            }

            ctx::set_current(None);
        } else {
            let mut inner = job.inner.lock();
            record_cancellation_locked(&mut inner);
        }
    }
}
