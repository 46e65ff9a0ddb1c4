// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The job subsystem: handles, queues, workers, and futures.
//!
//! A *job* is one submitted unit of work: a handler plus the context it
//! runs under. Jobs flow through bounded queues serviced by worker tasks;
//! completion is observed through futures (or the wait-for-job shims
//! built on them) and can be preempted by cancellation at any point
//! before a result is recorded.

mod future;
mod handle;
mod queue;
mod worker;

pub use future::{
    try_wait_for_job, wait_for_job, wait_for_job_timed, Future,
};
pub use handle::{
    cancel, cancel_by_id, diag_info, field_get, field_set, handle_destroy,
    query_result, subscribe_destroy, Job, JobDiagInfo, JobHandler,
    JobResult,
};
pub(crate) use handle::lookup;
pub use queue::{JobQueue, JobStats, QueueConfig, QueueInfo};
