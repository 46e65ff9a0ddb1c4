// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! Boot code calls [`kernel_init`] exactly once after the platform is
//! alive: allocator, scheduler, VFS, and the ELF export table come up in
//! that order, an optional root filesystem is mounted, and -- when
//! autostart is enabled -- a single-worker queue is created whose one
//! job runs the init applet in a loop with a one second backoff between
//! exits.

use std::sync::{Arc, OnceLock};

use abi::JobStatus;

use crate::config::{ELF_INIT_PATH, WORKER_STACK_SIZE};
use crate::elf;
use crate::job::{JobQueue, JobResult, QueueConfig};
use crate::mem;
use crate::sched;
use crate::vfs::{self, FilesystemOps};

/// What to bring up beyond the always-on subsystems.
#[derive(Default)]
pub struct BootOptions {
    pub mount_root: Option<Arc<dyn FilesystemOps>>,
    pub autostart: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    SubsystemsUp,
    RootMounted,
    InitExited { rc: i32 },
    InitLoadFailed(i32),
}

ringbuf::ringbuf!(BOOT_TRACE, Trace, 16, Trace::None);

/// Brings the kernel up. Idempotent per subsystem, so a second call is
/// harmless (and useful to tests), but the intended shape is one call
/// from the platform entry point.
pub fn kernel_init(options: BootOptions) {
    mem::init();
    sched::init();
    vfs::init();
    elf::symbol::populate_libc_exports();
    ringbuf::ringbuf_entry!(BOOT_TRACE, Trace::SubsystemsUp);

    if let Some(fs) = options.mount_root {
        vfs::mount_root(fs);
        ringbuf::ringbuf_entry!(BOOT_TRACE, Trace::RootMounted);
    }

    if options.autostart {
        autostart_init();
    }
}

static INIT_QUEUE: OnceLock<Option<Arc<JobQueue>>> = OnceLock::new();

/// The long-lived init job: run the configured applet, restart it when
/// it exits, back off a second between runs, stop only on cancellation.
fn init_job(job: &Arc<crate::job::Job>) -> JobResult {
    loop {
        if job.is_cancelled() {
            break;
        }
        match elf::run_file(ELF_INIT_PATH, &["init"]) {
            Ok(rc) => {
                ringbuf::ringbuf_entry!(
                    BOOT_TRACE,
                    Trace::InitExited { rc }
                );
            }
            Err(e) => {
                ringbuf::ringbuf_entry!(
                    BOOT_TRACE,
                    Trace::InitLoadFailed(e.errno())
                );
            }
        }
        sched::sleep_ms(1000);
    }
    JobResult::new(JobStatus::Cancelled)
}

fn autostart_init() {
    let _ = INIT_QUEUE.get_or_init(|| {
        let config = QueueConfig {
            capacity: 1,
            worker_count: 1,
            stack_bytes: WORKER_STACK_SIZE,
            ..QueueConfig::new("init")
        };
        // A failed bring-up leaves the system running without userland,
        // which is still more diagnosable than a panic.
        let queue = JobQueue::create(&config).ok()?;
        let _ = queue.submit(Box::new(init_job));
        Some(queue)
    });
}

/// The init queue, if autostart created one. Diagnostics only.
pub fn init_queue() -> Option<&'static Arc<JobQueue>> {
    INIT_QUEUE.get().and_then(|q| q.as_ref())
}
