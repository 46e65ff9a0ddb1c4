// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking file waits across tasks.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use abi::{IpcResult, JobId, OpenFlags, PollEvents, WaitReason};
use kern::startup::{self, BootOptions};
use kern::time::Deadline;
use kern::vfs::{self, object, ramfs::RamFs, PollFd};

fn boot() -> &'static Arc<RamFs> {
    static FS: OnceLock<Arc<RamFs>> = OnceLock::new();
    FS.get_or_init(|| {
        let fs = RamFs::new();
        startup::kernel_init(BootOptions {
            mount_root: Some(fs.clone()),
            autostart: false,
        });
        fs
    })
}

/// A waiter parked on a file with a generous deadline is released within
/// milliseconds by a notify from another task.
#[test]
fn file_wait_released_by_notify_event() {
    let fs = boot();
    fs.add_file("/dev-event", b"").unwrap();

    let job = JobId::INVALID;
    let fd = vfs::open(job, "/dev-event", OpenFlags::empty()).unwrap();
    let file = vfs::fd::lookup(job, fd).unwrap();

    let f2 = file.clone();
    let waiter = std::thread::spawn(move || {
        let deadline = Deadline::from_relative(5_000_000);
        let started = Instant::now();
        let result =
            object::file_wait(&f2, WaitReason::Io, Some(&deadline));
        (result, started.elapsed())
    });

    std::thread::sleep(Duration::from_millis(20));
    object::file_notify_event(&file);

    let (result, elapsed) = waiter.join().unwrap();
    assert_eq!(result, IpcResult::Ok);
    assert!(
        elapsed < Duration::from_secs(1),
        "wait should end promptly, took {elapsed:?}"
    );

    object::file_release(&file);
    vfs::close(job, fd).unwrap();
}

/// Poll falls through immediately for ready files and honors timeouts
/// for descriptors that report no readiness.
#[test]
fn poll_reports_ready_files_immediately() {
    let fs = boot();
    fs.add_file("/pollable", b"data").unwrap();
    let job = JobId(0x9900);
    let fd = vfs::open(job, "/pollable", OpenFlags::empty()).unwrap();

    let mut fds = [PollFd {
        fd,
        events: PollEvents::POLLIN,
        revents: PollEvents::empty(),
    }];
    let ready = vfs::poll(job, &mut fds, None).unwrap();
    assert_eq!(ready, 1);
    assert!(fds[0].revents.contains(PollEvents::POLLIN));

    vfs::close(job, fd).unwrap();
}

/// Closing a waited-on file fails the waiter instead of leaving it
/// parked.
#[test]
fn file_teardown_fails_parked_waiters() {
    let fs = boot();
    fs.add_file("/dev-dying", b"").unwrap();
    let job = JobId(0x9901);
    let fd = vfs::open(job, "/dev-dying", OpenFlags::empty()).unwrap();
    let file = vfs::fd::lookup(job, fd).unwrap();

    let f2 = file.clone();
    let waiter = std::thread::spawn(move || {
        object::file_wait(&f2, WaitReason::Io, None)
    });
    std::thread::sleep(Duration::from_millis(20));

    // Drop the descriptor's reference and ours; the last release marks
    // the file destroyed and wakes the waiter with OBJECT_DESTROYED.
    vfs::close(job, fd).unwrap();
    object::file_release(&file);

    assert_eq!(waiter.join().unwrap(), IpcResult::ObjectDestroyed);
}

/// Waits against an already-closed file are rejected up front.
#[test]
fn wait_on_closed_file_is_rejected() {
    let fs = boot();
    fs.add_file("/dev-closed", b"").unwrap();
    let job = JobId(0x9902);
    let fd = vfs::open(job, "/dev-closed", OpenFlags::empty()).unwrap();
    let file = vfs::fd::lookup(job, fd).unwrap();
    vfs::close(job, fd).unwrap();

    assert_eq!(
        object::file_wait(&file, WaitReason::Io, None),
        IpcResult::ObjectDestroyed
    );
    object::file_release(&file);
}
