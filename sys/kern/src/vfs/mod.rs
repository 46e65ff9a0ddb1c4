// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VFS: refcounted node/file objects, per-job descriptor tables, and
//! the dispatch layer that routes calls into a mounted filesystem.
//!
//! Concrete filesystems live behind [`FilesystemOps`]. The kernel keeps
//! exactly one mount (the root); multiple-mount resolution is a driver
//! concern, not a kernel one.

pub mod fd;
pub mod object;
pub mod path;
pub mod ramfs;

use std::sync::{Arc, Once};

use abi::{
    IpcResult, JobId, NodeType, OpenFlags, PollEvents, VfsDirent, VfsError,
    VfsStat, WaitReason,
};

use crate::ctx;
use crate::job;
use crate::port::Spinlock;
use crate::time::Deadline;

pub use object::{File, Node};

/// Operations a filesystem driver provides. Paths handed to the driver
/// are absolute and normalized.
pub trait FilesystemOps: Send + Sync {
    /// Resolves an existing path to a node.
    fn lookup(&self, path: &str) -> Result<Arc<Node>, VfsError>;

    /// Opens (and possibly creates or truncates) a path.
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Arc<Node>, VfsError>;

    fn getattr(&self, node: &Node) -> Result<VfsStat, VfsError>;

    fn read(
        &self,
        file: &File,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, VfsError>;

    fn write(
        &self,
        file: &File,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, VfsError>;

    /// Reads directory entries starting at entry index `index`.
    fn readdir(
        &self,
        file: &File,
        index: usize,
        out: &mut [VfsDirent],
    ) -> Result<usize, VfsError>;

    fn unlink(&self, path: &str) -> Result<(), VfsError>;

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), VfsError>;

    fn ioctl(
        &self,
        _file: &File,
        _request: u64,
        _arg: usize,
    ) -> Result<(), VfsError> {
        Err(VfsError::NotSupported)
    }

    /// Reports which of `events` are ready on `file` right now.
    fn poll(
        &self,
        _file: &File,
        _events: PollEvents,
    ) -> Result<PollEvents, VfsError> {
        Err(VfsError::NotSupported)
    }

    /// Hook fired when the last node reference drops.
    fn node_destroy(&self, _node: &Node) {}

    /// Hook fired when the last file reference drops.
    fn file_destroy(&self, _file: &File) {}
}

static ROOT: Spinlock<Option<Arc<dyn FilesystemOps>>> = Spinlock::new(None);

/// One-shot VFS bring-up: hooks descriptor-table reaping to job handle
/// destruction.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        job::subscribe_destroy(fd::drop_job_table);
    });
}

/// Installs the root filesystem.
pub fn mount_root(fs: Arc<dyn FilesystemOps>) {
    *ROOT.lock() = Some(fs);
}

fn root() -> Result<Arc<dyn FilesystemOps>, VfsError> {
    ROOT.lock().clone().ok_or(VfsError::NotFound)
}

/// Absolute, normalized form of `path` for `job`, applying the job's
/// working directory to relative paths.
fn absolute_for(job: JobId, path: &str) -> Result<String, VfsError> {
    if path.starts_with('/') {
        return path::normalize(path).ok_or(VfsError::InvalidPath);
    }
    let cwd = job_cwd(job);
    path::join_and_normalize(&cwd, path).ok_or(VfsError::InvalidPath)
}

fn job_cwd(job: JobId) -> String {
    let jctx = if ctx::current_job_id() == job {
        ctx::current()
    } else {
        job::lookup(job).and_then(|j| j.context())
    };
    jctx.map(|c| ctx::cwd(&c).as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Opens `path` for `job` and installs a descriptor.
pub fn open(
    job: JobId,
    path: &str,
    flags: OpenFlags,
) -> Result<i32, VfsError> {
    let abs = absolute_for(job, path)?;
    let fs = root()?;
    let node = fs.open(&abs, flags)?;
    let file = object::file_create(&node);
    // The node reference moved into the file.
    object::node_release(&node);

    if flags.contains(OpenFlags::O_APPEND) {
        if let Ok(st) = fs.getattr(&node) {
            object::file_set_offset(&file, st.size);
        }
    }

    match fd::install(job, file.clone()) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            object::file_release(&file);
            Err(e)
        }
    }
}

/// Closes a descriptor, dropping the table's file reference.
pub fn close(job: JobId, fd: i32) -> Result<(), VfsError> {
    let file = fd::remove(job, fd).ok_or(VfsError::Destroyed)?;
    object::file_mark_closed(&file);
    object::file_release(&file);
    Ok(())
}

pub fn read(
    job: JobId,
    fd: i32,
    buf: &mut [u8],
) -> Result<usize, VfsError> {
    let file = fd::lookup(job, fd).ok_or(VfsError::Destroyed)?;
    let offset = object::file_offset(&file);
    let n = file.node().fs().read(&file, offset, buf)?;
    object::file_set_offset(&file, offset + n as u64);
    object::file_release(&file);
    Ok(n)
}

pub fn write(
    job: JobId,
    fd: i32,
    buf: &[u8],
) -> Result<usize, VfsError> {
    let file = fd::lookup(job, fd).ok_or(VfsError::Destroyed)?;
    let offset = object::file_offset(&file);
    let n = file.node().fs().write(&file, offset, buf)?;
    object::file_set_offset(&file, offset + n as u64);
    object::file_release(&file);
    Ok(n)
}

/// Reads directory entries through a directory descriptor; the file
/// offset is the entry cursor.
pub fn readdir(
    job: JobId,
    fd: i32,
    out: &mut [VfsDirent],
) -> Result<usize, VfsError> {
    let file = fd::lookup(job, fd).ok_or(VfsError::Destroyed)?;
    let index = object::file_offset(&file) as usize;
    let n = file.node().fs().readdir(&file, index, out)?;
    object::file_set_offset(&file, (index + n) as u64);
    object::file_release(&file);
    Ok(n)
}

pub fn stat(job: JobId, path: &str) -> Result<VfsStat, VfsError> {
    let abs = absolute_for(job, path)?;
    let fs = root()?;
    let node = fs.lookup(&abs)?;
    let result = fs.getattr(&node);
    object::node_release(&node);
    result
}

pub fn fstat(job: JobId, fd: i32) -> Result<VfsStat, VfsError> {
    let file = fd::lookup(job, fd).ok_or(VfsError::Destroyed)?;
    let result = file.node().fs().getattr(file.node());
    object::file_release(&file);
    result
}

pub fn unlink(job: JobId, path: &str) -> Result<(), VfsError> {
    let abs = absolute_for(job, path)?;
    root()?.unlink(&abs)
}

pub fn mkdir(job: JobId, path: &str, mode: u32) -> Result<(), VfsError> {
    let abs = absolute_for(job, path)?;
    root()?.mkdir(&abs, mode)
}

/// Changes the job's working directory after validating the target is an
/// existing directory.
pub fn chdir(job: JobId, path: &str) -> Result<(), VfsError> {
    let abs = absolute_for(job, path)?;
    let fs = root()?;
    let node = fs.lookup(&abs)?;
    let st = fs.getattr(&node);
    object::node_release(&node);
    let st = st?;
    if st.node_type != NodeType::Directory {
        return Err(VfsError::InvalidPath);
    }

    let jctx = if ctx::current_job_id() == job {
        ctx::current()
    } else {
        job::lookup(job).and_then(|j| j.context())
    };
    let jctx = jctx.ok_or(VfsError::InvalidParam)?;
    ctx::set_cwd(&jctx, &abs).map_err(|_| VfsError::InvalidPath)
}

pub fn getcwd(job: JobId) -> Result<String, VfsError> {
    Ok(job_cwd(job))
}

pub fn dup(job: JobId, oldfd: i32) -> Result<i32, VfsError> {
    fd::dup(job, oldfd)
}

pub fn dup2(job: JobId, oldfd: i32, newfd: i32) -> Result<(), VfsError> {
    fd::dup2(job, oldfd, newfd)
}

pub fn ioctl(
    job: JobId,
    fd: i32,
    request: u64,
    arg: usize,
) -> Result<(), VfsError> {
    let file = fd::lookup(job, fd).ok_or(VfsError::Destroyed)?;
    let result = file.node().fs().ioctl(&file, request, arg);
    object::file_release(&file);
    result
}

/// One entry in a poll set.
#[derive(Copy, Clone, Debug)]
pub struct PollFd {
    pub fd: i32,
    pub events: PollEvents,
    pub revents: PollEvents,
}

/// Polls a descriptor set: evaluates readiness, and if nothing is ready,
/// parks on the first pollable file's wait queue until an event or the
/// deadline. Returns the number of ready entries.
pub fn poll(
    job: JobId,
    fds: &mut [PollFd],
    deadline: Option<&Deadline>,
) -> Result<usize, VfsError> {
    loop {
        let mut ready = 0;
        let mut first_file: Option<Arc<File>> = None;
        for pfd in fds.iter_mut() {
            pfd.revents = PollEvents::empty();
            let Some(file) = fd::lookup(job, pfd.fd) else {
                pfd.revents = PollEvents::POLLERR;
                ready += 1;
                continue;
            };
            match file.node().fs().poll(&file, pfd.events) {
                Ok(revents) => {
                    let masked =
                        revents & (pfd.events | PollEvents::POLLERR
                            | PollEvents::POLLHUP);
                    if !masked.is_empty() {
                        pfd.revents = masked;
                        ready += 1;
                    }
                }
                Err(VfsError::NotSupported) => {
                    // Not pollable: report ready-for-anything like a
                    // plain file.
                    pfd.revents = pfd.events;
                    if !pfd.events.is_empty() {
                        ready += 1;
                    }
                }
                Err(e) => {
                    object::file_release(&file);
                    if let Some(f) = first_file {
                        object::file_release(&f);
                    }
                    return Err(e);
                }
            }
            if first_file.is_none() {
                first_file = Some(file);
            } else {
                object::file_release(&file);
            }
        }

        let expired = deadline.map(|d| d.to_ticks() == 0).unwrap_or(false);
        if ready > 0 || expired || first_file.is_none() {
            if let Some(f) = first_file {
                object::file_release(&f);
            }
            return Ok(ready);
        }

        // Park on the first file until someone signals an event.
        let file = match first_file {
            Some(f) => f,
            None => return Ok(0),
        };
        let result = object::file_wait(&file, WaitReason::Io, deadline);
        object::file_release(&file);
        match result {
            IpcResult::Ok => continue,
            IpcResult::Timeout => return Ok(0),
            IpcResult::ObjectDestroyed | IpcResult::Shutdown => {
                return Err(VfsError::Destroyed)
            }
        }
    }
}
