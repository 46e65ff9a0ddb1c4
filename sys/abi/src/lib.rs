// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applet-facing
//! surfaces.
//!
//! Everything in here is a plain value type: identifiers, state enums,
//! result codes, flag sets, and the errno constants the libc shim reports.
//! The kernel proper lives in the `kern` crate; this crate exists so that
//! diagnostic tools and applet support code can speak the kernel's types
//! without dragging in the kernel itself.

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayString;

/// Names one submitted job.
///
/// Job ids are assigned from a monotonic counter starting at 1; they are
/// never reused within a boot, and `JobId::INVALID` (zero) never names a
/// live job. The system context -- the implicit owner of kernel-side
/// allocations made outside any job -- carries `INVALID` as its id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Names one task registered with the scheduler.
///
/// Ids are monotonic and skip `INVALID` on wrap, so a zero id always means
/// "no task."
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero, and numerically
/// *greater* priorities are more important (the convention of the
/// underlying task substrate). This type deliberately does not implement
/// `PartialOrd`/`Ord`, to keep us from confusing ourselves on whether `>`
/// means more important or merely numerically greater.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u32);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Scheduler-visible lifecycle state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Suspended,
    Terminated,
}

/// Why a task is parked in `Waiting` state, for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum WaitReason {
    #[default]
    None,
    Event,
    Job,
    Delay,
    Io,
}

bitflags::bitflags! {
    /// Flags supplied at task creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct TaskFlags: u32 {
        /// Task is a job-queue worker; the scheduler fires the worker
        /// lifecycle hooks around its entry function.
        const WORKER = 1 << 0;
    }
}

/// Outcome of a blocking wait, as seen by the scheduler bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    Ok,
    Timeout,
    ObjectDestroyed,
    Shutdown,
}

/// Outcome of a blocking wait, as seen by IPC primitives (wait queues,
/// futures, file waits).
///
/// The mapping between this and [`WaitResult`] is total in both directions;
/// the two `From` impls below are the single source of truth for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpcResult {
    Ok,
    Timeout,
    ObjectDestroyed,
    Shutdown,
}

impl From<WaitResult> for IpcResult {
    fn from(r: WaitResult) -> Self {
        match r {
            WaitResult::Ok => IpcResult::Ok,
            WaitResult::Timeout => IpcResult::Timeout,
            WaitResult::ObjectDestroyed => IpcResult::ObjectDestroyed,
            WaitResult::Shutdown => IpcResult::Shutdown,
        }
    }
}

impl From<IpcResult> for WaitResult {
    fn from(r: IpcResult) -> Self {
        match r {
            IpcResult::Ok => WaitResult::Ok,
            IpcResult::Timeout => WaitResult::Timeout,
            IpcResult::ObjectDestroyed => WaitResult::ObjectDestroyed,
            IpcResult::Shutdown => WaitResult::Shutdown,
        }
    }
}

/// Status recorded in a job's result descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Success,
    Error,
    Cancelled,
}

/// Lifecycle state of a job handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
}

/// Errors returned by job subsystem calls.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobError {
    InvalidParam,
    InvalidHandle,
    NoMemory,
    QueueFull,
    Timeout,
    Destroyed,
    State,
    Shutdown,
    NotReady,
    Busy,
}

/// Result codes from future wait operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FutureWait {
    Ok,
    Timeout,
    NotReady,
    Destroyed,
    Shutdown,
}

impl From<IpcResult> for FutureWait {
    fn from(r: IpcResult) -> Self {
        match r {
            IpcResult::Ok => FutureWait::Ok,
            IpcResult::Timeout => FutureWait::Timeout,
            IpcResult::ObjectDestroyed => FutureWait::Destroyed,
            IpcResult::Shutdown => FutureWait::Shutdown,
        }
    }
}

/// Scheduler-facing progression of a job context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CtxSchedState {
    Pending,
    Running,
    Completed,
    Canceled,
}

/// Identifies one field of a job context for table-driven access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CtxField {
    JobId,
    ParentJobId,
    Uid,
    Gid,
    Euid,
    Egid,
    Cwd,
    TraceId,
    SubmittedAt,
    StartedAt,
    CompletedAt,
    Deadline,
    PriorityHint,
    UserAttrKey(usize),
    UserAttrValue(usize),
    InternalCancelled,
    InternalSchedState,
    InternalRefcount,
    TlsSlotValue(usize),
    TlsSlotDestructor(usize),
}

/// Access policy attached to each context field.
///
/// `Public` fields may be written by the owning job; `Protected` fields are
/// kernel-writable but readable through the public API; `Private` fields
/// are kernel-only in both directions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CtxFieldPolicy {
    Private,
    Protected,
    Public,
}

/// Wire representation of a context field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CtxFieldKind {
    /// Fixed-size value, copied exactly.
    Raw,
    /// NUL-terminated string in a fixed buffer; partial writes are padded
    /// with zeros.
    String,
}

/// Errors from context field access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CtxError {
    InvalidParam,
    InvalidField,
    BufferTooSmall,
    NoPermission,
}

/// Errors surfaced by the VFS layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VfsError {
    InvalidParam,
    InvalidPath,
    NotFound,
    NotSupported,
    NoMemory,
    TooManyEntries,
    Busy,
    Interrupted,
    WouldBlock,
    Timeout,
    Io,
    Destroyed,
}

impl VfsError {
    /// Maps a VFS error to the errno the libc shim reports for it.
    pub fn errno(self) -> i32 {
        match self {
            VfsError::InvalidParam | VfsError::InvalidPath => EINVAL,
            VfsError::NotFound => ENOENT,
            VfsError::NotSupported => ENOTSUP,
            VfsError::NoMemory => ENOMEM,
            VfsError::TooManyEntries => EMFILE,
            VfsError::Busy => EBUSY,
            VfsError::Interrupted => EINTR,
            VfsError::WouldBlock => EAGAIN,
            VfsError::Timeout => ETIMEDOUT,
            VfsError::Io => EIO,
            VfsError::Destroyed => EBADF,
        }
    }
}

/// Kind of a VFS node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeType {
    File,
    Directory,
    Device,
}

/// Attribute record returned by `getattr`-style operations.
#[derive(Copy, Clone, Debug)]
pub struct VfsStat {
    pub node_type: NodeType,
    pub size: u64,
    /// Modification time in microseconds of kernel time.
    pub mtime: u64,
    pub mode: u32,
}

/// Maximum length of one directory entry name.
pub const DIRENT_NAME_MAX: usize = 64;

/// One directory entry, as produced by `readdir`.
#[derive(Clone, Debug)]
pub struct VfsDirent {
    pub name: ArrayString<DIRENT_NAME_MAX>,
    pub node_type: NodeType,
}

bitflags::bitflags! {
    /// Poll readiness events, shared between the libc shim and the VFS.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct PollEvents: u32 {
        const POLLIN = 1 << 0;
        const POLLOUT = 1 << 1;
        const POLLERR = 1 << 2;
        const POLLHUP = 1 << 3;
    }
}

bitflags::bitflags! {
    /// `open(2)`-style flags, with the values the applet toolchain's libc
    /// headers use.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0x0001;
        const O_RDWR = 0x0002;
        const O_APPEND = 0x0008;
        const O_CREAT = 0x0200;
        const O_TRUNC = 0x0400;
        const O_EXCL = 0x0800;
    }
}

impl OpenFlags {
    /// `O_RDONLY` is the absence of the write bits, not a bit of its own.
    pub fn is_read_only(self) -> bool {
        !self.intersects(Self::O_WRONLY | Self::O_RDWR)
    }
}

/// Seek origin for `lseek`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

// Errno values, matching the newlib headers the applet toolchain compiles
// against.
pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const EMFILE: i32 = 24;
pub const ENOTTY: i32 = 25;
pub const ESPIPE: i32 = 29;
pub const ENOSYS: i32 = 88;
pub const ETIMEDOUT: i32 = 116;
pub const ENOTSUP: i32 = 134;
pub const ECANCELED: i32 = 140;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_wait_mapping_is_bidirectional() {
        for w in [
            WaitResult::Ok,
            WaitResult::Timeout,
            WaitResult::ObjectDestroyed,
            WaitResult::Shutdown,
        ] {
            assert_eq!(WaitResult::from(IpcResult::from(w)), w);
        }
    }

    #[test]
    fn priority_ordering_follows_substrate_convention() {
        assert!(Priority(3).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(1)));
    }

    #[test]
    fn vfs_errno_map_matches_table() {
        assert_eq!(VfsError::NotFound.errno(), ENOENT);
        assert_eq!(VfsError::Destroyed.errno(), EBADF);
        assert_eq!(VfsError::WouldBlock.errno(), EAGAIN);
        assert_eq!(VfsError::TooManyEntries.errno(), EMFILE);
    }

    #[test]
    fn rdonly_is_absence_of_write_bits() {
        assert!(OpenFlags::empty().is_read_only());
        assert!(!OpenFlags::O_RDWR.is_read_only());
        assert!(!OpenFlags::O_WRONLY.is_read_only());
        assert!(OpenFlags::O_CREAT.is_read_only());
    }
}
