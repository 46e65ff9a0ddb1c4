// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel subsystems keep their own error enums (mostly in `abi`); the one
//! thing they share is the errno-flavored result ABI that applets and the
//! libc shim see. `ToErrno` is that seam: every kernel error that can
//! escape to an applet knows which errno it reports.

use abi::{
    CtxError, JobError, VfsError, EAGAIN, EBADF, EBUSY, ECANCELED, EINVAL,
    ENOMEM, EPERM, ETIMEDOUT,
};

/// Conversion from a kernel error to the errno the applet surface reports.
pub trait ToErrno {
    fn errno(&self) -> i32;
}

impl ToErrno for JobError {
    fn errno(&self) -> i32 {
        match self {
            JobError::InvalidParam | JobError::InvalidHandle => EINVAL,
            JobError::NoMemory => ENOMEM,
            JobError::QueueFull => EAGAIN,
            JobError::Timeout => ETIMEDOUT,
            JobError::Destroyed | JobError::Shutdown => EBADF,
            JobError::State | JobError::NotReady => EBUSY,
            JobError::Busy => EBUSY,
        }
    }
}

impl ToErrno for CtxError {
    fn errno(&self) -> i32 {
        match self {
            CtxError::InvalidParam | CtxError::InvalidField => EINVAL,
            CtxError::BufferTooSmall => EINVAL,
            CtxError::NoPermission => EPERM,
        }
    }
}

impl ToErrno for VfsError {
    fn errno(&self) -> i32 {
        VfsError::errno(*self)
    }
}

/// Marker used in a few result paths to say "the owning job was cancelled
/// while we were working."
pub const CANCELED_ERRNO: i32 = ECANCELED;
