// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! These are deliberately constants rather than runtime settings: the
//! kernel takes a single shape per build, and code elsewhere is free to
//! size arrays and reject parameters against these values without
//! rechecking them.

/// Granularity of per-job heap growth, in bytes. Every region requested
/// from the platform allocator is this size.
pub const REGION_SIZE: usize = 16 * 1024;

/// Upper bound on regions a single job may hold.
pub const MAX_REGIONS_PER_JOB: usize = 8;

/// Upper bound on total region bytes a single job may hold.
pub const MAX_HEAP_PER_JOB: usize = 128 * 1024;

/// Alignment of every allocator payload and block header.
pub const ALLOC_ALIGN: usize = 16;

/// Bounds on job queue geometry.
pub const QUEUE_CAPACITY_MAX: usize = 64;
pub const QUEUE_WORKER_COUNT_MAX: usize = 8;

/// Host stack size for worker tasks, in bytes.
pub const WORKER_STACK_SIZE: usize = 256 * 1024;

/// Default priority for worker tasks.
pub const WORKER_PRIORITY: u32 = 2;

/// String field bounds. All are storage sizes including the NUL the C side
/// of the ABI expects, so the longest representable string is one less.
pub const QUEUE_NAME_MAX_LEN: usize = 16;
pub const TASK_NAME_MAX_LEN: usize = 16;
pub const TASK_TAG_MAX_LEN: usize = 16;
pub const CWD_MAX_LEN: usize = 128;
pub const ATTR_KEY_MAX_LEN: usize = 16;
pub const ATTR_VALUE_MAX_LEN: usize = 32;

/// Number of user attribute pairs on a job context.
pub const USER_ATTR_MAX: usize = 4;

/// Number of TLS slots on a job context.
pub const TLS_SLOT_COUNT: usize = 4;

/// Per-job file descriptor table size. Descriptors 0-2 are reserved for
/// the console and never occupy table slots.
pub const MAX_FDS_PER_JOB: usize = 16;

/// Longest path the VFS will accept, after normalization.
pub const PATH_MAX_LEN: usize = 128;

/// Bounds on the ELF loader's tracking tables.
pub const ELF_MAX_SEGMENTS: usize = 8;
pub const ELF_MAX_TRACKED_ALLOCS: usize = 8;

/// Path the autostart job loads in a loop.
pub const ELF_INIT_PATH: &str = "/bin/init";

/// Whether the kernel libc export set is registered for ELF symbol
/// resolution at startup.
pub const EXPORT_LIBC_TO_ELF: bool = true;

static_assertions::const_assert!(MAX_REGIONS_PER_JOB >= 4);
static_assertions::const_assert!(MAX_HEAP_PER_JOB >= 65536);
static_assertions::const_assert!(ALLOC_ALIGN.is_power_of_two());
