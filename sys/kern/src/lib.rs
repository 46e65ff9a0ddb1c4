// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Magnolia kernel.
//!
//! This crate contains the kernel core of the Magnolia runtime: the job
//! subsystem, the per-job region allocator, the scheduler bridge, the VFS
//! object layer, the ELF applet loader, and the libc compatibility shim.
//! Userland applets and filesystem drivers live outside this crate and
//! reach the kernel through the surfaces defined here.
//!
//! # Design principles
//!
//! 1. The environment provides the concurrency substrate -- a cooperative
//!    task primitive, a binary semaphore, a critical section, and a
//!    monotonic microsecond clock -- and everything above it is portable.
//!    The `port` module is the only place that knows what the substrate is
//!    made of.
//! 2. Every job owns its memory. Allocations made while a job context is
//!    current come from that job's region heap, misuse is detected at the
//!    block header, and the whole heap is reclaimed when the last
//!    reference to the context drops.
//! 3. A strong preference for simple and clear algorithms over fast and
//!    clever algorithms. Wait queues are scanned, not indexed; the
//!    allocator is first-fit; nothing here is on a fast path that would
//!    justify the alternative.

pub mod config;
pub mod ctx;
pub mod elf;
pub mod err;
pub mod ipc;
pub mod job;
pub mod libc;
pub mod mem;
pub mod port;
pub mod sched;
pub mod startup;
pub mod time;
pub mod vfs;

#[cfg(test)]
pub(crate) mod test_support;
