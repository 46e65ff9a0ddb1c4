// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The target-environment port.
//!
//! The kernel assumes the environment provides four things: a cooperative
//! task primitive, a binary counting semaphore, a short-held critical
//! section, and a monotonic microsecond clock. This module is the only
//! place that knows how those are built; everything above it uses the
//! names re-exported here.
//!
//! The hosted port backs tasks with OS threads and the semaphore with a
//! mutex/condvar pair. Because the kernel is cooperative, suspension and
//! destruction only need to take effect at suspension points (wait-block
//! return and explicit yield), which is exactly what the hosted task
//! control block implements.

cfg_if::cfg_if! {
    if #[cfg(any(unix, windows))] {
        mod hosted;
        pub use hosted::*;
    } else {
        compile_error!("no port exists for this target environment");
    }
}

/// Tick type used by blocking primitives. One tick is one millisecond.
pub type Ticks = u64;

/// Tick value meaning "block until woken."
pub const TICKS_FOREVER: Ticks = Ticks::MAX;
