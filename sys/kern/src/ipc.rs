// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-aware wait queues for IPC primitives.
//!
//! A [`WaitQueue`] holds the waiters parked on some kernel object (a job's
//! completion, a file's readiness). The queue itself is not locked; it is
//! embedded in an object whose lock the caller already holds for every
//! queue operation. Waiters are shared (`Arc`) between the blocking task
//! and whoever wakes it.
//!
//! `wake_one` hands the wake to the waiter whose task has the highest
//! priority, with FIFO order breaking ties -- a linear scan, which is the
//! right tool for queues this short. `wake_all` wakes in FIFO order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abi::{IpcResult, WaitReason, WaitResult};

use crate::sched::WaitContext;
use crate::time::Deadline;

/// One parked (or about to park) IPC waiter.
pub struct Waiter {
    wait: WaitContext,
    enqueued: AtomicBool,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            wait: WaitContext::new(),
            enqueued: AtomicBool::new(false),
        }
    }

    /// Re-arms the waiter for one block, binding it to the calling task.
    pub fn prepare(&self, reason: WaitReason) {
        self.enqueued.store(false, Ordering::Relaxed);
        self.wait.prepare_with_reason(reason);
    }

    /// Blocks until woken or `deadline`.
    pub fn block(&self, deadline: Option<&Deadline>) -> IpcResult {
        self.wait.block(deadline).into()
    }

    /// Blocks with a relative timeout in microseconds.
    pub fn block_timed(&self, timeout_us: u64) -> IpcResult {
        let deadline = Deadline::from_relative(timeout_us);
        self.block(Some(&deadline))
    }
}

/// Queue of waiters attached to one kernel object.
#[derive(Default)]
pub struct WaitQueue {
    items: Vec<Arc<Waiter>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn enqueue(&mut self, waiter: Arc<Waiter>) {
        waiter.enqueued.store(true, Ordering::Relaxed);
        self.items.push(waiter);
    }

    /// Removes `waiter` if it is still linked. Idempotent: removing a
    /// waiter that was already taken out (by a wake, or by an earlier
    /// call) is a no-op returning `false`.
    pub fn remove(&mut self, waiter: &Arc<Waiter>) -> bool {
        if !waiter.enqueued.load(Ordering::Relaxed) {
            return false;
        }
        let Some(pos) =
            self.items.iter().position(|w| Arc::ptr_eq(w, waiter))
        else {
            return false;
        };
        self.items.remove(pos);
        waiter.enqueued.store(false, Ordering::Relaxed);
        true
    }

    fn pick(&self) -> Option<usize> {
        let mut best: Option<(usize, abi::Priority)> = None;
        for (i, w) in self.items.iter().enumerate() {
            let prio = w.wait.owner_priority();
            match best {
                // Strict comparison keeps the earliest enqueued waiter on
                // a tie.
                Some((_, bp)) if !prio.is_more_important_than(bp) => {}
                _ => best = Some((i, prio)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Wakes the highest-priority waiter with `result`. Returns whether a
    /// waiter was woken.
    pub fn wake_one(&mut self, result: IpcResult) -> bool {
        let Some(i) = self.pick() else {
            return false;
        };
        let waiter = self.items.remove(i);
        waiter.enqueued.store(false, Ordering::Relaxed);
        waiter.wait.wake(WaitResult::from(result));
        true
    }

    /// Wakes every waiter, in queue order, with `result`.
    pub fn wake_all(&mut self, result: IpcResult) {
        for waiter in self.items.drain(..) {
            waiter.enqueued.store(false, Ordering::Relaxed);
            waiter.wait.wake(WaitResult::from(result));
        }
    }
}
