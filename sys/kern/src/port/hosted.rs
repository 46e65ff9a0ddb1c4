// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted implementation of the port: OS threads, mutexes, and the process
//! allocator stand in for the embedded substrate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::panic::panic_any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use super::{Ticks, TICKS_FOREVER};
use crate::config::ALLOC_ALIGN;

/// The critical section. Short-held by construction: no kernel code blocks
/// while holding one.
///
/// Lock poisoning is deliberately ignored. A panic inside a critical
/// section is already a kernel bug being reported; refusing to ever lock
/// again would only convert it into a cascade.
#[derive(Debug, Default)]
pub struct Spinlock<T> {
    inner: Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Binary counting semaphore. `give` saturates at one pending token, so a
/// wake issued before the corresponding block is absorbed rather than
/// accumulated.
#[derive(Debug, Default)]
pub struct BinarySemaphore {
    state: Mutex<bool>,
    cv: Condvar,
}

impl BinarySemaphore {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn give(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *st = true;
        self.cv.notify_one();
    }

    /// Takes the semaphore, waiting up to `ticks` milliseconds. Returns
    /// `false` on timeout.
    pub fn take(&self, ticks: Ticks) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if ticks == TICKS_FOREVER {
            while !*st {
                st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
            }
            *st = false;
            return true;
        }

        let deadline =
            Instant::now().checked_add(Duration::from_millis(ticks));
        loop {
            if *st {
                *st = false;
                return true;
            }
            let Some(deadline) = deadline else {
                // Timeout too large to represent; treat as forever.
                st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = g;
        }
    }
}

/// Returns the monotonic kernel clock in microseconds.
pub fn now_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Unwind payload used to terminate a task at a suspension point after
/// `NativeTask::kill`. The task wrapper in `sched` treats it as a normal
/// exit; everything else must let it propagate.
pub struct TaskKill;

#[derive(Debug, Default)]
struct TaskGate {
    suspended: bool,
    killed: bool,
}

/// Control block for one hosted task. The owning thread parks here at
/// suspension points; other tasks flip the flags.
#[derive(Debug, Default)]
pub struct TaskControl {
    gate: Mutex<TaskGate>,
    cv: Condvar,
    priority: u32,
}

pub type NativeTask = Arc<TaskControl>;

impl TaskControl {
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn suspend(&self) {
        let mut g = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        g.suspended = true;
    }

    pub fn resume(&self) {
        let mut g = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        g.suspended = false;
        self.cv.notify_all();
    }

    pub fn kill(&self) {
        let mut g = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        g.killed = true;
        g.suspended = false;
        self.cv.notify_all();
    }
}

thread_local! {
    static CURRENT_NATIVE: RefCell<Option<NativeTask>> =
        const { RefCell::new(None) };
}

/// Returns the control block of the calling task, or `None` when called
/// from a thread the scheduler does not own (boot, tests).
pub fn current_native() -> Option<NativeTask> {
    CURRENT_NATIVE.with(|c| c.borrow().clone())
}

/// Honors pending suspend/kill requests against the calling task. Called
/// on return from every blocking wait and from `task_yield`; under the
/// cooperative model these are the only places a task can stop.
pub fn suspension_point() {
    let Some(ctl) = current_native() else {
        return;
    };
    let mut g = ctl.gate.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if g.killed {
            drop(g);
            panic_any(TaskKill);
        }
        if g.suspended {
            g = ctl.cv.wait(g).unwrap_or_else(|e| e.into_inner());
        } else {
            return;
        }
    }
}

/// Yields the processor and honors suspend/kill requests.
pub fn yield_now() {
    suspension_point();
    std::thread::yield_now();
}

/// Spawns a task thread. The entry closure runs with the task's control
/// block installed as the thread's identity.
pub fn spawn_task(
    name: &str,
    stack_bytes: usize,
    priority: u32,
    entry: impl FnOnce() + Send + 'static,
) -> std::io::Result<NativeTask> {
    let ctl = Arc::new(TaskControl {
        gate: Mutex::new(TaskGate::default()),
        cv: Condvar::new(),
        priority,
    });
    let ctl2 = ctl.clone();
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_bytes)
        .spawn(move || {
            CURRENT_NATIVE.with(|c| *c.borrow_mut() = Some(ctl2));
            entry();
        })?;
    Ok(ctl)
}

/// Busy-delay used by the console read loop, honoring suspension.
pub fn delay_ms(ms: u64) {
    suspension_point();
    std::thread::sleep(Duration::from_millis(ms));
}

// --- Console ---------------------------------------------------------------

static CONSOLE_IN: Spinlock<VecDeque<u8>> = Spinlock::new(VecDeque::new());
static CONSOLE_OUT: Spinlock<Vec<u8>> = Spinlock::new(Vec::new());

const CONSOLE_OUT_CAP: usize = 64 * 1024;

/// Writes one byte to the console: mirrored to the process stdout and kept
/// in a bounded capture buffer for diagnostics.
pub fn console_write_byte(b: u8) {
    {
        let mut out = CONSOLE_OUT.lock();
        if out.len() >= CONSOLE_OUT_CAP {
            out.remove(0);
        }
        out.push(b);
    }
    let _ = std::io::stdout().write_all(&[b]);
}

/// Non-blocking console read; `None` when no byte is pending.
pub fn console_try_read_byte() -> Option<u8> {
    CONSOLE_IN.lock().pop_front()
}

/// Observes the next pending console byte without consuming it.
pub fn console_peek_byte() -> Option<u8> {
    CONSOLE_IN.lock().front().copied()
}

/// Queues bytes for the console reader. The hosted console is a loopback:
/// boot code or tests feed it, applet reads drain it.
pub fn console_feed(bytes: &[u8]) {
    CONSOLE_IN.lock().extend(bytes.iter().copied());
}

/// Drains and returns everything written to the console so far.
pub fn console_take_output() -> Vec<u8> {
    std::mem::take(&mut *CONSOLE_OUT.lock())
}

// --- Platform allocator -----------------------------------------------------

// Each platform allocation carries a hidden header recording its size so
// that `platform_free` can reconstruct the layout. The header occupies one
// full alignment unit to keep payloads `ALLOC_ALIGN`-aligned.
const PLATFORM_HDR: usize = ALLOC_ALIGN;

static_assertions::const_assert!(
    PLATFORM_HDR >= core::mem::size_of::<usize>()
);

/// Allocates `size` bytes from the platform allocator, or null.
pub fn platform_alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let Some(total) = size.checked_add(PLATFORM_HDR) else {
        return core::ptr::null_mut();
    };
    let Ok(layout) = std::alloc::Layout::from_size_align(total, ALLOC_ALIGN)
    else {
        return core::ptr::null_mut();
    };
    // Safety: layout has non-zero size.
    let raw = unsafe { std::alloc::alloc(layout) };
    if raw.is_null() {
        return core::ptr::null_mut();
    }
    // Safety: raw points at least `total` writable bytes.
    unsafe {
        (raw as *mut usize).write(size);
        raw.add(PLATFORM_HDR)
    }
}

/// Resizes a platform allocation, preserving the common prefix.
///
/// # Safety
///
/// `ptr` must be null or have come from `platform_alloc`, and must not be
/// used again after this call.
pub unsafe fn platform_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return platform_alloc(new_size);
    }
    if new_size == 0 {
        platform_free(ptr);
        return core::ptr::null_mut();
    }
    let old_size = (ptr.sub(PLATFORM_HDR) as *const usize).read();
    let next = platform_alloc(new_size);
    if next.is_null() {
        return core::ptr::null_mut();
    }
    core::ptr::copy_nonoverlapping(ptr, next, old_size.min(new_size));
    platform_free(ptr);
    next
}

/// Frees a pointer previously returned by `platform_alloc`.
///
/// # Safety
///
/// `ptr` must have come from `platform_alloc` and must not be freed twice.
pub unsafe fn platform_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let raw = ptr.sub(PLATFORM_HDR);
    let size = (raw as *const usize).read();
    let layout = std::alloc::Layout::from_size_align_unchecked(
        size + PLATFORM_HDR,
        ALLOC_ALIGN,
    );
    std::alloc::dealloc(raw, layout);
}

// --- Cache maintenance ------------------------------------------------------

// The hosted environment is cache-coherent; these exist so the ELF loader
// can keep the same call sequence the embedded ports require.

pub fn cache_flush(_addr: *const u8, _len: usize) {}

pub fn cache_invalidate(_addr: *const u8, _len: usize) {}

pub fn cache_barrier() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
