// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for instrumenting kernel subsystems.
//!
//! Each interesting module declares a ring buffer of `Copy` entries and
//! records events into it as they happen. The buffers are fixed-size and
//! overwrite their oldest entries, so they are safe to leave compiled into
//! production kernels; the design center is postmortem inspection (a
//! debugger, or a test snapshotting the buffer) rather than a textual log
//! stream.
//!
//! ## Creating a ring buffer
//!
//! Ring buffers are instantiated with the [`ringbuf!`] macro, which takes
//! the per-entry payload type, the number of entries, and an initializer:
//!
//! ```
//! use ringbuf::*;
//! ringbuf!(MY_RINGBUF, u32, 16, 0);
//! ```
//!
//! Entries are recorded with [`ringbuf_entry!`]:
//!
//! ```
//! # use ringbuf::*;
//! # ringbuf!(MY_RINGBUF, u32, 16, 0);
//! ringbuf_entry!(MY_RINGBUF, 42);
//! ```
//!
//! When the same payload is recorded from the same line several times in a
//! row, the existing entry's `count` is incremented instead of burning a
//! fresh slot, so a busy loop does not wipe out earlier history. Payload
//! types must therefore implement [`PartialEq`] as well as [`Copy`].
//!
//! Tests can call [`RingbufCell::snapshot`] to copy out the live entries in
//! oldest-to-newest order and assert on what a subsystem recorded.

use std::sync::Mutex;

/// One recorded event.
///
/// `line` is the source line that recorded the entry, `generation` counts
/// laps around the buffer, and `count` is the number of consecutive
/// identical recordings folded into this entry.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn record_entry(&mut self, line: u16, payload: T) {
        // If this matches the most recent entry exactly, fold it in rather
        // than consuming a slot.
        if let Some(last) = self.last {
            let ent = &mut self.buffer[last];
            if ent.line == line && ent.payload == payload {
                ent.count = ent.count.saturating_add(1);
                return;
            }
        }

        let ndx = match self.last {
            None => 0,
            Some(last) if last + 1 >= self.buffer.len() => 0,
            Some(last) => last + 1,
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);
        self.last = Some(ndx);
    }
}

/// Shared cell holding a ring buffer, suitable for a `static`.
///
/// Recording never blocks for long: the lock is only held for the entry
/// update itself. A recording that observes a poisoned lock (a panicking
/// recorder) proceeds with the recovered state; losing trace fidelity is
/// better than propagating the panic.
#[derive(Debug)]
pub struct RingbufCell<T: Copy, const N: usize> {
    inner: Mutex<Ringbuf<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> RingbufCell<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: Mutex::new(Ringbuf::new(init)),
        }
    }

    pub fn record(&self, line: u16, payload: T) {
        let mut buf =
            self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.record_entry(line, payload);
    }

    /// Copies out the live entries, oldest first.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        let Some(last) = buf.last else {
            return out;
        };

        // Walk forward from the slot after `last`, skipping never-written
        // slots (count == 0).
        let n = buf.buffer.len();
        for i in 1..=n {
            let ent = &buf.buffer[(last + i) % n];
            if ent.count != 0 {
                out.push(*ent);
            }
        }
        out
    }
}

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ring buffer named `NAME`
/// containing entries of type `Type`, with room for `N` such entries, all
/// initialized to `expr`. The resulting item is a `static`, so `NAME`
/// should be uppercase.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::RingbufCell<$t, $n> =
            $crate::RingbufCell::new($init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
        static $name: () = ();
    };
}

/// Inserts data into a ring buffer declared with [`ringbuf!`].
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate payload before touching the buffer so the two
        // expressions cannot accidentally observe each other's locks.
        let p = $payload;
        $buf.record(line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let cell = RingbufCell::<u32, 4>::new(0);
        cell.record(1, 10);
        cell.record(2, 20);
        cell.record(3, 30);
        let snap = cell.snapshot();
        let payloads: Vec<u32> = snap.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![10, 20, 30]);
    }

    #[test]
    fn dedups_identical_consecutive_entries() {
        let cell = RingbufCell::<u32, 4>::new(0);
        cell.record(7, 5);
        cell.record(7, 5);
        cell.record(7, 5);
        let snap = cell.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].count, 3);
    }

    #[test]
    fn same_payload_different_line_is_a_new_entry() {
        let cell = RingbufCell::<u32, 4>::new(0);
        cell.record(1, 5);
        cell.record(2, 5);
        assert_eq!(cell.snapshot().len(), 2);
    }

    #[test]
    fn wraps_and_keeps_most_recent() {
        let cell = RingbufCell::<u32, 3>::new(0);
        for v in 0..5 {
            cell.record(v as u16 + 1, v);
        }
        let payloads: Vec<u32> =
            cell.snapshot().iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
    }

    #[test]
    fn empty_buffer_snapshots_empty() {
        let cell = RingbufCell::<u32, 3>::new(0);
        assert!(cell.snapshot().is_empty());
    }
}
