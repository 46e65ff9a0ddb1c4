// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time and deadlines.
//!
//! Kernel time is a monotonic microsecond count starting at boot,
//! represented by [`Timestamp`]. Blocking primitives take a [`Deadline`],
//! an absolute target that also has an explicit "never" form so callers
//! don't have to smuggle sentinels through timeout arithmetic.

use crate::port::{self, Ticks, TICKS_FOREVER};

/// Relative timeout value meaning "wait forever."
pub const TIMEOUT_FOREVER: u64 = u64::MAX;

/// In-kernel timestamp representation: microseconds of kernel time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Returns the current kernel time.
pub fn now() -> Timestamp {
    Timestamp(port::now_us())
}

/// Returns the current kernel time in microseconds.
pub fn now_us() -> u64 {
    now().into()
}

/// An absolute point in kernel time, or never.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Deadline {
    pub target: Timestamp,
    pub infinite: bool,
}

impl Deadline {
    pub const FOREVER: Self = Self {
        target: Timestamp(0),
        infinite: true,
    };

    /// Builds a deadline `delta_us` from now. `TIMEOUT_FOREVER` yields the
    /// infinite deadline.
    pub fn from_relative(delta_us: u64) -> Self {
        if delta_us == TIMEOUT_FOREVER {
            return Self::FOREVER;
        }
        Self {
            target: Timestamp(now_us().saturating_add(delta_us)),
            infinite: false,
        }
    }

    /// Builds a deadline at an absolute kernel time.
    pub fn at(target: Timestamp) -> Self {
        Self {
            target,
            infinite: target.0 == TIMEOUT_FOREVER,
        }
    }

    /// Converts the remaining wait into substrate ticks: the maximum wait
    /// for an infinite deadline, zero for an expired one, and otherwise
    /// the remaining time rounded up to whole ticks and clamped below the
    /// maximum.
    pub fn to_ticks(&self) -> Ticks {
        if self.infinite {
            return TICKS_FOREVER;
        }
        let now = now();
        if self.target <= now {
            return 0;
        }
        let remaining_us = self.target.0 - now.0;
        let ticks = remaining_us.div_ceil(1000);
        if ticks >= TICKS_FOREVER {
            TICKS_FOREVER - 1
        } else {
            ticks
        }
    }
}

/// Converts an optional deadline reference to ticks, treating `None` as
/// infinite. Mirrors the convention that a null deadline means "block."
pub fn deadline_to_ticks(deadline: Option<&Deadline>) -> Ticks {
    match deadline {
        None => TICKS_FOREVER,
        Some(d) => d.to_ticks(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn timestamp_round_trips_through_u64() {
        let ts = Timestamp::from(123_456_789u64);
        assert_eq!(u64::from(ts), 123_456_789);
        assert!(Timestamp::from(2u64) > Timestamp::from(1u64));
    }

    #[test]
    fn forever_relative_is_infinite() {
        let d = Deadline::from_relative(TIMEOUT_FOREVER);
        assert!(d.infinite);
        assert_eq!(d.to_ticks(), TICKS_FOREVER);
    }

    #[test]
    fn expired_deadline_is_zero_ticks() {
        let d = Deadline::at(Timestamp::from(1u64));
        // Kernel time is comfortably past 1us by the time tests run; force
        // the point by sleeping a moment.
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(d.to_ticks(), 0);
    }

    #[test]
    fn remaining_time_rounds_up_to_whole_ticks() {
        let d = Deadline::from_relative(1500);
        let t = d.to_ticks();
        // 1.5ms from now is either 1 or 2 ticks depending on how much time
        // elapsed between from_relative and to_ticks, never zero or huge.
        assert!(t >= 1 && t <= 2, "unexpected tick count {t}");
    }

    #[test]
    fn null_deadline_means_forever() {
        assert_eq!(deadline_to_ticks(None), TICKS_FOREVER);
    }
}
