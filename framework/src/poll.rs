// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-retry condition polling: evaluate a probe on a fixed interval
//! until it produces a value or a timeout elapses.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use tracing::debug;

/// A time source for [`PollingWaiter`]. Injected so that timeout behavior
/// can be tested without real sleeps.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The wall clock. Sleeps block the calling thread; the sleep calls inside
/// a wait are the only suspension points in this crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Classifies probe errors. A transient error (a dropped connection, a
/// momentarily unreachable API server) is treated as a non-match and the
/// wait continues; anything else ends the wait immediately.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

/// The result of a single [`PollingWaiter::wait`] run. Call sites must
/// branch on every variant; no outcome is ever silently swallowed.
#[must_use]
#[derive(Debug)]
pub enum WaitOutcome<T, E> {
    /// The probe produced a value (the required number of times in a row).
    Succeeded(T),

    /// The timeout elapsed first. `last` carries the most recent value the
    /// probe produced, if any, for diagnostics.
    TimedOut { waited: Duration, last: Option<T> },

    /// The probe failed with a non-transient error.
    Failed(E),
}

/// A bounded-retry polling loop: run a probe every `interval` until it
/// matches or `timeout` elapses. The probe performs exactly one remote
/// read per invocation; this type supplies the retry/timeout policy.
pub struct PollingWaiter<C: Clock = SystemClock> {
    timeout: Duration,
    interval: Duration,
    consecutive: NonZeroU32,
    clock: C,
}

impl PollingWaiter<SystemClock> {
    /// Creates a waiter backed by the wall clock.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero; a zero interval would busy-spin
    /// against the remote API.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self::with_clock(timeout, interval, SystemClock)
    }
}

impl<C: Clock> PollingWaiter<C> {
    pub fn with_clock(timeout: Duration, interval: Duration, clock: C) -> Self {
        assert!(!interval.is_zero(), "poll interval must be positive");
        Self {
            timeout,
            interval,
            consecutive: NonZeroU32::new(1).unwrap(),
            clock,
        }
    }

    /// Requires the probe to match `n` times in a row before the wait is
    /// declared successful. Used to absorb flapping observed state, e.g.
    /// when the remote control loop can transiently satisfy a condition
    /// before reverting it. The streak resets on any non-match.
    pub fn consecutive_successes(mut self, n: NonZeroU32) -> Self {
        self.consecutive = n;
        self
    }

    /// Runs `probe` to completion. `Ok(Some(v))` is a match, `Ok(None)` is
    /// not-ready, a transient error is treated as not-ready, and any other
    /// error ends the wait as [`WaitOutcome::Failed`].
    ///
    /// A zero timeout still runs the probe exactly once before giving up.
    pub fn wait<T, E>(
        &self,
        mut probe: impl FnMut() -> Result<Option<T>, E>,
    ) -> WaitOutcome<T, E>
    where
        E: Transience + std::fmt::Display,
    {
        let start = self.clock.now();
        let mut streak = 0u32;
        let mut last = None;
        loop {
            match probe() {
                Ok(Some(value)) => {
                    streak += 1;
                    if streak >= self.consecutive.get() {
                        return WaitOutcome::Succeeded(value);
                    }
                    last = Some(value);
                }
                Ok(None) => {
                    streak = 0;
                }
                Err(e) if e.is_transient() => {
                    debug!(%e, "transient error from probe, continuing");
                    streak = 0;
                }
                Err(e) => return WaitOutcome::Failed(e),
            }

            let waited = self.clock.now().duration_since(start);
            if waited >= self.timeout {
                return WaitOutcome::TimedOut { waited, last };
            }

            self.clock.sleep(self.interval);
        }
    }
}
