//! Drift-free deadline scheduler for periodic workers.
//!
//! Each worker owns a [`DeadlineAnchor`]: the absolute time its next
//! iteration should start. The anchor is advanced by exactly one period per
//! iteration and is never resynchronised to "now", so transient overruns do
//! not shift the long-run rate. A late iteration simply gets no sleep.
//!
//! Waiting is split in two:
//! 1. the whole-millisecond part is slept with the clock's tick sleep
//! 2. the sub-millisecond remainder is either yielded once or spun away,
//!    depending on [`RemainderPolicy`]
//!
//! With [`RemainderPolicy::Yield`] the remainder is not verified to have
//! elapsed, which biases wakeups slightly early (by less than one
//! millisecond). [`RemainderPolicy::Spin`] closes that gap at the cost of
//! burning CPU for the remainder.

use rtcore_common::config::RemainderPolicy;
use rtcore_common::time::{SharedClock, Timestamp};
use std::time::Duration;
use tracing::trace;

/// Granularity of the coarse sleep primitive.
pub const TICK: Duration = Duration::from_millis(1);

/// Absolute next-wake time of one worker, lazily initialised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineAnchor {
    next: Option<Timestamp>,
}

impl DeadlineAnchor {
    /// An anchor that will be set on the first tick.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: None }
    }

    /// Current deadline, if the anchor has been initialised.
    #[must_use]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.next
    }

    /// Advance the anchor by one period and compute the wait from `now`.
    ///
    /// The first call sets the anchor to `now + period`; every later call
    /// adds `period` to the previous deadline regardless of `now`.
    pub fn advance(&mut self, now: Timestamp, period: Duration) -> Advance {
        let deadline = match self.next {
            None => now + period,
            Some(previous) => previous + period,
        };
        self.next = Some(deadline);

        Advance {
            deadline,
            wait: deadline.saturating_duration_since(now),
        }
    }
}

/// Result of advancing an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// New absolute deadline.
    pub deadline: Timestamp,
    /// Time left until the deadline; zero when behind schedule.
    pub wait: Duration,
}

impl Advance {
    /// Whether the iteration finished at or after its deadline.
    #[must_use]
    pub fn is_behind(&self) -> bool {
        self.wait.is_zero()
    }

    /// Split the wait into tick sleep and sub-tick remainder.
    #[must_use]
    pub fn plan(&self) -> WaitPlan {
        WaitPlan::split(self.wait)
    }
}

/// A wait broken into coarse and fine parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPlan {
    /// Whole ticks to sleep.
    pub coarse: Duration,
    /// Sub-tick remainder.
    pub remainder: Duration,
}

impl WaitPlan {
    /// Split `wait` at tick granularity.
    #[must_use]
    pub fn split(wait: Duration) -> Self {
        let ticks = wait.as_micros() / TICK.as_micros();
        let coarse = TICK * u32::try_from(ticks).unwrap_or(u32::MAX);
        Self {
            coarse,
            remainder: wait.saturating_sub(coarse),
        }
    }
}

/// Deadline scheduler owned by a single worker.
#[derive(Debug)]
pub struct DeadlineScheduler {
    anchor: DeadlineAnchor,
    period: Duration,
    remainder: RemainderPolicy,
    clock: SharedClock,
    /// Iterations that finished past their deadline.
    behind_count: u64,
}

impl DeadlineScheduler {
    /// Create a scheduler for `period` on `clock`.
    pub fn new(period: Duration, remainder: RemainderPolicy, clock: SharedClock) -> Self {
        Self {
            anchor: DeadlineAnchor::new(),
            period,
            remainder,
            clock,
            behind_count: 0,
        }
    }

    /// Target period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Current anchor state.
    pub fn anchor(&self) -> DeadlineAnchor {
        self.anchor
    }

    /// Number of iterations that found themselves behind schedule.
    pub fn behind_count(&self) -> u64 {
        self.behind_count
    }

    /// Advance the anchor from the clock's current time without blocking.
    pub fn plan_next(&mut self) -> Advance {
        let now = self.clock.now();
        let advance = self.anchor.advance(now, self.period);
        if advance.is_behind() {
            self.behind_count += 1;
            trace!(
                deadline_us = advance.deadline.as_micros(),
                late_us = now.saturating_duration_since(advance.deadline).as_micros(),
                "Behind schedule, skipping sleep"
            );
        }
        advance
    }

    /// Block until `advance.deadline` using the coarse/fine strategy.
    pub fn wait(&self, advance: Advance) {
        if advance.is_behind() {
            return;
        }

        let plan = advance.plan();
        if !plan.coarse.is_zero() {
            self.clock.sleep(plan.coarse);
        }

        let remaining = advance
            .deadline
            .saturating_duration_since(self.clock.now());
        if remaining.is_zero() {
            return;
        }

        match self.remainder {
            RemainderPolicy::Yield => {
                if remaining < TICK {
                    self.clock.yield_now();
                }
            }
            RemainderPolicy::Spin => self.clock.spin_until(advance.deadline),
        }
    }

    /// Advance the anchor and block until the new deadline.
    pub fn sleep_until_next(&mut self) -> Advance {
        let advance = self.plan_next();
        self.wait(advance);
        advance
    }
}
