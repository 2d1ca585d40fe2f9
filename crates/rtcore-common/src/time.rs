//! Monotonic time base.
//!
//! All timestamps are microseconds on a monotonic timeline owned by a [`Clock`].
//! Production workers use [`MonotonicClock`]; tests drive a [`SimClock`] so
//! scheduling behaviour can be checked without depending on the host's sleep
//! granularity.

use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Absolute point on a clock's monotonic timeline, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock epoch.
    pub const ZERO: Self = Self(0);

    /// Create a timestamp from microseconds since the clock epoch.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the clock epoch.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Signed distance from `earlier` to `self` in microseconds.
    #[must_use]
    pub fn signed_micros_since(self, earlier: Timestamp) -> i64 {
        // Timelines never get anywhere near i64::MAX microseconds (~292k years).
        let delta = i128::from(self.0) - i128::from(earlier.0);
        i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_micros(rhs)))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Whole microseconds in `duration`, saturating at `u64::MAX`.
#[inline]
#[must_use]
pub fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Source of time and the blocking primitives workers suspend on.
///
/// Every suspension point of a worker (coarse sleep, remainder yield or
/// spin) goes through this trait.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current position on the monotonic timeline.
    fn now(&self) -> Timestamp;

    /// Tick-granular blocking sleep.
    fn sleep(&self, duration: Duration);

    /// Give up the rest of the current time slice once.
    fn yield_now(&self);

    /// Busy-wait until `deadline` has been reached.
    fn spin_until(&self, deadline: Timestamp) {
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Clock handle shared between workers, the watchdog, and the orchestrator.
pub type SharedClock = Arc<dyn Clock>;

/// Host monotonic clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Create a clock whose epoch is "now".
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Create a shared handle to a new monotonic clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp(duration_micros(self.epoch.elapsed()))
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Simulated clock for deterministic tests.
///
/// Time only moves when the test (or a worker body) advances it, or when a
/// worker sleeps or spins on it. Yields are counted but do not move time.
#[derive(Debug, Default)]
pub struct SimClock {
    now_us: AtomicU64,
    sleep_calls: AtomicU64,
    slept_us: AtomicU64,
    yields: AtomicU64,
    spins: AtomicU64,
}

impl SimClock {
    /// Create a simulated clock starting at `start`.
    #[must_use]
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            now_us: AtomicU64::new(start.as_micros()),
            ..Self::default()
        }
    }

    /// Create a shared simulated clock starting at zero.
    #[must_use]
    pub fn shared() -> Arc<SimClock> {
        Arc::new(Self::default())
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, at: Timestamp) {
        self.now_us.fetch_max(at.as_micros(), Ordering::AcqRel);
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration_micros(duration), Ordering::AcqRel);
    }

    /// Number of `sleep` calls so far.
    #[must_use]
    pub fn sleep_calls(&self) -> u64 {
        self.sleep_calls.load(Ordering::Acquire)
    }

    /// Total simulated time spent in `sleep`.
    #[must_use]
    pub fn slept(&self) -> Duration {
        Duration::from_micros(self.slept_us.load(Ordering::Acquire))
    }

    /// Number of `yield_now` calls so far.
    #[must_use]
    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::Acquire)
    }

    /// Number of `spin_until` calls so far.
    #[must_use]
    pub fn spins(&self) -> u64 {
        self.spins.load(Ordering::Acquire)
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_us.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) {
        self.sleep_calls.fetch_add(1, Ordering::AcqRel);
        self.slept_us
            .fetch_add(duration_micros(duration), Ordering::AcqRel);
        self.advance(duration);
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::AcqRel);
    }

    fn spin_until(&self, deadline: Timestamp) {
        self.spins.fetch_add(1, Ordering::AcqRel);
        self.set(deadline);
    }
}
