//! Timing quality metrics for periodic workers.
//!
//! [`PeriodStats`] turns successive iteration timestamps into jitter figures
//! relative to a target period. [`LatencyStats`] tracks producer-to-consumer
//! message latency on the receiving side of a channel.
//!
//! Both accumulate exact integer microseconds and are reset at every
//! reporting boundary, so precision does not degrade with uptime. Floating
//! point is only used when a report is produced.

use crate::time::{duration_micros, Timestamp};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Running jitter accumulator for one worker.
///
/// The first `update` after construction or [`reset`](Self::reset) only
/// records the timestamp; it would otherwise measure the gap since the last
/// report instead of a period.
#[derive(Debug, Clone)]
pub struct PeriodStats {
    /// Target period in microseconds (never zero).
    target_period_us: u64,
    /// Timestamp of the previous sample, `None` until primed.
    previous: Option<Timestamp>,
    /// Sum of |dt - period| over the window.
    abs_error_sum_us: u64,
    /// Largest |dt - period| seen in the window.
    max_abs_error_us: u64,
    /// Sum of observed intervals, for the measured rate.
    interval_sum_us: u64,
    /// Number of measured intervals in the window.
    samples: u64,
}

impl PeriodStats {
    /// Create an empty tracker for the given target period.
    #[must_use]
    pub fn new(target_period: Duration) -> Self {
        Self {
            target_period_us: duration_micros(target_period).max(1),
            previous: None,
            abs_error_sum_us: 0,
            max_abs_error_us: 0,
            interval_sum_us: 0,
            samples: 0,
        }
    }

    /// Record an iteration timestamp.
    ///
    /// This is allocation-free and O(1) for use in the worker hot path.
    pub fn update(&mut self, now: Timestamp) {
        let Some(previous) = self.previous.replace(now) else {
            return;
        };

        let dt_us = duration_micros(now.saturating_duration_since(previous));
        let abs_error_us = dt_us.abs_diff(self.target_period_us);

        self.abs_error_sum_us = self.abs_error_sum_us.saturating_add(abs_error_us);
        self.max_abs_error_us = self.max_abs_error_us.max(abs_error_us);
        self.interval_sum_us = self.interval_sum_us.saturating_add(dt_us);
        self.samples += 1;
    }

    /// Summarise the current window, or `None` if nothing was measured.
    #[must_use]
    pub fn report(&self) -> Option<PeriodReport> {
        if self.samples == 0 {
            return None;
        }

        let period = self.target_period_us as f64;
        let avg_abs_error_us = self.abs_error_sum_us as f64 / self.samples as f64;
        let mean_interval_us = self.interval_sum_us as f64 / self.samples as f64;

        Some(PeriodReport {
            samples: self.samples,
            target_period_us: self.target_period_us,
            avg_abs_error_us,
            max_abs_error_us: self.max_abs_error_us,
            jitter_pct: avg_abs_error_us / period * 100.0,
            max_jitter_pct: self.max_abs_error_us as f64 / period * 100.0,
            rate_hz: 1e6 / period,
            measured_hz: if mean_interval_us > 0.0 {
                1e6 / mean_interval_us
            } else {
                0.0
            },
        })
    }

    /// Clear the window and forget the previous timestamp.
    pub fn reset(&mut self) {
        self.previous = None;
        self.abs_error_sum_us = 0;
        self.max_abs_error_us = 0;
        self.interval_sum_us = 0;
        self.samples = 0;
    }

    /// Number of measured intervals in the current window.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Target period this tracker measures against.
    #[must_use]
    pub fn target_period(&self) -> Duration {
        Duration::from_micros(self.target_period_us)
    }

    /// Largest absolute timing error in the current window.
    #[must_use]
    pub fn max_abs_error(&self) -> Duration {
        Duration::from_micros(self.max_abs_error_us)
    }

    /// Mean absolute timing error in microseconds, if any sample exists.
    #[must_use]
    pub fn avg_abs_error_us(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.abs_error_sum_us as f64 / self.samples as f64)
    }
}

/// Read-only jitter snapshot for one reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodReport {
    /// Measured intervals in the window.
    pub samples: u64,
    /// Target period in microseconds.
    pub target_period_us: u64,
    /// Mean absolute deviation from the target period.
    pub avg_abs_error_us: f64,
    /// Maximum absolute deviation from the target period.
    pub max_abs_error_us: u64,
    /// Mean absolute deviation as a percentage of the period.
    pub jitter_pct: f64,
    /// Maximum absolute deviation as a percentage of the period.
    pub max_jitter_pct: f64,
    /// Nominal rate (1 / target period).
    pub rate_hz: f64,
    /// Rate derived from the mean observed interval.
    pub measured_hz: f64,
}

impl fmt::Display for PeriodReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} Hz (jitter avg: \u{b1}{:.2}%, max: \u{b1}{:.2}%)",
            self.rate_hz, self.jitter_pct, self.max_jitter_pct
        )
    }
}

/// Producer-to-consumer latency accumulator.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    received: u64,
    latency_sum_us: u64,
    max_latency_us: u64,
}

impl LatencyStats {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message sent at `sent_at` and received at `received_at`.
    pub fn record(&mut self, sent_at: Timestamp, received_at: Timestamp) {
        let latency_us = duration_micros(received_at.saturating_duration_since(sent_at));
        self.received += 1;
        self.latency_sum_us = self.latency_sum_us.saturating_add(latency_us);
        self.max_latency_us = self.max_latency_us.max(latency_us);
    }

    /// Messages recorded in the current window.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Summarise the current window.
    #[must_use]
    pub fn report(&self) -> LatencyReport {
        let avg_latency_us = if self.received > 0 {
            self.latency_sum_us as f64 / self.received as f64
        } else {
            0.0
        };
        LatencyReport {
            received: self.received,
            avg_latency_us,
            max_latency_us: self.max_latency_us,
        }
    }

    /// Clear the window.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Latency snapshot for one reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Messages received in the window.
    pub received: u64,
    /// Mean send-to-receive latency.
    pub avg_latency_us: f64,
    /// Maximum send-to-receive latency.
    pub max_latency_us: u64,
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.received == 0 {
            return f.write_str("no messages received");
        }
        write!(
            f,
            "avg = {:.2} ms, max = {:.2} ms over {} messages",
            self.avg_latency_us / 1000.0,
            self.max_latency_us as f64 / 1000.0,
            self.received
        )
    }
}
