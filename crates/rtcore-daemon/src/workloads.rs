//! Bodies of the four demo workers.
//!
//! The workloads are stand-ins: a short numeric loop for the control law,
//! a sine/cosine sensor model for acquisition, a fixed blocking delay for
//! communication I/O. What matters is their timing footprint, not their
//! results.

use rtcore_common::metrics::LatencyStats;
use rtcore_runtime::channel::{Channel, Message};
use rtcore_runtime::worker::{Tick, WorkerBody};
use std::hint::black_box;
use std::time::Duration;
use tracing::{debug, info};

/// Payload carried from the control worker to the comm worker.
pub type ControlOutput = f32;

/// Dummy control computation, about 200 square roots per iteration.
#[derive(Debug, Default)]
pub struct ControlLaw;

impl ControlLaw {
    /// Compute the output for iteration `k`.
    pub fn compute(k: u64) -> ControlOutput {
        let mut acc = 0.0f32;
        for i in 1..=200u16 {
            acc += black_box(f32::from(i)).sqrt() * 0.001;
        }
        // Low three bits only, lossless
        #[allow(clippy::cast_precision_loss)]
        let wobble = (k & 0x7) as f32 * 0.01;
        acc + wobble
    }
}

impl WorkerBody<ControlOutput> for ControlLaw {
    fn run(&mut self, tick: &mut Tick<'_, ControlOutput>) {
        let output = Self::compute(tick.index());
        tick.publish(output);
    }
}

/// Simulated two-channel sensor read.
#[derive(Debug)]
pub struct SensorSim {
    phase: f32,
    step: f32,
    last: (f32, f32),
}

impl Default for SensorSim {
    fn default() -> Self {
        Self {
            phase: 0.0,
            step: 0.05,
            last: (0.0, 0.0),
        }
    }
}

impl SensorSim {
    /// Advance the phase and produce the next reading pair.
    pub fn read(&mut self) -> (f32, f32) {
        self.phase += self.step;
        self.last = (
            1.23 + 0.1 * self.phase.sin(),
            3.45 + 0.1 * self.phase.cos(),
        );
        self.last
    }

    /// Most recent reading.
    pub fn last(&self) -> (f32, f32) {
        self.last
    }
}

impl WorkerBody<ControlOutput> for SensorSim {
    fn run(&mut self, _tick: &mut Tick<'_, ControlOutput>) {
        black_box(self.read());
    }
}

/// Channel consumer with simulated blocking I/O and latency accounting.
#[derive(Debug)]
pub struct CommLink {
    receive_timeout: Duration,
    io_time: Duration,
    latency: LatencyStats,
}

impl CommLink {
    /// Create a link that waits `receive_timeout` for data and then blocks
    /// for `io_time`.
    pub fn new(receive_timeout: Duration, io_time: Duration) -> Self {
        Self {
            receive_timeout,
            io_time,
            latency: LatencyStats::default(),
        }
    }

    /// Latency accumulated in the current window.
    pub fn latency(&self) -> &LatencyStats {
        &self.latency
    }
}

impl WorkerBody<ControlOutput> for CommLink {
    fn run(&mut self, tick: &mut Tick<'_, ControlOutput>) {
        // Block for the first message, then drain whatever queued up
        // while this worker was in I/O.
        let first = tick.receive(self.receive_timeout);
        let mut next = first;
        while let Some(message) = next {
            self.latency.record(message.sent_at, tick.now());
            next = tick.try_receive();
        }

        tick.clock().sleep(self.io_time);
    }

    fn report(&mut self, worker: &str) {
        let report = self.latency.report();
        info!(
            worker,
            received = report.received,
            "Comm latency: {report}"
        );
        self.latency.reset();
    }
}

/// Low-priority housekeeping that proves liveness every 20 iterations.
#[derive(Debug)]
pub struct Background {
    channel: Channel<Message<ControlOutput>>,
    iterations: u64,
}

impl Background {
    /// Iterations between alive lines.
    pub const ALIVE_EVERY: u64 = 20;

    /// Watch `channel` occupancy and drops.
    pub fn new(channel: Channel<Message<ControlOutput>>) -> Self {
        Self {
            channel,
            iterations: 0,
        }
    }

    /// Iterations completed.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

impl WorkerBody<ControlOutput> for Background {
    fn run(&mut self, _tick: &mut Tick<'_, ControlOutput>) {
        self.iterations += 1;
        if self.iterations % Self::ALIVE_EVERY == 0 {
            info!(
                iterations = self.iterations,
                occupancy = self.channel.len(),
                capacity = self.channel.capacity(),
                accepted = self.channel.accepted(),
                dropped = self.channel.dropped(),
                "Background alive"
            );
        } else {
            debug!(iterations = self.iterations, "Background tick");
        }
    }
}
