//! Discrete-event driver shared by the scenarios.
//!
//! Each lane is a periodic worker with its own next start time. The driver
//! repeatedly picks the earliest lane (lower index wins ties), moves the
//! clock to its start time, and steps it. Workers never call `wait`; the
//! driver owns time.

use rtcore_common::time::{Clock, SimClock, Timestamp};
use rtcore_runtime::worker::{PeriodicWorker, StepOutcome, WorkerBody};

/// A worker the driver can step.
pub trait Lane {
    /// Run one iteration at the current clock time.
    fn step(&mut self) -> StepOutcome;
}

impl<P, B: WorkerBody<P>> Lane for PeriodicWorker<P, B> {
    fn step(&mut self) -> StepOutcome {
        PeriodicWorker::step(self)
    }
}

/// Step `lanes` in start-time order until the next start is past `until`.
///
/// `observe` sees every outcome with the index of the lane that produced it.
pub fn simulate(
    clock: &SimClock,
    lanes: &mut [&mut dyn Lane],
    until: Timestamp,
    mut observe: impl FnMut(usize, &StepOutcome),
) {
    let mut next_start = vec![clock.now(); lanes.len()];
    loop {
        let Some((index, at)) = next_start
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|&(_, at)| at)
        else {
            return;
        };
        if at > until {
            return;
        }

        clock.set(at);
        let outcome = lanes[index].step();
        observe(index, &outcome);
        next_start[index] = outcome.advance.deadline.max(clock.now());
    }
}

/// Timestamp shorthand.
pub fn ts(us: u64) -> Timestamp {
    Timestamp::from_micros(us)
}
