//! Drift-free scheduling of several workers sharing one clock.
//!
//! Bodies burn a pseudo-random amount of time (up to half a period), which
//! pushes other workers' starts late as well. Deadlines must nevertheless
//! stay on each worker's own grid, anchored at the end of its first
//! iteration.

use super::common::{simulate, ts, Lane};
use rtcore_common::config::RemainderPolicy;
use rtcore_common::time::{Clock, SimClock};
use rtcore_runtime::worker::{ChannelRole, PeriodicWorker, Tick, WorkerSpec};
use std::time::Duration;

fn xorshift(seed: &mut u64) -> u64 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 7;
    *seed ^= *seed << 17;
    *seed
}

fn jittery(
    name: &str,
    period_us: u64,
    seed: u64,
    clock: &std::sync::Arc<SimClock>,
) -> PeriodicWorker<(), impl FnMut(&mut Tick<'_, ()>) + Send> {
    let mut seed = seed;
    let max_exec = period_us / 2;
    PeriodicWorker::new(
        WorkerSpec::new(name, Duration::from_micros(period_us))
            .remainder(RemainderPolicy::Spin)
            .report_interval(Duration::from_secs(3600)),
        ChannelRole::None,
        move |tick: &mut Tick<'_, ()>| {
            let exec = xorshift(&mut seed) % max_exec;
            tick.clock().sleep(Duration::from_micros(exec));
        },
        clock.clone(),
    )
}

#[test]
fn test_deadlines_stay_on_grid_under_jitter() {
    let clock = SimClock::shared();
    clock.set(ts(42_000));

    let periods = [1000u64, 2000, 10_000];
    let mut control = jittery("control", periods[0], 0x9E37_79B9_7F4A_7C15, &clock);
    let mut acquisition = jittery("acquisition", periods[1], 0xD1B5_4A32_D192_ED03, &clock);
    let mut comm = jittery("comm", periods[2], 0x2545_F491_4F6C_DD1D, &clock);

    let mut steps = [0u64; 3];
    let mut behind = [0u64; 3];
    let mut first_deadline = [None; 3];
    {
        let mut lanes: [&mut dyn Lane; 3] = [&mut control, &mut acquisition, &mut comm];
        simulate(&clock, &mut lanes, ts(2_042_000), |lane, outcome| {
            steps[lane] += 1;
            if outcome.advance.is_behind() {
                behind[lane] += 1;
            }
            let first = *first_deadline[lane].get_or_insert(outcome.advance.deadline);
            let expected = first.as_micros() + (steps[lane] - 1) * periods[lane];
            assert_eq!(outcome.advance.deadline, ts(expected), "lane {lane}");
            assert_eq!(outcome.iteration + 1, steps[lane]);
        });
    }

    // Long comm bodies push control late; it catches up without slipping
    assert!(behind[0] > 0);
    assert_eq!(control.scheduler().behind_count(), behind[0]);
    assert_eq!(comm.iteration(), steps[2]);
}

#[test]
fn test_idle_worker_hits_every_deadline() {
    let clock = SimClock::shared();
    let mut worker = PeriodicWorker::new(
        WorkerSpec::new("idle", Duration::from_micros(2_000)).report_interval(Duration::from_millis(100)),
        ChannelRole::None,
        |_: &mut Tick<'_, ()>| {},
        clock.clone(),
    );

    // Real wait path with the default yield policy: whole-ms periods have
    // no sub-tick remainder, so the simulated clock lands on each deadline.
    for n in 1..=500u64 {
        let outcome = worker.step();
        assert!(!outcome.advance.is_behind());
        worker.wait(outcome.advance);
        assert_eq!(clock.now(), ts(n * 2_000));
    }

    assert_eq!(clock.yields(), 0);
    assert_eq!(worker.scheduler().behind_count(), 0);
}
