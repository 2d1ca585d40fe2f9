//! Producer/consumer pipeline under sustained backpressure.
//!
//! A 1000 us producer feeds a consumer that pulls one message every
//! 1200 us. The backlog grows by roughly one message every 6 ms until the
//! 32-slot channel saturates, after which every surplus send is dropped.

use super::common::{simulate, ts, Lane};
use rtcore_common::config::RemainderPolicy;
use rtcore_common::time::SimClock;
use rtcore_runtime::channel::{Channel, Consumer, Producer};
use rtcore_runtime::worker::{
    ChannelRole, Delivery, PeriodicWorker, Tick, WorkerBody, WorkerSpec,
};
use std::time::Duration;

/// Consumer body that takes at most one message per iteration.
#[derive(Debug, Default)]
struct OneAtATime {
    seqs: Vec<u64>,
    empty_polls: u64,
}

impl WorkerBody<u64> for OneAtATime {
    fn run(&mut self, tick: &mut Tick<'_, u64>) {
        match tick.receive(Duration::from_micros(10)) {
            Some(message) => {
                assert_eq!(message.payload, message.seq);
                self.seqs.push(message.seq);
            }
            None => self.empty_polls += 1,
        }
    }
}

fn spec(name: &str, period_us: u64) -> WorkerSpec {
    WorkerSpec::new(name, Duration::from_micros(period_us))
        .remainder(RemainderPolicy::Spin)
        .report_interval(Duration::from_millis(100))
}

#[test]
fn test_backlog_saturates_and_drops_are_accounted() {
    let clock = SimClock::shared();
    let channel = Channel::bounded(32).unwrap();

    let mut producer = PeriodicWorker::new(
        spec("producer", 1000),
        ChannelRole::Producer(Producer::new(channel.clone())),
        |tick: &mut Tick<'_, u64>| {
            let seq = tick.index();
            tick.publish(seq);
        },
        clock.clone(),
    );
    let mut consumer = PeriodicWorker::new(
        spec("consumer", 1200),
        ChannelRole::Consumer(Consumer::new(channel.clone())),
        OneAtATime::default(),
        clock.clone(),
    );

    let mut sent = 0u64;
    let mut dropped = Vec::new();
    let mut max_occupancy = 0;
    {
        let mut lanes: [&mut dyn Lane; 2] = [&mut producer, &mut consumer];
        simulate(&clock, &mut lanes, ts(1_000_000), |lane, outcome| {
            if lane == 0 {
                sent += 1;
                if let Some(Delivery::Dropped { seq }) = outcome.delivery {
                    dropped.push(seq);
                }
            }
            max_occupancy = max_occupancy.max(channel.len());
        });
    }

    let received = consumer.body().seqs.len() as u64;
    assert_eq!(sent, 1001);
    assert_eq!(received, 834);
    assert_eq!(consumer.body().empty_polls, 0);

    // Channel never exceeds capacity and ends full
    assert_eq!(max_occupancy, 32);
    assert_eq!(channel.len(), 32);

    let drops = sent - received - 32;
    assert_eq!(drops, 135);
    assert_eq!(dropped.len() as u64, drops);
    assert_eq!(channel.dropped(), drops);
    assert_eq!(channel.accepted(), sent - drops);

    // Dropped messages still consumed their sequence numbers
    if let ChannelRole::Producer(p) = producer.role() {
        assert_eq!(p.next_seq(), sent);
        assert_eq!(p.dropped(), drops);
    } else {
        panic!("producer lost its role");
    }

    // Receive order is send order; gaps are exactly the drops
    let seqs = &consumer.body().seqs;
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(seqs.iter().all(|seq| !dropped.contains(seq)));
    assert_eq!(seqs[..5], [0, 1, 2, 3, 4]);
}

#[test]
fn test_no_drops_when_consumer_keeps_up() {
    let clock = SimClock::shared();
    let channel = Channel::bounded(4).unwrap();

    let mut producer = PeriodicWorker::new(
        spec("producer", 1000),
        ChannelRole::Producer(Producer::new(channel.clone())),
        |tick: &mut Tick<'_, u64>| {
            let seq = tick.index();
            tick.publish(seq);
        },
        clock.clone(),
    );
    let mut consumer = PeriodicWorker::new(
        spec("consumer", 500),
        ChannelRole::Consumer(Consumer::new(channel.clone())),
        OneAtATime::default(),
        clock.clone(),
    );

    {
        let mut lanes: [&mut dyn Lane; 2] = [&mut producer, &mut consumer];
        simulate(&clock, &mut lanes, ts(100_000), |_, outcome| {
            assert!(!matches!(outcome.delivery, Some(Delivery::Dropped { .. })));
        });
    }

    assert_eq!(channel.dropped(), 0);
    assert_eq!(consumer.body().seqs.len(), 101);
    // Every other consumer poll finds the channel empty
    assert_eq!(consumer.body().empty_polls, 100);
}

#[test]
fn test_producer_reports_steady_rate() {
    let clock = SimClock::shared();
    let channel = Channel::bounded(2).unwrap();
    let mut producer = PeriodicWorker::new(
        spec("producer", 1000),
        ChannelRole::Producer(Producer::new(channel)),
        |tick: &mut Tick<'_, u64>| tick.publish(0),
        clock.clone(),
    );

    let mut reports = Vec::new();
    {
        let mut lanes: [&mut dyn Lane; 1] = [&mut producer];
        simulate(&clock, &mut lanes, ts(300_000), |_, outcome| {
            reports.extend(outcome.report);
        });
    }

    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_eq!(report.max_abs_error_us, 0);
        assert!((report.rate_hz - 1000.0).abs() < 1e-9);
        assert!((report.measured_hz - 1000.0).abs() < 1e-9);
    }
}
