//! Periodic worker: one logical task built from a body callback, an
//! optional channel role, jitter statistics, a watchdog heartbeat, and a
//! deadline scheduler.
//!
//! Each iteration follows a fixed order:
//! 1. Capture the start timestamp
//! 2. Run the body
//! 3. Producer role: send the body's payload stamped with the start time
//! 4. Update period statistics with the end timestamp
//! 5. Emit and reset statistics if the reporting interval has elapsed
//! 6. Heartbeat the watchdog
//! 7. Advance the deadline anchor
//!
//! Steps 1-7 are [`PeriodicWorker::step`], which never blocks on time and
//! can be driven from tests with a simulated clock. [`PeriodicWorker::run`]
//! is the production driver: step, then sleep until the new deadline,
//! forever.

use crate::channel::{Consumer, Message, Producer};
use crate::scheduler::{Advance, DeadlineScheduler};
use crate::watchdog::Heartbeat;
use rtcore_common::config::{Affinity, RemainderPolicy, WorkerPlacement};
use rtcore_common::metrics::{PeriodReport, PeriodStats};
use rtcore_common::time::{Clock, SharedClock, Timestamp};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Static description of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Worker name, also its watchdog id and thread name.
    pub name: String,
    /// Target period between iteration starts.
    pub period: Duration,
    /// Priority and execution context.
    pub placement: WorkerPlacement,
    /// Interval between statistics reports.
    pub report_interval: Duration,
    /// Sub-tick wait handling.
    pub remainder: RemainderPolicy,
    /// Whether the worker heartbeats the watchdog.
    pub supervised: bool,
}

impl WorkerSpec {
    /// Unpinned, lowest-priority, supervised worker with a 1 s report interval.
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            placement: WorkerPlacement {
                priority: 1,
                affinity: Affinity::Unconstrained,
            },
            report_interval: Duration::from_secs(1),
            remainder: RemainderPolicy::Yield,
            supervised: true,
        }
    }

    /// Set priority and affinity.
    #[must_use]
    pub fn placement(mut self, placement: WorkerPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Set the statistics reporting interval.
    #[must_use]
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Set the remainder policy.
    #[must_use]
    pub fn remainder(mut self, remainder: RemainderPolicy) -> Self {
        self.remainder = remainder;
        self
    }

    /// Opt out of watchdog supervision.
    #[must_use]
    pub fn unsupervised(mut self) -> Self {
        self.supervised = false;
        self
    }
}

/// The worker's side of the shared channel.
#[derive(Debug)]
pub enum ChannelRole<P> {
    /// Does not touch the channel.
    None,
    /// Sends one message per iteration when the body publishes a payload.
    Producer(Producer<P>),
    /// Polls the channel from its body.
    Consumer(Consumer<P>),
}

impl<P> ChannelRole<P> {
    /// Short role name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRole::None => "none",
            ChannelRole::Producer(_) => "producer",
            ChannelRole::Consumer(_) => "consumer",
        }
    }
}

/// Per-iteration context handed to the body.
pub struct Tick<'a, P> {
    index: u64,
    started_at: Timestamp,
    clock: &'a dyn Clock,
    consumer: Option<&'a mut Consumer<P>>,
    output: Option<P>,
}

impl<'a, P> Tick<'a, P> {
    /// Zero-based iteration number.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Timestamp captured before the body ran.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Worker clock, for bounded blocking work inside the body.
    pub fn clock(&self) -> &dyn Clock {
        self.clock
    }

    /// Payload to send after the body returns (producer role only).
    ///
    /// Publishing twice in one iteration keeps the latest payload.
    pub fn publish(&mut self, payload: P) {
        self.output = Some(payload);
    }

    /// Wait up to `timeout` for a message (consumer role only).
    ///
    /// Returns `None` on an empty poll or when the worker is not a consumer.
    pub fn receive(&mut self, timeout: Duration) -> Option<Message<P>> {
        self.consumer.as_mut()?.receive(timeout)
    }

    /// Take a message if one is queued (consumer role only).
    pub fn try_receive(&mut self) -> Option<Message<P>> {
        self.consumer.as_mut()?.try_receive()
    }

    /// Messages waiting in the channel (consumer role only).
    pub fn backlog(&self) -> Option<usize> {
        self.consumer.as_ref().map(|consumer| consumer.backlog())
    }
}

/// Work performed once per iteration.
///
/// Closures `FnMut(&mut Tick<'_, P>)` implement this automatically.
pub trait WorkerBody<P>: Send {
    /// Run one iteration.
    fn run(&mut self, tick: &mut Tick<'_, P>);

    /// Called at every reporting boundary, after the period report.
    fn report(&mut self, _worker: &str) {}
}

impl<P, F> WorkerBody<P> for F
where
    F: FnMut(&mut Tick<'_, P>) + Send,
{
    fn run(&mut self, tick: &mut Tick<'_, P>) {
        self(tick);
    }
}

/// Fate of the payload published in an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the channel.
    Sent {
        /// Sequence number of the message.
        seq: u64,
    },
    /// Rejected because the channel was full.
    Dropped {
        /// Sequence number the message would have carried.
        seq: u64,
    },
}

/// Everything one iteration produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Zero-based iteration number.
    pub iteration: u64,
    /// Timestamp before the body ran.
    pub started_at: Timestamp,
    /// Timestamp fed to the statistics tracker.
    pub finished_at: Timestamp,
    /// Channel outcome for producers that published.
    pub delivery: Option<Delivery>,
    /// Statistics report if this iteration crossed a reporting boundary.
    pub report: Option<PeriodReport>,
    /// New deadline and the wait until it.
    pub advance: Advance,
}

/// A periodic worker and all of its private state.
pub struct PeriodicWorker<P, B> {
    spec: WorkerSpec,
    body: B,
    role: ChannelRole<P>,
    clock: SharedClock,
    scheduler: DeadlineScheduler,
    stats: PeriodStats,
    last_report: Option<Timestamp>,
    heartbeat: Option<Heartbeat>,
    iteration: u64,
}

impl<P, B> std::fmt::Debug for PeriodicWorker<P, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicWorker")
            .field("name", &self.spec.name)
            .field("period", &self.spec.period)
            .field("role", &self.role.name())
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl<P, B> PeriodicWorker<P, B>
where
    B: WorkerBody<P>,
{
    /// Assemble a worker. Nothing runs until `step` or `run` is called.
    pub fn new(spec: WorkerSpec, role: ChannelRole<P>, body: B, clock: SharedClock) -> Self {
        let scheduler = DeadlineScheduler::new(spec.period, spec.remainder, clock.clone());
        let stats = PeriodStats::new(spec.period);
        Self {
            spec,
            body,
            role,
            clock,
            scheduler,
            stats,
            last_report: None,
            heartbeat: None,
            iteration: 0,
        }
    }

    /// Attach the watchdog heartbeat handle.
    pub fn attach_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.heartbeat = Some(heartbeat);
    }

    /// Worker description.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Iterations completed.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Statistics of the current reporting window.
    pub fn stats(&self) -> &PeriodStats {
        &self.stats
    }

    /// Deadline scheduler state.
    pub fn scheduler(&self) -> &DeadlineScheduler {
        &self.scheduler
    }

    /// Channel role.
    pub fn role(&self) -> &ChannelRole<P> {
        &self.role
    }

    /// Body callback.
    pub fn body(&self) -> &B {
        &self.body
    }

    /// Execute one iteration without sleeping.
    pub fn step(&mut self) -> StepOutcome {
        let started_at = self.clock.now();
        let last_report = *self.last_report.get_or_insert(started_at);

        let consumer = match &mut self.role {
            ChannelRole::Consumer(consumer) => Some(consumer),
            _ => None,
        };
        let mut tick = Tick {
            index: self.iteration,
            started_at,
            clock: &*self.clock,
            consumer,
            output: None,
        };
        self.body.run(&mut tick);
        let output = tick.output;

        let delivery = output.and_then(|payload| self.deliver(started_at, payload));

        let finished_at = self.clock.now();
        self.stats.update(finished_at);

        let report = if finished_at.saturating_duration_since(last_report) >= self.spec.report_interval {
            self.last_report = Some(finished_at);
            self.emit_report()
        } else {
            None
        };

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.beat();
        }

        let advance = self.scheduler.plan_next();
        let iteration = self.iteration;
        self.iteration += 1;

        trace!(
            worker = %self.spec.name,
            iteration,
            exec_us = finished_at.saturating_duration_since(started_at).as_micros(),
            wait_us = advance.wait.as_micros(),
            "Iteration complete"
        );

        StepOutcome {
            iteration,
            started_at,
            finished_at,
            delivery,
            report,
            advance,
        }
    }

    /// Block until the deadline returned by the last `step`.
    pub fn wait(&self, advance: Advance) {
        self.scheduler.wait(advance);
    }

    /// Step and wait `count` times.
    pub fn run_iterations(&mut self, count: u64) {
        for _ in 0..count {
            let outcome = self.step();
            self.wait(outcome.advance);
        }
    }

    /// Production driver. Never returns.
    pub fn run(mut self) -> ! {
        info!(
            worker = %self.spec.name,
            period_us = self.spec.period.as_micros(),
            role = self.role.name(),
            supervised = self.heartbeat.is_some(),
            "Entering periodic loop"
        );
        loop {
            let outcome = self.step();
            self.wait(outcome.advance);
        }
    }

    fn deliver(&mut self, sent_at: Timestamp, payload: P) -> Option<Delivery> {
        let producer = match &mut self.role {
            ChannelRole::Producer(producer) => producer,
            other => {
                debug!(
                    worker = %self.spec.name,
                    role = other.name(),
                    "Payload published without producer role, ignoring"
                );
                return None;
            }
        };

        match producer.publish(sent_at, payload) {
            Ok(seq) => Some(Delivery::Sent { seq }),
            Err(e) => {
                let seq = e.into_inner().seq;
                warn!(
                    worker = %self.spec.name,
                    seq,
                    dropped_total = producer.dropped(),
                    "Channel full, message dropped"
                );
                Some(Delivery::Dropped { seq })
            }
        }
    }

    fn emit_report(&mut self) -> Option<PeriodReport> {
        let report = self.stats.report();
        if let Some(report) = &report {
            let dropped = match &self.role {
                ChannelRole::Producer(producer) => producer.dropped(),
                _ => 0,
            };
            info!(
                worker = %self.spec.name,
                samples = report.samples,
                avg_abs_error_us = report.avg_abs_error_us,
                max_abs_error_us = report.max_abs_error_us,
                measured_hz = report.measured_hz,
                behind = self.scheduler.behind_count(),
                dropped,
                "{}: {}",
                self.spec.name,
                report
            );
        }
        self.stats.reset();
        self.body.report(&self.spec.name);
        report
    }
}
