//! Orchestrator: owns the shared runtime context and starts workers.
//!
//! The [`RuntimeContext`] is created once, before any worker starts, and
//! holds the only cross-worker state: the bounded channel and the watchdog
//! registry. Workers never reach it through globals; the orchestrator hands
//! each one its channel role and heartbeat explicitly.
//!
//! Startup is fail-fast. Invalid configuration, a channel role requested
//! twice, a duplicate worker name, a failed thread spawn, or (with
//! `realtime.fail_fast`) a placement that cannot be applied all surface as
//! errors from [`Orchestrator::new`] or [`Orchestrator::start_periodic_worker`].

use crate::channel::{Channel, Consumer, Message, Producer};
use crate::realtime::{self, PlacementStatus};
use crate::watchdog::{FatalAction, WatchdogRegistry};
use crate::worker::{ChannelRole, PeriodicWorker, WorkerBody, WorkerSpec};
use rtcore_common::config::CoreConfig;
use rtcore_common::error::{RtError, RtResult};
use rtcore_common::time::SharedClock;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Process-wide state shared by all workers.
#[derive(Debug)]
pub struct RuntimeContext<P> {
    config: CoreConfig,
    clock: SharedClock,
    channel: Channel<Message<P>>,
    watchdog: Arc<WatchdogRegistry>,
}

impl<P> RuntimeContext<P> {
    /// Validated configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Time source shared by all workers.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The producer-to-consumer channel.
    pub fn channel(&self) -> &Channel<Message<P>> {
        &self.channel
    }

    /// The watchdog registry.
    pub fn watchdog(&self) -> &Arc<WatchdogRegistry> {
        &self.watchdog
    }
}

/// A started worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    placement: PlacementStatus,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority and affinity actually applied.
    pub fn placement(&self) -> &PlacementStatus {
        &self.placement
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Creates the runtime context and starts workers.
#[derive(Debug)]
pub struct Orchestrator<P> {
    context: RuntimeContext<P>,
    producer_taken: bool,
    consumer_taken: bool,
}

impl<P: Send + 'static> Orchestrator<P> {
    /// Build the context with the default abort-on-expiry watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Config`] for invalid configuration and
    /// [`RtError::Init`] or [`RtError::Realtime`] if the context cannot be
    /// set up.
    pub fn new(config: CoreConfig, clock: SharedClock) -> RtResult<Self> {
        let watchdog = WatchdogRegistry::new(clock.clone(), config.watchdog_timeout);
        Self::build(config, clock, watchdog)
    }

    /// Build the context with a custom watchdog fatal action.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::new`].
    pub fn with_fatal_action(
        config: CoreConfig,
        clock: SharedClock,
        on_expire: FatalAction,
    ) -> RtResult<Self> {
        let watchdog =
            WatchdogRegistry::with_fatal_action(clock.clone(), config.watchdog_timeout, on_expire);
        Self::build(config, clock, watchdog)
    }

    fn build(config: CoreConfig, clock: SharedClock, watchdog: WatchdogRegistry) -> RtResult<Self> {
        config
            .validate()
            .map_err(|e| RtError::Config(e.to_string()))?;

        realtime::init_process(&config.realtime)?;

        let channel = Channel::bounded(config.channel_capacity)?;
        watchdog.start_monitor()?;

        info!(
            capacity = config.channel_capacity,
            watchdog_timeout_ms = config.watchdog_timeout.as_millis(),
            remainder = ?config.remainder,
            realtime = config.realtime.enabled,
            "Runtime context created"
        );

        Ok(Self {
            context: RuntimeContext {
                config,
                clock,
                channel,
                watchdog: Arc::new(watchdog),
            },
            producer_taken: false,
            consumer_taken: false,
        })
    }

    /// Shared runtime context.
    pub fn context(&self) -> &RuntimeContext<P> {
        &self.context
    }

    /// Take the single producer end of the channel.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::RoleTaken`] if the producer was already handed out.
    pub fn producer(&mut self) -> RtResult<ChannelRole<P>> {
        if std::mem::replace(&mut self.producer_taken, true) {
            return Err(RtError::RoleTaken { role: "producer" });
        }
        Ok(ChannelRole::Producer(Producer::new(self.context.channel.clone())))
    }

    /// Take the single consumer end of the channel.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::RoleTaken`] if the consumer was already handed out.
    pub fn consumer(&mut self) -> RtResult<ChannelRole<P>> {
        if std::mem::replace(&mut self.consumer_taken, true) {
            return Err(RtError::RoleTaken { role: "consumer" });
        }
        Ok(ChannelRole::Consumer(Consumer::new(self.context.channel.clone())))
    }

    /// Spawn a worker thread and wait until it has applied its placement.
    ///
    /// The worker registers with the watchdog before the thread starts if
    /// `spec.supervised` is set.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Config`] for a zero period. Otherwise returns an
    /// error on duplicate worker names, thread spawn failure, or placement
    /// failure with `realtime.fail_fast`.
    pub fn start_periodic_worker<B>(
        &self,
        spec: WorkerSpec,
        role: ChannelRole<P>,
        body: B,
    ) -> RtResult<WorkerHandle>
    where
        B: WorkerBody<P> + 'static,
    {
        if spec.period.is_zero() {
            return Err(RtError::Config(format!(
                "worker '{}' period must be non-zero",
                spec.name
            )));
        }
        let name = spec.name.clone();
        let heartbeat = if spec.supervised {
            Some(self.context.watchdog.register(&name)?)
        } else {
            None
        };

        let realtime_config = self.context.config.realtime.clone();
        let placement = spec.placement;
        let mut worker = PeriodicWorker::new(spec, role, body, self.context.clock.clone());
        if let Some(heartbeat) = heartbeat {
            worker.attach_heartbeat(heartbeat);
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RtResult<PlacementStatus>>(1);
        let thread_name = name.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .stack_size(realtime_config.stack_size)
            .spawn(move || {
                let status = match realtime::apply_placement(&thread_name, &placement, &realtime_config) {
                    Ok(status) => status,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!(
                    worker = %thread_name,
                    priority = placement.priority,
                    affinity = %placement.affinity,
                    cpu = ?realtime::current_cpu(),
                    "Worker started"
                );
                let _ = ready_tx.send(Ok(status));
                worker.run()
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.context.watchdog.deregister(&name);
                return Err(RtError::Init(format!("failed to spawn worker '{name}': {e}")));
            }
        };

        let placement = match ready_rx.recv() {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.context.watchdog.deregister(&name);
                error!(worker = %name, error = %e, "Worker failed to start");
                return Err(e);
            }
            Err(_) => {
                self.context.watchdog.deregister(&name);
                return Err(RtError::Init(format!(
                    "worker '{name}' exited before reporting ready"
                )));
            }
        };

        Ok(WorkerHandle {
            name,
            placement,
            thread,
        })
    }
}
