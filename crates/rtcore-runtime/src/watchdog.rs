//! Watchdog supervisor for worker liveness.
//!
//! Every supervised worker registers at startup and must heartbeat at least
//! once per timeout window. A separate monitor thread checks all
//! registrations; a worker that stays silent for longer than the timeout
//! fires the fatal action exactly once.
//!
//! The default fatal action aborts the process. The watchdog is a last line
//! of defence against a stalled worker, not a performance signal: a missed
//! window is never recovered locally.

use crossbeam_utils::CachePadded;
use rtcore_common::error::{RtError, RtResult};
use rtcore_common::time::{SharedClock, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Details handed to the fatal action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    /// Worker that missed its window.
    pub worker: String,
    /// Time since its last heartbeat.
    pub silent_for: Duration,
    /// Configured timeout.
    pub timeout: Duration,
}

/// Supervisory action run when a registration expires.
pub type FatalAction = Arc<dyn Fn(&Expiry) + Send + Sync>;

/// Fatal action that aborts the process.
pub fn abort_process() -> FatalAction {
    Arc::new(|expiry: &Expiry| {
        error!(
            worker = %expiry.worker,
            silent_ms = expiry.silent_for.as_millis(),
            timeout_ms = expiry.timeout.as_millis(),
            "Watchdog timeout, aborting process"
        );
        std::process::abort();
    })
}

/// Liveness record of one worker.
#[derive(Debug)]
struct Registration {
    worker: String,
    /// Timestamp of the last heartbeat in microseconds.
    last_beat_us: CachePadded<AtomicU64>,
    /// Set once the fatal action has fired for this registration.
    fired: AtomicBool,
}

impl Registration {
    fn beat(&self, now: Timestamp) {
        self.last_beat_us.store(now.as_micros(), Ordering::Release);
    }

    fn silent_for(&self, now: Timestamp) -> Duration {
        let last = Timestamp::from_micros(self.last_beat_us.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }
}

/// Lock-free heartbeat handle returned by [`WatchdogRegistry::register`].
///
/// Workers hold this so the per-iteration heartbeat never touches the
/// registry lock.
#[derive(Clone)]
pub struct Heartbeat {
    registration: Arc<Registration>,
    clock: SharedClock,
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("worker", &self.registration.worker)
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    /// Signal that the worker is alive.
    #[inline]
    pub fn beat(&self) {
        self.registration.beat(self.clock.now());
    }

    /// Worker this handle belongs to.
    pub fn worker(&self) -> &str {
        &self.registration.worker
    }
}

/// State shared with the monitor thread.
struct Inner {
    clock: SharedClock,
    timeout: Duration,
    entries: Mutex<HashMap<String, Arc<Registration>>>,
    on_expire: FatalAction,
    stop_requested: AtomicBool,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Registration>>> {
        // Entries stay consistent even if a holder panicked mid-update
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Expiry> = self
            .entries()
            .values()
            .filter_map(|registration| {
                let silent_for = registration.silent_for(now);
                if silent_for <= self.timeout {
                    return None;
                }
                if registration.fired.swap(true, Ordering::AcqRel) {
                    return None;
                }
                Some(Expiry {
                    worker: registration.worker.clone(),
                    silent_for,
                    timeout: self.timeout,
                })
            })
            .collect();

        // Fatal action runs outside the registry lock
        for expiry in &expired {
            error!(
                worker = %expiry.worker,
                silent_ms = expiry.silent_for.as_millis(),
                "Watchdog timeout! Worker has not sent a heartbeat."
            );
            (self.on_expire)(expiry);
        }
        expired.len()
    }
}

/// Registry of supervised workers plus its monitor thread.
pub struct WatchdogRegistry {
    inner: Arc<Inner>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for WatchdogRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogRegistry")
            .field("timeout", &self.inner.timeout)
            .field("registered", &self.len())
            .finish_non_exhaustive()
    }
}

impl WatchdogRegistry {
    /// Create a registry whose fatal action aborts the process.
    ///
    /// The monitor thread is not started until [`start_monitor`](Self::start_monitor).
    pub fn new(clock: SharedClock, timeout: Duration) -> Self {
        Self::with_fatal_action(clock, timeout, abort_process())
    }

    /// Create a registry with a custom fatal action.
    pub fn with_fatal_action(clock: SharedClock, timeout: Duration, on_expire: FatalAction) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                timeout,
                entries: Mutex::new(HashMap::new()),
                on_expire,
                stop_requested: AtomicBool::new(false),
            }),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Configured timeout window.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of active registrations.
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start supervising `worker`. Counts as its first heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::DuplicateWorker`] if `worker` is already registered.
    pub fn register(&self, worker: &str) -> RtResult<Heartbeat> {
        let mut entries = self.inner.entries();
        if entries.contains_key(worker) {
            return Err(RtError::DuplicateWorker(worker.to_string()));
        }

        let registration = Arc::new(Registration {
            worker: worker.to_string(),
            last_beat_us: CachePadded::new(AtomicU64::new(self.inner.clock.now().as_micros())),
            fired: AtomicBool::new(false),
        });
        entries.insert(worker.to_string(), Arc::clone(&registration));
        drop(entries);

        info!(worker, timeout_ms = self.inner.timeout.as_millis(), "Watchdog registration added");
        Ok(Heartbeat {
            registration,
            clock: Arc::clone(&self.inner.clock),
        })
    }

    /// Heartbeat by worker id.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::UnknownWorker`] if `worker` is not registered.
    pub fn heartbeat(&self, worker: &str) -> RtResult<()> {
        let now = self.inner.clock.now();
        self.inner
            .entries()
            .get(worker)
            .map(|registration| registration.beat(now))
            .ok_or_else(|| RtError::UnknownWorker(worker.to_string()))
    }

    /// Stop supervising `worker`. Returns whether it was registered.
    pub fn deregister(&self, worker: &str) -> bool {
        let removed = self.inner.entries().remove(worker).is_some();
        if removed {
            info!(worker, "Watchdog registration removed");
        }
        removed
    }

    /// Check every registration once and fire expired ones.
    ///
    /// Returns how many fatal actions fired during this call.
    pub fn poll(&self) -> usize {
        self.inner.poll()
    }

    /// Start the monitor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if already running or the thread cannot be spawned.
    pub fn start_monitor(&self) -> RtResult<()> {
        let mut handle_slot = self
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle_slot.is_some() {
            return Err(RtError::Watchdog("watchdog monitor already running".into()));
        }

        // Check 4x per timeout period, never faster than 1ms
        let check_interval = (self.inner.timeout / 4).max(Duration::from_millis(1));
        info!(
            timeout_ms = self.inner.timeout.as_millis(),
            check_interval_ms = check_interval.as_millis(),
            "Starting watchdog monitor"
        );

        self.inner.stop_requested.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("rtcore-watchdog".into())
            .spawn(move || {
                debug!("Watchdog monitor thread started");
                while !inner.stop_requested.load(Ordering::Acquire) {
                    thread::sleep(check_interval);
                    if inner.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    inner.poll();
                }
                debug!("Watchdog monitor thread stopped");
            })
            .map_err(|e| RtError::Init(format!("failed to spawn watchdog thread: {e}")))?;

        *handle_slot = Some(handle);
        Ok(())
    }

    /// Whether the monitor thread is running.
    pub fn is_monitoring(&self) -> bool {
        self.monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the monitor thread and wait for it to exit.
    pub fn stop_monitor(&self) {
        let handle = self
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        info!("Stopping watchdog monitor");
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Err(e) = handle.join() {
            warn!("Watchdog thread panicked: {:?}", e);
        }
    }
}

impl Drop for WatchdogRegistry {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}
