//! Real-time thread placement and memory locking.
//!
//! Workers call [`apply_placement`] from inside their own thread before the
//! first iteration:
//! - Real-time scheduling (SCHED_FIFO/SCHED_RR) at the worker's priority
//! - CPU affinity pinning the worker to one execution context
//!
//! The orchestrator calls [`init_process`] once to lock memory.
//!
//! Missing privileges degrade to warnings unless `fail_fast` is set.

#![allow(unused_imports)] // Platform-specific code may not use all imports

use rtcore_common::config::{Affinity, RealtimeConfig, SchedPolicy, WorkerPlacement};
use rtcore_common::error::{RtError, RtResult};
use tracing::{debug, info, warn};

/// What was actually applied to a worker thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementStatus {
    /// Applied scheduler policy.
    pub policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub priority: Option<u8>,
    /// Core the thread is pinned to.
    pub pinned_core: Option<usize>,
}

/// Lock process memory if configured.
///
/// # Errors
///
/// Returns an error if locking fails for a reason other than missing
/// privileges, or for missing privileges when `fail_fast` is set.
pub fn init_process(config: &RealtimeConfig) -> RtResult<bool> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(false);
    }
    if !config.lock_memory {
        return Ok(false);
    }
    lock_memory(config.fail_fast)
}

/// Apply priority and affinity to the calling thread.
///
/// # Errors
///
/// Returns [`RtError::Realtime`] when a setting cannot be applied and
/// `fail_fast` is set, or when the request itself is invalid.
pub fn apply_placement(
    worker: &str,
    placement: &WorkerPlacement,
    config: &RealtimeConfig,
) -> RtResult<PlacementStatus> {
    if !config.enabled {
        debug!(worker, "Real-time placement disabled, running with OS defaults");
        return Ok(PlacementStatus::default());
    }

    let (policy, priority) = set_scheduler(config.policy, placement.priority, config.fail_fast)?;
    let pinned_core = set_cpu_affinity(placement.affinity, config.fail_fast)?;

    let status = PlacementStatus {
        policy,
        priority,
        pinned_core,
    };
    debug!(worker, ?status, "Real-time placement applied");
    Ok(status)
}

/// Core the calling thread is currently executing on.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu has no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

/// Core the calling thread is currently executing on.
#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}

/// Turn a privilege failure into a warning or an error depending on `fail_fast`.
fn degrade<T>(fail_fast: bool, what: &str, fallback: T) -> RtResult<T> {
    if fail_fast {
        Err(RtError::Realtime(format!(
            "{what} failed with EPERM (fail_fast=true)"
        )))
    } else {
        warn!("{what} failed with EPERM - running without RT privileges. \
               Consider CAP_SYS_NICE / CAP_IPC_LOCK or running as root.");
        Ok(fallback)
    }
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory(fail_fast: bool) -> RtResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => degrade(fail_fast, "mlockall", false),
        Err(e) => Err(RtError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory(_fail_fast: bool) -> RtResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Set real-time scheduler policy and priority for the calling thread.
#[cfg(target_os = "linux")]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
    fail_fast: bool,
) -> RtResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => {
            debug!("Using SCHED_OTHER (non-RT) scheduling");
            return Ok((Some(SchedPolicy::Other), None));
        }
    };

    // Clamp priority to valid range (1-99 for RT policies)
    let clamped_priority = priority.clamp(1, 99);
    if clamped_priority != priority {
        warn!(
            original = priority,
            clamped = clamped_priority,
            "Scheduler priority clamped to valid range"
        );
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped_priority),
    };

    // SAFETY: pid 0 targets the calling thread; param is a valid pointer
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return degrade(fail_fast, "sched_setscheduler", (None, None));
        }
        return Err(RtError::Realtime(format!("sched_setscheduler failed: {err}")));
    }

    Ok((Some(policy), Some(clamped_priority)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
    _fail_fast: bool,
) -> RtResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(
        ?policy,
        priority, "Real-time scheduling not available on this platform"
    );
    Ok((None, None))
}

/// Pin the calling thread to a core.
#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: Affinity, fail_fast: bool) -> RtResult<Option<usize>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let core = match affinity {
        Affinity::Unconstrained => return Ok(None),
        Affinity::Pinned(core) => core,
    };

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|e| RtError::Realtime(format!("invalid core index {core}: {e}")))?;

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => Ok(Some(core)),
        Err(nix::errno::Errno::EINVAL) => {
            if fail_fast {
                return Err(RtError::Realtime(format!("core {core} does not exist")));
            }
            warn!(core, "Invalid core - running unpinned");
            Ok(None)
        }
        Err(nix::errno::Errno::EPERM) => degrade(fail_fast, "sched_setaffinity", None),
        Err(e) => Err(RtError::Realtime(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: Affinity, _fail_fast: bool) -> RtResult<Option<usize>> {
    if !matches!(affinity, Affinity::Unconstrained) {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}
