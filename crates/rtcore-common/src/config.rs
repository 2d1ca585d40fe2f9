//! Configuration structures for the rtcore runtime.
//!
//! All knobs are start-time constants. Supports TOML deserialization with
//! defaults matching the reference deployment (1 kHz control, 500 Hz
//! acquisition, 32-slot channel, 10 s watchdog).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Default channel capacity in messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Control loop rate in Hz.
    pub control_hz: u32,

    /// Data acquisition rate in Hz.
    pub acquisition_hz: u32,

    /// Capacity of the control-to-comm channel.
    pub channel_capacity: usize,

    /// Interval between per-worker statistics reports.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,

    /// Watchdog heartbeat timeout (far looser than any worker period).
    #[serde(with = "humantime_serde")]
    pub watchdog_timeout: Duration,

    /// How long the consumer blocks waiting for a message.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Handling of the sub-millisecond part of each wait.
    pub remainder: RemainderPolicy,

    /// Period of the communication (consumer) worker.
    #[serde(with = "humantime_serde")]
    pub comm_period: Duration,

    /// Simulated blocking I/O time per communication iteration.
    #[serde(with = "humantime_serde")]
    pub comm_io_time: Duration,

    /// Period of the background worker.
    #[serde(with = "humantime_serde")]
    pub background_period: Duration,

    /// Real-time configuration.
    pub realtime: RealtimeConfig,

    /// Per-worker priority and affinity.
    pub workers: WorkersConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            control_hz: 1000,
            acquisition_hz: 500,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            report_interval: Duration::from_millis(1000),
            watchdog_timeout: Duration::from_millis(10_000),
            receive_timeout: Duration::from_millis(10),
            remainder: RemainderPolicy::Yield,
            comm_period: Duration::from_millis(10),
            comm_io_time: Duration::from_millis(5),
            background_period: Duration::from_millis(50),
            realtime: RealtimeConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

/// How the scheduler treats the sub-millisecond remainder of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Yield once and return; may wake slightly early.
    #[default]
    Yield,
    /// Spin until the deadline; tighter jitter at the cost of CPU time.
    Spin,
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply thread priorities and affinities (requires privileges).
    pub enabled: bool,

    /// Scheduler policy for prioritised workers.
    pub policy: SchedPolicy,

    /// Lock all memory pages (mlockall) at startup.
    pub lock_memory: bool,

    /// Stack size for worker threads in bytes.
    pub stack_size: usize,

    /// Fail startup if priorities or affinities cannot be applied.
    /// When false, missing privileges only produce warnings.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            lock_memory: true,
            stack_size: 256 * 1024,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// Priority and affinity of every worker the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Control loop (channel producer).
    pub control: WorkerPlacement,
    /// Data acquisition loop.
    pub acquisition: WorkerPlacement,
    /// Communication loop (channel consumer).
    pub comm: WorkerPlacement,
    /// Background housekeeping loop.
    pub background: WorkerPlacement,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            control: WorkerPlacement::pinned(24, 0),
            acquisition: WorkerPlacement::pinned(22, 0),
            comm: WorkerPlacement::pinned(18, 1),
            background: WorkerPlacement {
                priority: 5,
                affinity: Affinity::Unconstrained,
            },
        }
    }
}

/// Where and how urgently a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPlacement {
    /// Scheduler priority (higher runs first).
    pub priority: u8,
    /// Execution context binding.
    #[serde(default)]
    pub affinity: Affinity,
}

impl WorkerPlacement {
    /// Placement pinned to a single core.
    #[must_use]
    pub const fn pinned(priority: u8, core: usize) -> Self {
        Self {
            priority,
            affinity: Affinity::Pinned(core),
        }
    }
}

/// Execution context affinity of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    /// The OS may run the worker on any core.
    #[default]
    Unconstrained,
    /// Bound to one core.
    Pinned(usize),
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::Unconstrained => f.write_str("any"),
            Affinity::Pinned(core) => write!(f, "core{core}"),
        }
    }
}

impl Serialize for Affinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Affinity::Unconstrained => serializer.serialize_str("any"),
            Affinity::Pinned(core) => serializer.serialize_u64(*core as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Affinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct AffinityVisitor;

        impl<'de> Visitor<'de> for AffinityVisitor {
            type Value = Affinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, \"any\", or a core index")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Affinity::Unconstrained)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Affinity::Unconstrained)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "any" | "unconstrained" => Ok(Affinity::Unconstrained),
                    other => Err(de::Error::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(Affinity::Pinned)
                    .map_err(|_| de::Error::custom("core index out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("core index cannot be negative"));
                }
                self.visit_u64(value.unsigned_abs())
            }
        }

        deserializer.deserialize_any(AffinityVisitor)
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Configuration file parsed");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Control loop period derived from `control_hz`.
    #[must_use]
    pub fn control_period(&self) -> Duration {
        period_from_hz(self.control_hz)
    }

    /// Acquisition loop period derived from `acquisition_hz`.
    #[must_use]
    pub fn acquisition_period(&self) -> Duration {
        period_from_hz(self.acquisition_hz)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_hz == 0 || self.control_hz > 1_000_000 {
            return Err(ConfigError::Invalid(format!(
                "control_hz must be within 1..=1000000, got {}",
                self.control_hz
            )));
        }
        if self.acquisition_hz == 0 || self.acquisition_hz > 1_000_000 {
            return Err(ConfigError::Invalid(format!(
                "acquisition_hz must be within 1..=1000000, got {}",
                self.acquisition_hz
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid("report_interval must be non-zero".into()));
        }
        if self.comm_period.is_zero() || self.background_period.is_zero() {
            return Err(ConfigError::Invalid("worker periods must be non-zero".into()));
        }

        let slowest_iteration = [
            self.control_period(),
            self.acquisition_period(),
            self.comm_period
                .max(self.comm_io_time.saturating_add(self.receive_timeout)),
            self.background_period,
        ]
        .into_iter()
        .max()
        .unwrap_or_default();

        if self.watchdog_timeout <= slowest_iteration {
            return Err(ConfigError::Invalid(format!(
                "watchdog_timeout ({}) must exceed the slowest worker iteration ({})",
                humantime::format_duration(self.watchdog_timeout),
                humantime::format_duration(slowest_iteration)
            )));
        }

        Ok(())
    }
}

fn period_from_hz(hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(hz.max(1)))
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
