use thiserror::Error;

/// Error types covering configuration, startup, and supervision failures.
///
/// Transient timing and backpressure conditions are not represented here:
/// schedule overruns are absorbed by the deadline scheduler and channel drops
/// are reported through the channel's own error type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtError {
    /// Configuration or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Startup failure (channel creation, thread spawn, realtime setup).
    #[error("initialization failure: {0}")]
    Init(String),

    /// Watchdog supervisor misuse or failure.
    #[error("watchdog error: {0}")]
    Watchdog(String),

    /// Real-time placement (priority, affinity, memory locking) failed.
    #[error("realtime setup failed: {0}")]
    Realtime(String),

    /// A worker id was used that has no watchdog registration.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// A worker id was registered twice.
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    /// A channel role (producer or consumer) was handed out twice.
    #[error("channel {role} role already assigned")]
    RoleTaken {
        /// Role name ("producer" or "consumer").
        role: &'static str,
    },
}

/// Convenience type alias for rtcore operations.
pub type RtResult<T> = Result<T, RtError>;
