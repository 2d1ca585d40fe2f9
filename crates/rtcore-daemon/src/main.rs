//! rtcore daemon entry point.
//!
//! Starts the four demo workers on top of the runtime: a 1 kHz control
//! producer, a 500 Hz acquisition loop, a channel-consuming comm loop, and
//! an unpinned background loop. Workers never stop; the process runs until
//! it is killed or `--run-for` elapses.

mod workloads;

use anyhow::{Context, Result};
use clap::Parser;
use rtcore_common::config::CoreConfig;
use rtcore_common::time::MonotonicClock;
use rtcore_runtime::orchestrator::Orchestrator;
use rtcore_runtime::worker::{ChannelRole, WorkerSpec};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::workloads::{Background, CommLink, ControlLaw, ControlOutput, SensorSim};

/// rtcore daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "rtcore-daemon",
    about = "Drift-free periodic workers with jitter statistics and watchdog supervision",
    version,
    long_about = None
)]
struct Args {
    /// Path to a runtime configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Exit after this long, e.g. "30s" or "5m" (default: run forever).
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Print the resolved configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        control_hz = config.control_hz,
        acquisition_hz = config.acquisition_hz,
        cpu = ?rtcore_runtime::realtime::current_cpu(),
        "Starting rtcore daemon"
    );

    if let Err(e) = run_daemon(config, args.run_for) {
        error!(error = %e, "Startup failed");
        return Err(e);
    }
    Ok(())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("rtcore_daemon={level},rtcore_runtime={level},rtcore_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `RTCORE_CONFIG_PATH` environment variable
/// 3. `/etc/rtcore/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<CoreConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return CoreConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("RTCORE_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from RTCORE_CONFIG_PATH");
            return CoreConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from RTCORE_CONFIG_PATH={env_path}")
            });
        }
        warn!(
            path = %env_path,
            "RTCORE_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/rtcore/config.toml", "config/default.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(?path, "Loading config file");
            return CoreConfig::from_file(&path)
                .with_context(|| format!("Failed to load config from {candidate}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(CoreConfig::default())
}

/// Worker specs derived from configuration.
fn worker_specs(config: &CoreConfig) -> [WorkerSpec; 4] {
    let base = |name: &str, period: Duration| {
        WorkerSpec::new(name, period)
            .report_interval(config.report_interval)
            .remainder(config.remainder)
    };
    [
        base("control", config.control_period()).placement(config.workers.control),
        base("acquisition", config.acquisition_period())
            .placement(config.workers.acquisition)
            .unsupervised(),
        base("comm", config.comm_period).placement(config.workers.comm),
        base("background", config.background_period)
            .placement(config.workers.background)
            .unsupervised(),
    ]
}

/// Build the runtime, start every worker, then park the main thread.
fn run_daemon(config: CoreConfig, run_for: Option<Duration>) -> Result<()> {
    let [control, acquisition, comm, background] = worker_specs(&config);
    let receive_timeout = config.receive_timeout;
    let io_time = config.comm_io_time;

    let mut orchestrator = Orchestrator::<ControlOutput>::new(config, MonotonicClock::shared())
        .context("Failed to create runtime context")?;

    let producer = orchestrator.producer()?;
    let consumer = orchestrator.consumer()?;
    let watched = orchestrator.context().channel().clone();

    let handles = [
        orchestrator
            .start_periodic_worker(control, producer, ControlLaw)
            .context("Failed to start control worker")?,
        orchestrator
            .start_periodic_worker(acquisition, ChannelRole::None, SensorSim::default())
            .context("Failed to start acquisition worker")?,
        orchestrator
            .start_periodic_worker(comm, consumer, CommLink::new(receive_timeout, io_time))
            .context("Failed to start comm worker")?,
        orchestrator
            .start_periodic_worker(background, ChannelRole::None, Background::new(watched))
            .context("Failed to start background worker")?,
    ];

    info!(
        workers = handles.len(),
        supervised = orchestrator.context().watchdog().len(),
        "All workers started"
    );

    match run_for {
        Some(limit) => {
            std::thread::sleep(limit);
            let channel = orchestrator.context().channel();
            info!(
                ran_for = %humantime::format_duration(limit),
                accepted = channel.accepted(),
                dropped = channel.dropped(),
                occupancy = channel.len(),
                "Run time elapsed, exiting"
            );
            Ok(())
        }
        None => loop {
            std::thread::park();
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcore_common::config::Affinity;
    use std::io::Write;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["rtcore-daemon"]);
        assert!(args.config.is_none());
        assert_eq!(args.log_level, "info");
        assert!(args.run_for.is_none());
        assert!(!args.print_config);
    }

    #[test]
    fn test_args_with_config_and_run_for() {
        let args = Args::parse_from(["rtcore-daemon", "-c", "test.toml", "--run-for", "1m 30s"]);
        assert_eq!(args.config, Some(PathBuf::from("test.toml")));
        assert_eq!(args.run_for, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_args_rejects_bad_duration() {
        assert!(Args::try_parse_from(["rtcore-daemon", "--run-for", "soon"]).is_err());
    }

    #[test]
    fn test_load_config_from_argument() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "control_hz = 2000\nchannel_capacity = 8").unwrap();

        let args = Args::parse_from([
            "rtcore-daemon",
            "--config",
            file.path().to_str().unwrap(),
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.control_hz, 2000);
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.acquisition_hz, 500);
    }

    #[test]
    fn test_load_config_missing_file_is_error() {
        let args = Args::parse_from(["rtcore-daemon", "--config", "/nonexistent/rtcore.toml"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_worker_specs_follow_config() {
        let config = CoreConfig::default();
        let [control, acquisition, comm, background] = worker_specs(&config);

        assert_eq!(control.period, Duration::from_millis(1));
        assert_eq!(control.placement.priority, 24);
        assert_eq!(control.placement.affinity, Affinity::Pinned(0));
        assert!(control.supervised);

        assert_eq!(acquisition.period, Duration::from_millis(2));
        assert!(!acquisition.supervised);

        assert_eq!(comm.placement.affinity, Affinity::Pinned(1));
        assert!(comm.supervised);

        assert_eq!(background.period, Duration::from_millis(50));
        assert_eq!(background.placement.affinity, Affinity::Unconstrained);
        assert!(!background.supervised);
    }
}
