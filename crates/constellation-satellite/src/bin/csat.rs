//! Demo satellite process.
//!
//! Runs a minimal satellite that counts events while in RUN. Useful for
//! bringing up a constellation without hardware attached:
//!
//! ```text
//! csat Sputnik one --group edda --log-level debug
//! ```

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use constellation_core::Configuration;
use constellation_satellite::{
    CommandRegistry, Satellite, SatelliteError, SatelliteHandle, SatelliteOptions, UserCommandError,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csat", about = "Run a demo Constellation satellite", version)]
struct Cli {
    /// Satellite type (class) name.
    satellite_type: String,

    /// Satellite instance name.
    name: String,

    /// Constellation group to join.
    #[arg(long, default_value = "constellation")]
    group: String,

    /// Broadcast address for CHIRP discovery.
    #[arg(long)]
    broadcast: Option<Ipv4Addr>,

    /// Local interface address to bind.
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    /// Log level filter (tracing syntax, e.g. "info" or "constellation=debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// A satellite that produces a counter tick while running.
struct DemoSatellite {
    interval: Duration,
    events: u64,
}

impl Default for DemoSatellite {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            events: 0,
        }
    }
}

#[async_trait]
impl Satellite for DemoSatellite {
    async fn initializing(&mut self, config: &mut Configuration) -> Result<(), SatelliteError> {
        let interval_ms = config.get_or("event_interval_ms", 100_i64)?;
        if interval_ms <= 0 {
            return Err(SatelliteError::new("event_interval_ms must be positive"));
        }
        self.interval = Duration::from_millis(interval_ms.unsigned_abs());
        self.events = 0;
        Ok(())
    }

    async fn starting(&mut self, run_identifier: &str) -> Result<(), SatelliteError> {
        info!(run = run_identifier, "starting event counter");
        self.events = 0;
        Ok(())
    }

    async fn running(&mut self, stop: CancellationToken) -> Result<(), SatelliteError> {
        loop {
            tokio::select! {
                () = stop.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.interval) => {
                    self.events += 1;
                }
            }
        }
    }

    async fn stopping(&mut self) -> Result<(), SatelliteError> {
        info!(events = self.events, "run finished");
        Ok(())
    }
}

enum RunError {
    Configuration(String),
    Runtime(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Configuration(message)) => {
            eprintln!("configuration error: {message}");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(message)) => {
            eprintln!("runtime failure: {message}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let filter = EnvFilter::try_new(&cli.log_level)
        .map_err(|err| RunError::Configuration(format!("invalid log level: {err}")))?;

    let mut options = SatelliteOptions::new(&cli.satellite_type, &cli.name, &cli.group)
        .map_err(|err| RunError::Configuration(err.to_string()))?;
    if let Some(broadcast) = cli.broadcast {
        options.broadcast_addr = broadcast;
    }
    if let Some(interface) = cli.interface {
        options.bind_addr = interface;
    }

    let started = Instant::now();
    let mut registry = CommandRegistry::new();
    registry
        .add(
            "get_uptime",
            "Get seconds since satellite process start",
            &[],
            move || Ok::<_, UserCommandError>(started.elapsed().as_secs()),
        )
        .map_err(|err| RunError::Configuration(err.to_string()))?;

    let handle = SatelliteHandle::spawn(options, DemoSatellite::default(), registry)
        .await
        .map_err(|err| RunError::Runtime(err.to_string()))?;

    // Console logging plus the CMDP mirror for remote listeners.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(handle.monitoring().layer())
        .try_init()
        .map_err(|err| RunError::Runtime(err.to_string()))?;

    info!(
        satellite = handle.canonical_name(),
        port = handle.port(),
        "satellite up"
    );

    let signal_handle = Arc::clone(&handle);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt signal received, shutting down");
            signal_handle.shutdown();
        }
    });

    // A command or discovery loop dying on a socket error is a runtime
    // failure, not a clean exit.
    handle
        .join()
        .await
        .map_err(|err| RunError::Runtime(err.to_string()))
}
