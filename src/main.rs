//! latency-probe: TCP round-trip latency measurement
//!
//! Opens one connection to an echo server, sends a timestamped 64-byte
//! frame at a fixed interval, and prints the round-trip time of every frame
//! that comes back.
//!
//! Features:
//! - Stream reassembly of echoed frames across arbitrary read boundaries
//! - Randomized startup delay to spread out many concurrent probes
//! - Anomaly lines on stderr for slow round trips
//! - mio or tokio single-threaded backends
//! - Configuration via CLI arguments or TOML file

mod clock;
mod config;
mod error;
mod probe;
mod runtime;

use config::Config;
use runtime::Session;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for latency lines
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        count = config.count,
        interval_ms = config.interval.as_millis() as u64,
        runtime = ?config.runtime,
        clock = ?config.clock,
        desync = ?config.desync,
        "Starting latency-probe"
    );

    let mut session = Session::from_config(
        &config,
        config.clock,
        std::io::stdout(),
        std::io::stderr(),
    );
    runtime::run(&config, &mut session)?;
    Ok(())
}
