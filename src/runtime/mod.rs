//! Event-loop backends for the probe.
//!
//! Two single-threaded implementations drive the same `Session`:
//! - mio: readiness-based I/O (epoll on Linux, kqueue on macOS)
//! - tokio: current-thread runtime with `select!`
//!
//! Both share common abstractions:
//! - `Session`: pacing, reassembly and reporting
//! - `Link`: connection state machine and outbound queue

mod connection;
pub mod session;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mio_impl;
mod tokio_impl;

pub use session::{RunStats, Session};

use crate::clock::Clock;
use crate::config::{Config, RuntimeType};
use crate::error::ProbeError;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::debug;

/// Resolve the target to the first address it maps to.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    let target = format!("{host}:{port}");
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Resolve(target.clone(), e))?;
    let addr = addrs.next().ok_or_else(|| {
        ProbeError::Resolve(
            target.clone(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        )
    })?;
    debug!(target = %target, addr = %addr, "Resolved target");
    Ok(addr)
}

/// Run the probe with the configured backend.
pub fn run<C: Clock, O: Write, D: Write>(
    config: &Config,
    session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError> {
    let addr = resolve(&config.host, config.port)?;

    match config.runtime {
        RuntimeType::Mio => run_mio(addr, session),
        RuntimeType::Tokio => tokio_impl::run(addr, session),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_mio<C: Clock, O: Write, D: Write>(
    addr: SocketAddr,
    session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError> {
    mio_impl::run(addr, session)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_mio<C: Clock, O: Write, D: Write>(
    _addr: SocketAddr,
    _session: &mut Session<C, O, D>,
) -> Result<RunStats, ProbeError> {
    Err(ProbeError::Unsupported(
        "the mio runtime only supports Linux and macOS; use --runtime tokio",
    ))
}
