//! Latency output.
//!
//! Primary stream: one `{ms:.4}` line per echoed frame.
//! Diagnostic stream: `{local_port} {secs} {nanos} {ms:.4}` for every
//! sample above the anomaly threshold.

use crate::clock::Timestamp;
use std::io::{self, Write};

/// One measured round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub elapsed_ms: f64,
    pub anomaly: bool,
}

pub struct Reporter<O, D> {
    out: O,
    diag: D,
    threshold_ms: f64,
    local_port: u16,
}

impl<O: Write, D: Write> Reporter<O, D> {
    pub fn new(out: O, diag: D, threshold_ms: f64) -> Self {
        Self {
            out,
            diag,
            threshold_ms,
            local_port: 0,
        }
    }

    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    /// Write the sample for a frame sent at `start` and received at `now`.
    pub fn report(&mut self, now: Timestamp, start: Timestamp) -> io::Result<LatencySample> {
        let elapsed_ms = now.nanos_since(&start) as f64 / 1e6;
        writeln!(self.out, "{elapsed_ms:.4}")?;

        let anomaly = elapsed_ms > self.threshold_ms;
        if anomaly {
            writeln!(
                self.diag,
                "{} {} {} {:.4}",
                self.local_port, start.secs, start.nanos, elapsed_ms
            )?;
        }

        Ok(LatencySample {
            elapsed_ms,
            anomaly,
        })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.diag.flush()
    }

    #[cfg(test)]
    pub fn into_parts(self) -> (O, D) {
        (self.out, self.diag)
    }
}
