//! Timestamp sources.
//!
//! Probe frames carry the send time as a `(seconds, nanoseconds)` pair.
//! The receive side subtracts that from its own reading of the same clock,
//! so both ends of a measurement must come from one `Clock`.

use clap::ValueEnum;
use serde::Deserialize;

/// A point in time as seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u64,
}

impl Timestamp {
    pub const fn new(secs: u64, nanos: u64) -> Self {
        Self { secs, nanos }
    }

    /// Signed nanoseconds elapsed from `start` to `self`.
    ///
    /// Negative when the clock went backwards between the two readings.
    pub fn nanos_since(&self, start: &Timestamp) -> i128 {
        (self.secs as i128 - start.secs as i128) * 1_000_000_000
            + (self.nanos as i128 - start.nanos as i128)
    }
}

/// Anything that can produce the current time.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Clock used to stamp and measure probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// `CLOCK_MONOTONIC`: immune to wall-clock steps.
    #[default]
    Monotonic,
    /// Wall-clock UTC time.
    Realtime,
}

impl Clock for ClockSource {
    fn now(&self) -> Timestamp {
        match self {
            ClockSource::Monotonic => monotonic_now(),
            ClockSource::Realtime => realtime_now(),
        }
    }
}

#[cfg(unix)]
fn monotonic_now() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return realtime_now();
    }
    Timestamp::new(ts.tv_sec as u64, ts.tv_nsec as u64)
}

#[cfg(not(unix))]
fn monotonic_now() -> Timestamp {
    realtime_now()
}

fn realtime_now() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp::new(
        now.timestamp().max(0) as u64,
        u64::from(now.timestamp_subsec_nanos()),
    )
}

/// Clock frozen at a single instant, for deterministic tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}
