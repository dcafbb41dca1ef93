//! Runtime-independent probe session.
//!
//! Owns the pacer, the receive-side reassembler, the reporter and the run
//! counters. An event loop only has to call `tick` on every timer expiry,
//! read into `recv_buf` and hand the byte count to `on_read`. No I/O happens
//! here other than writing report lines.

use crate::clock::{Clock, Timestamp};
use crate::config::Config;
use crate::error::ProbeError;
use crate::probe::frame;
use crate::probe::{LatencySample, Pacer, PacerAction, Reassembler, Reporter};
use bytes::Bytes;
use std::io::{self, Write};
use tracing::{debug, info, warn};

/// What the event loop should do after a timer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Write this frame.
    Send(Bytes),
    /// Nothing to send (no live connection).
    Skip,
    /// Budget exhausted: stop the timer and close the connection.
    Stop,
    /// Already stopped.
    Done,
}

/// Counters for the end-of-run summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub sent: u64,
    pub received: u64,
    pub anomalies: u64,
    pub desyncs: u64,
    pub write_failures: u64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    sum_ms: f64,
}

impl RunStats {
    fn record(&mut self, sample: &LatencySample) {
        self.received += 1;
        if sample.anomaly {
            self.anomalies += 1;
        }
        self.sum_ms += sample.elapsed_ms;
        self.min_ms = Some(self.min_ms.map_or(sample.elapsed_ms, |m| m.min(sample.elapsed_ms)));
        self.max_ms = Some(self.max_ms.map_or(sample.elapsed_ms, |m| m.max(sample.elapsed_ms)));
    }

    pub fn avg_ms(&self) -> Option<f64> {
        (self.received > 0).then(|| self.sum_ms / self.received as f64)
    }

    /// Probes sent but never seen again.
    pub fn lost(&self) -> u64 {
        self.sent.saturating_sub(self.received)
    }
}

pub struct Session<C, O, D> {
    pacer: Pacer,
    reassembler: Reassembler,
    reporter: Reporter<O, D>,
    clock: C,
    stats: RunStats,
    /// Scratch space for send timestamps decoded from one read.
    decoded: Vec<Timestamp>,
}

impl<C: Clock, O: Write, D: Write> Session<C, O, D> {
    pub fn new(pacer: Pacer, reassembler: Reassembler, reporter: Reporter<O, D>, clock: C) -> Self {
        Self {
            pacer,
            reassembler,
            reporter,
            clock,
            stats: RunStats::default(),
            decoded: Vec::with_capacity(64),
        }
    }

    /// Build a session from resolved configuration, drawing the startup
    /// jitter from the thread RNG.
    pub fn from_config(config: &Config, clock: C, out: O, diag: D) -> Self {
        let pacer = Pacer::with_jitter(
            config.count,
            config.interval,
            config.initial_delay,
            config.jitter,
            &mut rand::thread_rng(),
        );
        Self::new(
            pacer,
            Reassembler::new(config.desync),
            Reporter::new(out, diag, config.anomaly_threshold_ms),
            clock,
        )
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn pacer_mut(&mut self) -> &mut Pacer {
        &mut self.pacer
    }

    #[cfg(test)]
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.pacer.is_stopped()
    }

    pub fn on_connected(&mut self, local_port: u16) {
        self.reporter.set_local_port(local_port);
    }

    /// Advance the pacer by one tick.
    pub fn tick(&mut self, connected: bool) -> TickAction {
        match self.pacer.tick(connected) {
            PacerAction::Emit => {
                self.stats.sent += 1;
                TickAction::Send(frame::encode(self.clock.now()))
            }
            PacerAction::Skip => {
                debug!(tick = self.pacer.ticks(), "No connection, probe dropped");
                TickAction::Skip
            }
            PacerAction::Stop => {
                debug!(sent = self.stats.sent, "Probe budget exhausted");
                TickAction::Stop
            }
            PacerAction::Done => TickAction::Done,
        }
    }

    /// Where the next read should be written.
    pub fn recv_buf(&mut self) -> &mut [u8] {
        self.reassembler.read_buf()
    }

    /// Process `n` bytes just read into `recv_buf()`.
    ///
    /// Returns the number of latency samples reported.
    pub fn on_read(&mut self, n: usize) -> Result<usize, ProbeError> {
        let now = self.clock.now();
        self.decoded.clear();
        let outcome = self.reassembler.feed(n, &mut self.decoded)?;
        self.report_decoded(now, &outcome.desyncs)
    }

    /// Process bytes read into a buffer other than `recv_buf()`.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<usize, ProbeError> {
        let now = self.clock.now();
        self.decoded.clear();
        let outcome = self.reassembler.feed_slice(bytes, &mut self.decoded)?;
        self.report_decoded(now, &outcome.desyncs)
    }

    fn report_decoded(
        &mut self,
        now: Timestamp,
        desyncs: &[crate::probe::reassembly::Desync],
    ) -> Result<usize, ProbeError> {
        for d in desyncs {
            self.stats.desyncs += 1;
            warn!(
                offset = d.offset,
                byte = d.byte,
                discarded = d.discarded,
                "Frame stream desynchronized"
            );
        }

        for start in &self.decoded {
            let sample = self
                .reporter
                .report(now, *start)
                .map_err(ProbeError::Output)?;
            self.stats.record(&sample);
        }
        Ok(self.decoded.len())
    }

    pub fn on_write_failure(&mut self, err: &io::Error) {
        self.stats.write_failures += 1;
        warn!(error = %err, "Write error");
    }

    /// Flush the report streams and log the run summary.
    pub fn finish(&mut self) -> Result<RunStats, ProbeError> {
        self.reporter.flush().map_err(ProbeError::Output)?;

        let stats = self.stats.clone();
        info!(
            sent = stats.sent,
            received = stats.received,
            lost = stats.lost(),
            anomalies = stats.anomalies,
            desyncs = stats.desyncs,
            write_failures = stats.write_failures,
            min_ms = stats.min_ms.unwrap_or(0.0),
            avg_ms = stats.avg_ms().unwrap_or(0.0),
            max_ms = stats.max_ms.unwrap_or(0.0),
            "Probe run complete"
        );
        Ok(stats)
    }

    #[cfg(test)]
    pub fn into_reporter(self) -> Reporter<O, D> {
        self.reporter
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::probe::DesyncPolicy;
    use std::time::Duration;

    pub(crate) type TestSession = Session<FixedClock, Vec<u8>, Vec<u8>>;

    pub(crate) fn session(budget: u64, now: Timestamp) -> TestSession {
        session_with_delay(budget, now, Duration::ZERO)
    }

    pub(crate) fn session_with_delay(
        budget: u64,
        now: Timestamp,
        initial_delay: Duration,
    ) -> TestSession {
        Session::new(
            Pacer::new(budget, Duration::from_millis(10), initial_delay),
            Reassembler::new(DesyncPolicy::Halt),
            Reporter::new(Vec::new(), Vec::new(), 500.0),
            FixedClock(now),
        )
    }

    pub(crate) fn output(session: TestSession) -> (String, String) {
        let (out, diag) = session.into_reporter().into_parts();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(diag).unwrap(),
        )
    }

    #[test]
    fn test_split_echo_yields_one_sample() {
        let start = Timestamp::new(100, 200_000_000);
        let echoed = frame::encode(start);
        let mut s = session(1, Timestamp::new(100, 201_500_000));

        assert_eq!(s.on_bytes(&echoed[..10]).unwrap(), 0);
        assert_eq!(s.on_bytes(&echoed[10..]).unwrap(), 1);
        assert_eq!(s.stats().received, 1);

        let (out, diag) = output(s);
        assert_eq!(out, "1.5000\n");
        assert_eq!(diag, "");
    }

    #[test]
    fn test_on_read_uses_recv_buf() {
        let start = Timestamp::new(5, 0);
        let echoed = frame::encode(start);
        let mut s = session(1, Timestamp::new(5, 3_000_000));

        s.recv_buf()[..echoed.len()].copy_from_slice(&echoed);
        assert_eq!(s.on_read(echoed.len()).unwrap(), 1);
        assert_eq!(output(s).0, "3.0000\n");
    }

    #[test]
    fn test_non_marker_stream_yields_nothing() {
        let mut s = session(1, Timestamp::new(1, 0));
        let mut bytes = vec![b'?'];
        bytes.extend_from_slice(&frame::encode(Timestamp::new(1, 0)));

        assert_eq!(s.on_bytes(&bytes).unwrap(), 0);
        assert_eq!(s.stats().desyncs, 1);
        assert_eq!(output(s).0, "");
    }

    #[test]
    fn test_anomaly_line_uses_local_port() {
        let mut s = session(1, Timestamp::new(11, 0));
        s.on_connected(51000);
        s.on_bytes(&frame::encode(Timestamp::new(10, 0))).unwrap();
        assert_eq!(s.stats().anomalies, 1);

        let (out, diag) = output(s);
        assert_eq!(out, "1000.0000\n");
        assert_eq!(diag, "51000 10 0 1000.0000\n");
    }

    #[test]
    fn test_tick_sends_current_time() {
        let now = Timestamp::new(42, 7);
        let mut s = session(2, now);

        assert_eq!(s.tick(false), TickAction::Skip);
        match s.tick(true) {
            TickAction::Send(bytes) => assert_eq!(frame::decode(&bytes).unwrap(), now),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(s.tick(true), TickAction::Stop);
        assert!(s.is_finished());
        assert_eq!(s.tick(true), TickAction::Done);
        assert_eq!(s.stats().sent, 1);
    }

    #[test]
    fn test_stats() {
        let mut s = session(3, Timestamp::new(0, 0));
        for _ in 0..3 {
            s.tick(true);
        }
        // Stamps chosen so that elapsed is 2ms and 4ms
        let clock_now = Timestamp::new(10, 0);
        s.clock = FixedClock(clock_now);
        s.on_bytes(&frame::encode(Timestamp::new(9, 998_000_000)))
            .unwrap();
        s.on_bytes(&frame::encode(Timestamp::new(9, 996_000_000)))
            .unwrap();

        let stats = s.finish().unwrap();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.lost(), 1);
        assert_eq!(stats.min_ms, Some(2.0));
        assert_eq!(stats.max_ms, Some(4.0));
        assert_eq!(stats.avg_ms(), Some(3.0));
    }

    #[test]
    fn test_write_failure_is_counted() {
        let mut s = session(1, Timestamp::new(0, 0));
        s.on_write_failure(&io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(s.stats().write_failures, 1);
    }
}
