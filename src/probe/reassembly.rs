//! Stream reassembly of fixed-width probe frames.
//!
//! TCP delivers echoed frames with arbitrary read boundaries: one read may
//! carry half a frame, several frames, or several frames plus a fragment.
//! `Reassembler` owns a fixed receive region. Each read lands directly
//! after the bytes left over from the previous read (`pending`), then a
//! single scan decodes every complete frame and compacts the tail back to
//! offset 0.

use super::frame::{self, FrameError, FRAME_SIZE, MARKER};
use crate::clock::Timestamp;
use clap::ValueEnum;
use serde::Deserialize;

/// Receive region size.
pub const RECV_CAPACITY: usize = 64 * 1024;

/// What to do when a frame boundary does not start with the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DesyncPolicy {
    /// Stop scanning and discard the rest of the read.
    #[default]
    Halt,
    /// Skip ahead to the next marker byte and keep scanning.
    Resync,
}

/// A non-marker byte found where a frame should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desync {
    /// Offset of the byte within the receive region.
    pub offset: usize,
    pub byte: u8,
    /// Bytes thrown away because of it.
    pub discarded: usize,
}

/// Outcome of one `feed` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedOutcome {
    /// Frames decoded in this pass.
    pub frames: usize,
    /// Bytes retained for the next read.
    pub pending: usize,
    pub desyncs: Vec<Desync>,
}

/// Reassembly errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A read reported more bytes than the free space it was given.
    Overflow { pending: usize, read: usize },
    Frame(FrameError),
}

impl std::fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReassemblyError::Overflow { pending, read } => write!(
                f,
                "receive buffer overflow: {pending} pending + {read} read > {RECV_CAPACITY}"
            ),
            ReassemblyError::Frame(e) => write!(f, "frame decode failed: {e}"),
        }
    }
}

impl std::error::Error for ReassemblyError {}

impl From<FrameError> for ReassemblyError {
    fn from(e: FrameError) -> Self {
        ReassemblyError::Frame(e)
    }
}

pub struct Reassembler {
    buf: Box<[u8]>,
    /// Leftover bytes of an incomplete frame at the start of `buf`.
    pending: usize,
    policy: DesyncPolicy,
}

impl Reassembler {
    pub fn new(policy: DesyncPolicy) -> Self {
        Self {
            buf: vec![0u8; RECV_CAPACITY].into_boxed_slice(),
            pending: 0,
            policy,
        }
    }

    /// Bytes currently held back from an incomplete frame.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Free space after the pending bytes; the next read goes here.
    pub fn read_buf(&mut self) -> &mut [u8] {
        &mut self.buf[self.pending..]
    }

    /// Consume `n` bytes just written into `read_buf()`.
    ///
    /// Decoded send timestamps are appended to `out` in stream order.
    pub fn feed(
        &mut self,
        n: usize,
        out: &mut Vec<Timestamp>,
    ) -> Result<FeedOutcome, ReassemblyError> {
        if n > self.buf.len() - self.pending {
            return Err(ReassemblyError::Overflow {
                pending: self.pending,
                read: n,
            });
        }

        let total = self.pending + n;
        let mut outcome = FeedOutcome::default();
        let mut offset = 0;

        loop {
            if offset >= total {
                self.pending = 0;
                break;
            }

            let byte = self.buf[offset];
            if byte != MARKER {
                let next = match self.policy {
                    DesyncPolicy::Halt => None,
                    DesyncPolicy::Resync => self.buf[offset + 1..total]
                        .iter()
                        .position(|&b| b == MARKER)
                        .map(|pos| offset + 1 + pos),
                };
                let resume = next.unwrap_or(total);
                outcome.desyncs.push(Desync {
                    offset,
                    byte,
                    discarded: resume - offset,
                });
                offset = resume;
                continue;
            }

            if total - offset < FRAME_SIZE {
                self.buf.copy_within(offset..total, 0);
                self.pending = total - offset;
                break;
            }

            out.push(frame::decode(&self.buf[offset..offset + FRAME_SIZE])?);
            outcome.frames += 1;
            offset += FRAME_SIZE;
        }

        debug_assert!(self.pending < FRAME_SIZE);
        outcome.pending = self.pending;
        Ok(outcome)
    }

    /// Copy `bytes` into the receive region and feed them, in as many passes
    /// as the free space requires.
    pub fn feed_slice(
        &mut self,
        mut bytes: &[u8],
        out: &mut Vec<Timestamp>,
    ) -> Result<FeedOutcome, ReassemblyError> {
        let mut total = FeedOutcome::default();
        loop {
            let dst = self.read_buf();
            let n = dst.len().min(bytes.len());
            dst[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];

            let pass = self.feed(n, out)?;
            total.frames += pass.frames;
            total.pending = pass.pending;
            total.desyncs.extend(pass.desyncs);

            if bytes.is_empty() {
                return Ok(total);
            }
        }
    }
}
