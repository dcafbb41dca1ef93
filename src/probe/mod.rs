//! Probe framing, pacing and latency reporting.
//!
//! Everything here is synchronous and I/O-free apart from the `Write`
//! sinks handed to the reporter, so the event-loop backends in
//! `crate::runtime` can share it unchanged.

pub mod frame;
pub mod pacer;
pub mod reassembly;
pub mod report;

pub use frame::FRAME_SIZE;
pub use pacer::{Pacer, PacerAction};
pub use reassembly::{DesyncPolicy, Reassembler, ReassemblyError};
pub use report::{LatencySample, Reporter};
