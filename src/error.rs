//! Run-level errors.

use crate::probe::ReassemblyError;
use std::io;

#[derive(Debug)]
pub enum ProbeError {
    /// Target host did not resolve to any address.
    Resolve(String, io::Error),
    /// The one connection attempt failed.
    Connect(io::Error),
    /// Event loop or socket setup failure.
    Io(io::Error),
    /// Writing a report line failed.
    Output(io::Error),
    Reassembly(ReassemblyError),
    #[cfg_attr(any(target_os = "linux", target_os = "macos"), allow(dead_code))]
    Unsupported(&'static str),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Resolve(target, e) => write!(f, "Failed to resolve '{target}': {e}"),
            ProbeError::Connect(e) => write!(f, "Connect error: {e}"),
            ProbeError::Io(e) => write!(f, "I/O error: {e}"),
            ProbeError::Output(e) => write!(f, "Failed to write report: {e}"),
            ProbeError::Reassembly(e) => write!(f, "{e}"),
            ProbeError::Unsupported(msg) => write!(f, "Unsupported: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Resolve(_, e)
            | ProbeError::Connect(e)
            | ProbeError::Io(e)
            | ProbeError::Output(e) => Some(e),
            ProbeError::Reassembly(e) => Some(e),
            ProbeError::Unsupported(_) => None,
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        ProbeError::Io(e)
    }
}

impl From<ReassemblyError> for ProbeError {
    fn from(e: ReassemblyError) -> Self {
        ProbeError::Reassembly(e)
    }
}
