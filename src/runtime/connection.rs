//! Connection state machine for the probe's single TCP connection.
//!
//! Tracks where the connection is in its lifecycle and the bytes queued for
//! writing. The socket itself stays with the event-loop backend.

use bytes::{Buf, BytesMut};

/// Current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect in flight.
    Connecting,
    /// Established; probes may be sent.
    Live {
        /// Local port, used in anomaly lines.
        local_port: u16,
    },
    /// Closed by us or the peer. Terminal.
    Closed,
}

#[derive(Debug)]
pub struct Link {
    state: ConnState,
    /// Frames accepted for sending but not yet written to the socket.
    outbound: BytesMut,
}

impl Link {
    /// Create a link in initial connecting state.
    pub fn new() -> Self {
        Self {
            state: ConnState::Connecting,
            outbound: BytesMut::with_capacity(4 * crate::probe::FRAME_SIZE),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Transition to live state.
    pub fn establish(&mut self, local_port: u16) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Live { local_port };
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, ConnState::Live { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Mark the connection closed and drop anything still queued.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closed;
        self.outbound.clear();
        true
    }

    /// Queue a whole frame for writing. Ignored unless live.
    pub fn enqueue(&mut self, frame: &[u8]) -> bool {
        if !self.is_live() {
            return false;
        }
        self.outbound.extend_from_slice(frame);
        true
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drop `n` bytes that the socket accepted.
    pub fn consume(&mut self, n: usize) {
        self.outbound.advance(n.min(self.outbound.len()));
    }

    /// Discard queued bytes after a write failure.
    pub fn discard_outbound(&mut self) {
        self.outbound.clear();
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}
