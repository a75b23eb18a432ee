//! The frame transport seam.
//!
//! The engine never touches sockets. A `FrameTransport` is an ordered,
//! reliable duplex channel that accepts one complete frame buffer per call
//! downward; the I/O layer delivers inbound buffers by calling
//! `ConnectionStateMachine::process_frame` and reports termination through
//! `ConnectionStateMachine::on_transport_closed`. Partial writes are never
//! exposed: a buffer is either sent whole or the transport errors.

use bytes::Bytes;
use std::fmt;

use crate::error::Result;

/// Why a transport was closed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown requested by the local side.
    Graceful,
    /// Terminated due to a connection-level error.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => write!(f, "graceful close"),
            CloseReason::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

/// Ordered, reliable, byte-framed duplex channel owned by the connection.
pub trait FrameTransport: Send {
    /// Send one complete frame buffer. Ordering across calls is preserved.
    fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Release the underlying channel. Called at most once per transport by
    /// the engine; implementations should tolerate repeats.
    fn close(&mut self, reason: CloseReason);
}
