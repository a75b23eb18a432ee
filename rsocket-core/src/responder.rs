//! The application-side request handler seam.
//!
//! For each inbound interaction the connection hands the initial payload and
//! a sink bound to the responder-side stream machine. Frames produced
//! through the sink are buffered on the machine and written out by the
//! connection in the same dispatch pass; later pushes go through
//! `ConnectionStateMachine::send_next` and friends using the stream id.

use bytes::Bytes;

use crate::error::{ErrorCode, Result};
use crate::frame::Payload;
use crate::stream::StreamMachine;

/// Application handlers for peer-initiated interactions.
///
/// Every method has a default: fire-and-forget and metadata-push are dropped,
/// the three response-bearing kinds reject with ERROR(REJECTED).
pub trait Responder: Send {
    fn fire_and_forget(&mut self, payload: Payload) {
        let _ = payload;
    }

    fn metadata_push(&mut self, metadata: Bytes) {
        let _ = metadata;
    }

    fn request_response(&mut self, payload: Payload, sink: &mut ResponderSink<'_>) {
        let _ = payload;
        sink.error(ErrorCode::Rejected, "request/response not supported");
    }

    fn request_stream(
        &mut self,
        initial_request_n: u32,
        payload: Payload,
        sink: &mut ResponderSink<'_>,
    ) {
        let _ = (initial_request_n, payload);
        sink.error(ErrorCode::Rejected, "request/stream not supported");
    }

    fn request_channel(
        &mut self,
        initial_request_n: u32,
        payload: Payload,
        sink: &mut ResponderSink<'_>,
    ) {
        let _ = (initial_request_n, payload);
        sink.error(ErrorCode::Rejected, "request/channel not supported");
    }
}

/// A responder that leaves every default in place.
#[derive(Debug, Default)]
pub struct RejectingResponder;

impl Responder for RejectingResponder {}

/// Writer capability handed to responder callbacks, bound to one stream.
pub struct ResponderSink<'a> {
    machine: &'a mut StreamMachine,
}

impl<'a> ResponderSink<'a> {
    pub(crate) fn new(machine: &'a mut StreamMachine) -> Self {
        ResponderSink { machine }
    }

    pub fn stream_id(&self) -> u32 {
        self.machine.stream_id()
    }

    /// Emit one payload, keeping the stream open.
    pub fn next(&mut self, payload: Payload) -> Result<()> {
        self.machine.send_next(payload, false)
    }

    /// Emit the final payload.
    pub fn next_complete(&mut self, payload: Payload) -> Result<()> {
        self.machine.send_next(payload, true)
    }

    /// Complete without a payload.
    pub fn complete(&mut self) -> Result<()> {
        self.machine.send_complete()
    }

    /// Terminate the stream with a stream-level error. Infallible by intent:
    /// a responder that cannot even error has nothing left to do.
    pub fn error(&mut self, code: ErrorCode, message: &str) {
        if let Err(err) = self.machine.send_error(code, message) {
            tracing::debug!(stream_id = self.machine.stream_id(), %err, "sink error dropped");
        }
    }
}
