//! Request/response: one request, one payload back, then terminal.

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, Payload};

use super::{Side, StreamCore, StreamEvent};

#[derive(Debug)]
pub struct RequestResponse {
    pub(crate) core: StreamCore,
}

impl RequestResponse {
    pub fn requester(stream_id: u32, payload: Payload) -> Self {
        let mut core = StreamCore::new(stream_id, Side::Requester);
        core.emit(Frame::RequestResponse {
            stream_id,
            follows: false,
            payload,
        });
        RequestResponse { core }
    }

    pub fn responder(stream_id: u32) -> Self {
        RequestResponse {
            core: StreamCore::new(stream_id, Side::Responder),
        }
    }

    pub(crate) fn on_frame(&mut self, frame: Frame) {
        if self.core.terminated {
            return;
        }
        match frame {
            Frame::Payload {
                next,
                complete,
                payload,
                ..
            } if self.core.side == Side::Requester => {
                if next {
                    self.core.event(StreamEvent::Next(payload));
                }
                // The response is single-valued: completion ends the stream.
                if complete {
                    self.core.event(StreamEvent::Complete);
                    self.core.terminate();
                }
            }
            Frame::Error { code, message, .. } => {
                self.core.event(StreamEvent::Error { code, message });
                self.core.terminate();
            }
            Frame::Cancel { .. } => {
                self.core.event(StreamEvent::Canceled);
                self.core.terminate();
            }
            // Demand for the single response is implicit.
            Frame::RequestN { .. } => {}
            other => {
                tracing::debug!(
                    stream_id = self.core.stream_id,
                    frame_type = ?other.frame_type(),
                    "ignoring frame for request/response stream"
                );
            }
        }
    }

    /// Responder reply: one payload carrying NEXT and COMPLETE.
    pub(crate) fn respond(&mut self, payload: Payload) -> Result<()> {
        if self.core.side != Side::Responder {
            return Err(ProtocolError::InvalidStreamOperation(
                "only the responder replies",
            ));
        }
        if self.core.terminated {
            return Err(ProtocolError::InvalidStreamOperation(
                "stream already terminated",
            ));
        }
        self.core.emit(Frame::Payload {
            stream_id: self.core.stream_id,
            follows: false,
            complete: true,
            next: true,
            payload,
        });
        self.core.terminate();
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        if self.core.side != Side::Requester {
            return Err(ProtocolError::InvalidStreamOperation(
                "only the requester cancels",
            ));
        }
        if self.core.terminated {
            return Ok(());
        }
        self.core.emit(Frame::Cancel {
            stream_id: self.core.stream_id,
        });
        self.core.terminate();
        Ok(())
    }
}
