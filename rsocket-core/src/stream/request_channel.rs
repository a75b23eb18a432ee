//! Request/channel: bidirectional payload streams over one stream id.
//!
//! Each direction completes independently; the stream is terminal once both
//! have, or immediately on ERROR or CANCEL. Demand accounting mirrors
//! request/stream but runs in both directions: the initial request-n grants
//! the responder, REQUEST_N frames grant whichever side receives them.

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, Payload};

use super::{Side, StreamCore, StreamEvent};

#[derive(Debug)]
pub struct RequestChannel {
    pub(crate) core: StreamCore,
    local_complete: bool,
    remote_complete: bool,
    /// Payloads we may still send to the peer.
    allowance: u32,
}

impl RequestChannel {
    pub fn requester(
        stream_id: u32,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> Self {
        let mut core = StreamCore::new(stream_id, Side::Requester);
        core.emit(Frame::RequestChannel {
            stream_id,
            follows: false,
            complete,
            initial_request_n,
            payload,
        });
        RequestChannel {
            core,
            local_complete: complete,
            remote_complete: false,
            // The initial request-n grants the responder; our own sends wait
            // for REQUEST_N from the peer.
            allowance: 0,
        }
    }

    pub fn responder(stream_id: u32, granted_n: u32, remote_complete: bool) -> Self {
        RequestChannel {
            core: StreamCore::new(stream_id, Side::Responder),
            local_complete: false,
            remote_complete,
            allowance: granted_n,
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
            } => {
                if next {
                    self.core.event(StreamEvent::Next(payload));
                }
                if complete {
                    self.remote_complete = true;
                    self.core.event(StreamEvent::Complete);
                    self.maybe_terminate();
                }
            }
            Frame::RequestN { n, .. } => {
                self.allowance = self.allowance.saturating_add(n);
                self.core.event(StreamEvent::RequestN(n));
            }
            Frame::Cancel { .. } => {
                self.core.event(StreamEvent::Canceled);
                self.core.terminate();
            }
            Frame::Error { code, message, .. } => {
                self.core.event(StreamEvent::Error { code, message });
                self.core.terminate();
            }
            other => {
                tracing::debug!(
                    stream_id = self.core.stream_id,
                    frame_type = ?other.frame_type(),
                    "ignoring frame for request/channel stream"
                );
            }
        }
    }

    pub(crate) fn send_next(&mut self, payload: Payload, complete: bool) -> Result<()> {
        if self.core.terminated || self.local_complete {
            return Err(ProtocolError::InvalidStreamOperation(
                "sending direction already completed",
            ));
        }
        if self.allowance == 0 {
            return Err(ProtocolError::InvalidStreamOperation(
                "no outstanding demand",
            ));
        }
        self.allowance -= 1;
        self.core.emit(Frame::Payload {
            stream_id: self.core.stream_id,
            follows: false,
            complete,
            next: true,
            payload,
        });
        if complete {
            self.local_complete = true;
            self.maybe_terminate();
        }
        Ok(())
    }

    pub(crate) fn send_complete(&mut self) -> Result<()> {
        if self.core.terminated || self.local_complete {
            return Ok(());
        }
        self.core.emit(Frame::Payload {
            stream_id: self.core.stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::default(),
        });
        self.local_complete = true;
        self.maybe_terminate();
        Ok(())
    }

    pub(crate) fn request_n(&mut self, n: u32) -> Result<()> {
        if self.core.terminated {
            return Err(ProtocolError::InvalidStreamOperation(
                "stream already terminated",
            ));
        }
        self.core.emit(Frame::RequestN {
            stream_id: self.core.stream_id,
            n,
        });
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        if self.core.terminated {
            return Ok(());
        }
        self.core.emit(Frame::Cancel {
            stream_id: self.core.stream_id,
        });
        self.core.terminate();
        Ok(())
    }

    fn maybe_terminate(&mut self) {
        if self.local_complete && self.remote_complete {
            self.core.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn terminal_only_when_both_directions_complete() {
        let mut machine = RequestChannel::responder(2, 4, false);
        machine.send_complete().unwrap();
        assert!(!machine.core.terminated);

        machine.on_frame(Frame::Payload {
            stream_id: 2,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::default(),
        });
        assert!(machine.core.terminated);
    }

    #[test]
    fn requester_waits_for_demand() {
        let mut machine =
            RequestChannel::requester(1, 8, false, Payload::from_data(Bytes::from_static(b"q")));
        assert!(machine
            .send_next(Payload::from_data(Bytes::from_static(b"x")), false)
            .is_err());

        machine.on_frame(Frame::RequestN { stream_id: 1, n: 1 });
        machine
            .send_next(Payload::from_data(Bytes::from_static(b"x")), false)
            .unwrap();
    }

    #[test]
    fn cancel_terminates_immediately() {
        let mut machine = RequestChannel::responder(2, 4, false);
        machine.on_frame(Frame::Cancel { stream_id: 2 });
        assert!(machine.core.terminated);
        // No further sends once canceled.
        assert!(machine
            .send_next(Payload::from_data(Bytes::from_static(b"x")), false)
            .is_err());
    }

    #[test]
    fn initial_complete_marks_local_direction() {
        let mut machine =
            RequestChannel::requester(1, 8, true, Payload::from_data(Bytes::from_static(b"only")));
        machine.on_frame(Frame::Payload {
            stream_id: 1,
            follows: false,
            complete: true,
            next: true,
            payload: Payload::from_data(Bytes::from_static(b"reply")),
        });
        assert!(machine.core.terminated);
    }
}
