//! Request/stream: one request, a stream of payloads back.
//!
//! The responder may only send while it holds demand granted by the
//! requester's initial request-n and subsequent REQUEST_N frames. That
//! accounting lives here, against the peer; the multiplexer stays out of it.

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, Payload};

use super::{Side, StreamCore, StreamEvent};

#[derive(Debug)]
pub struct RequestStream {
    pub(crate) core: StreamCore,
    /// Responder side: payloads we may still send.
    allowance: u32,
}

impl RequestStream {
    pub fn requester(stream_id: u32, initial_request_n: u32, payload: Payload) -> Self {
        let mut core = StreamCore::new(stream_id, Side::Requester);
        core.emit(Frame::RequestStream {
            stream_id,
            follows: false,
            initial_request_n,
            payload,
        });
        RequestStream { core, allowance: 0 }
    }

    pub fn responder(stream_id: u32, initial_request_n: u32) -> Self {
        RequestStream {
            core: StreamCore::new(stream_id, Side::Responder),
            allowance: initial_request_n,
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
                if complete {
                    self.core.event(StreamEvent::Complete);
                    self.core.terminate();
                }
            }
            Frame::RequestN { n, .. } if self.core.side == Side::Responder => {
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
                    "ignoring frame for request/stream stream"
                );
            }
        }
    }

    pub(crate) fn send_next(&mut self, payload: Payload, complete: bool) -> Result<()> {
        if self.core.side != Side::Responder {
            return Err(ProtocolError::InvalidStreamOperation(
                "only the responder emits stream payloads",
            ));
        }
        if self.core.terminated {
            return Err(ProtocolError::InvalidStreamOperation(
                "stream already terminated",
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
            self.core.terminate();
        }
        Ok(())
    }

    pub(crate) fn send_complete(&mut self) -> Result<()> {
        if self.core.side != Side::Responder {
            return Err(ProtocolError::InvalidStreamOperation(
                "only the responder completes the stream",
            ));
        }
        if self.core.terminated {
            return Ok(());
        }
        self.core.emit(Frame::Payload {
            stream_id: self.core.stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::default(),
        });
        self.core.terminate();
        Ok(())
    }

    pub(crate) fn request_n(&mut self, n: u32) -> Result<()> {
        if self.core.side != Side::Requester {
            return Err(ProtocolError::InvalidStreamOperation(
                "only the requester grants demand",
            ));
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn responder_demand_is_enforced() {
        let mut machine = RequestStream::responder(2, 1);
        machine
            .send_next(Payload::from_data(Bytes::from_static(b"a")), false)
            .unwrap();
        assert!(machine
            .send_next(Payload::from_data(Bytes::from_static(b"b")), false)
            .is_err());

        machine.on_frame(Frame::RequestN { stream_id: 2, n: 2 });
        assert!(matches!(
            machine.core.events.last(),
            Some(StreamEvent::RequestN(2))
        ));
        machine
            .send_next(Payload::from_data(Bytes::from_static(b"b")), false)
            .unwrap();
    }

    #[test]
    fn completion_terminates_both_paths() {
        let mut machine = RequestStream::responder(2, 10);
        machine
            .send_next(Payload::from_data(Bytes::from_static(b"last")), true)
            .unwrap();
        assert!(machine.core.terminated);

        let mut requester =
            RequestStream::requester(1, 10, Payload::from_data(Bytes::from_static(b"q")));
        requester.on_frame(Frame::Payload {
            stream_id: 1,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::default(),
        });
        assert!(requester.core.terminated);
        assert_eq!(requester.core.events, vec![StreamEvent::Complete]);
    }

    #[test]
    fn cancel_from_peer_terminates_responder() {
        let mut machine = RequestStream::responder(2, 5);
        machine.on_frame(Frame::Cancel { stream_id: 2 });
        assert!(machine.core.terminated);
        assert_eq!(machine.core.events, vec![StreamEvent::Canceled]);
    }
}
