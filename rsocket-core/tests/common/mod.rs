//! Shared test fixtures: an in-memory frame transport that records what the
//! engine sends, and responders that record what the engine delivers.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use rsocket_core::{
    CloseReason, ErrorCode, Frame, FrameTransport, Payload, Responder, ResponderSink,
};

/// Observation handle for a [`MockTransport`].
#[derive(Clone, Default)]
pub struct TransportLog {
    inner: Arc<Mutex<LogInner>>,
}

#[derive(Default)]
struct LogInner {
    sent: Vec<Bytes>,
    closed: Vec<CloseReason>,
}

impl TransportLog {
    pub fn sent(&self) -> Vec<Bytes> {
        self.inner.lock().sent.clone()
    }

    /// Decode everything sent so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.sent()
            .iter()
            .map(|bytes| Frame::decode(bytes).expect("engine sent an undecodable frame"))
            .collect()
    }

    /// Decode and clear the send log.
    pub fn take_frames(&self) -> Vec<Frame> {
        let sent = std::mem::take(&mut self.inner.lock().sent);
        sent.iter()
            .map(|bytes| Frame::decode(bytes).expect("engine sent an undecodable frame"))
            .collect()
    }

    /// Raw buffers, cleared.
    pub fn take_sent(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn close_reasons(&self) -> Vec<CloseReason> {
        self.inner.lock().closed.clone()
    }

    pub fn sent_error_codes(&self) -> Vec<ErrorCode> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }
}

pub struct MockTransport {
    log: TransportLog,
}

impl FrameTransport for MockTransport {
    fn send_frame(&mut self, frame: Bytes) -> rsocket_core::Result<()> {
        self.log.inner.lock().sent.push(frame);
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        self.log.inner.lock().closed.push(reason);
    }
}

/// A fresh transport plus its observation handle.
pub fn mock_transport() -> (TransportLog, Box<dyn FrameTransport>) {
    let log = TransportLog::default();
    (log.clone(), Box::new(MockTransport { log }))
}

/// Records everything delivered; replies are configurable per kind.
#[derive(Clone, Default)]
pub struct RecordingResponder {
    pub fnf: Arc<Mutex<Vec<Payload>>>,
    pub pushes: Arc<Mutex<Vec<Bytes>>>,
    pub requests: Arc<Mutex<Vec<Payload>>>,
    /// When true, request/response echoes the request data back.
    pub echo: bool,
}

impl RecordingResponder {
    pub fn echoing() -> Self {
        RecordingResponder {
            echo: true,
            ..Default::default()
        }
    }
}

impl Responder for RecordingResponder {
    fn fire_and_forget(&mut self, payload: Payload) {
        self.fnf.lock().push(payload);
    }

    fn metadata_push(&mut self, metadata: Bytes) {
        self.pushes.lock().push(metadata);
    }

    fn request_response(&mut self, payload: Payload, sink: &mut ResponderSink<'_>) {
        self.requests.lock().push(payload.clone());
        if self.echo {
            sink.next_complete(payload)
                .expect("request/response reply failed");
        } else {
            sink.error(ErrorCode::Rejected, "not handled");
        }
    }

    fn request_stream(
        &mut self,
        _initial_request_n: u32,
        payload: Payload,
        _sink: &mut ResponderSink<'_>,
    ) {
        // Delivery is recorded; the test drives any responses later through
        // the connection.
        self.requests.lock().push(payload);
    }

    fn request_channel(
        &mut self,
        _initial_request_n: u32,
        payload: Payload,
        _sink: &mut ResponderSink<'_>,
    ) {
        self.requests.lock().push(payload);
    }
}
