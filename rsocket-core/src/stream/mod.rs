//! Per-stream state machines and their factory.
//!
//! One machine exists per live stream, keyed by stream id in the
//! connection's demux table. The four interaction patterns are a tagged sum
//! rather than an inheritance tree; the common surface is `on_frame`,
//! `close`, and the drain accessors. Machines never write to the transport:
//! outbound frames are buffered here and drained by the connection, which
//! owns serialization, resume tracking and queueing.

pub mod fire_and_forget;
pub mod request_channel;
pub mod request_response;
pub mod request_stream;

pub use fire_and_forget::FireAndForget;
pub use request_channel::RequestChannel;
pub use request_response::RequestResponse;
pub use request_stream::RequestStream;

use crate::error::{ErrorCode, ProtocolError, Result};
use crate::frame::{Frame, Payload, MAX_STREAM_ID};

/// Which end of the interaction this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Requester,
    Responder,
}

/// Terminal signals a stream can close with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Complete,
    ApplicationError(String),
    Canceled,
    ConnectionError,
    StreamError(String),
    Invalid(String),
}

/// Events surfaced to the application, tagged with the stream id by the
/// connection's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Next(Payload),
    Complete,
    Error { code: ErrorCode, message: String },
    Canceled,
    /// Peer demand. request(n) accounting against the peer is the stream's
    /// (and application's) business, never the multiplexer's.
    RequestN(u32),
}

/// State shared by all four machines: identity, buffered output, buffered
/// events and the terminal latch.
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub stream_id: u32,
    pub side: Side,
    pub out: Vec<Frame>,
    pub events: Vec<StreamEvent>,
    pub terminated: bool,
}

impl StreamCore {
    pub(crate) fn new(stream_id: u32, side: Side) -> Self {
        StreamCore {
            stream_id,
            side,
            out: Vec::new(),
            events: Vec::new(),
            terminated: false,
        }
    }

    pub(crate) fn emit(&mut self, frame: Frame) {
        self.out.push(frame);
    }

    pub(crate) fn event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Close with a terminal signal. Idempotent; surfaces exactly one event.
    pub(crate) fn close(&mut self, signal: StreamSignal) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let event = match signal {
            StreamSignal::Complete => StreamEvent::Complete,
            StreamSignal::ApplicationError(message) => StreamEvent::Error {
                code: ErrorCode::ApplicationError,
                message,
            },
            StreamSignal::Canceled => StreamEvent::Canceled,
            StreamSignal::ConnectionError => StreamEvent::Error {
                code: ErrorCode::ConnectionError,
                message: "connection error".into(),
            },
            StreamSignal::StreamError(message) => StreamEvent::Error {
                code: ErrorCode::Rejected,
                message,
            },
            StreamSignal::Invalid(message) => StreamEvent::Error {
                code: ErrorCode::Invalid,
                message,
            },
        };
        self.events.push(event);
    }
}

/// Tagged sum over the four interaction machines.
#[derive(Debug)]
pub enum StreamMachine {
    FireAndForget(FireAndForget),
    RequestResponse(RequestResponse),
    RequestStream(RequestStream),
    RequestChannel(RequestChannel),
}

impl StreamMachine {
    fn core(&self) -> &StreamCore {
        match self {
            StreamMachine::FireAndForget(m) => &m.core,
            StreamMachine::RequestResponse(m) => &m.core,
            StreamMachine::RequestStream(m) => &m.core,
            StreamMachine::RequestChannel(m) => &m.core,
        }
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        match self {
            StreamMachine::FireAndForget(m) => &mut m.core,
            StreamMachine::RequestResponse(m) => &mut m.core,
            StreamMachine::RequestStream(m) => &mut m.core,
            StreamMachine::RequestChannel(m) => &mut m.core,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.core().stream_id
    }

    pub fn side(&self) -> Side {
        self.core().side
    }

    pub fn is_terminated(&self) -> bool {
        self.core().terminated
    }

    /// Feed one inbound frame routed here by the connection. Never fails:
    /// frames that make no sense for the machine's state are dropped, and
    /// genuinely broken sequences terminate the stream locally.
    pub fn on_frame(&mut self, frame: Frame) {
        match self {
            StreamMachine::FireAndForget(m) => m.on_frame(frame),
            StreamMachine::RequestResponse(m) => m.on_frame(frame),
            StreamMachine::RequestStream(m) => m.on_frame(frame),
            StreamMachine::RequestChannel(m) => m.on_frame(frame),
        }
    }

    /// Close with a terminal signal (no frame emitted; used for teardown).
    pub fn close(&mut self, signal: StreamSignal) {
        self.core_mut().close(signal);
    }

    /// Take buffered outbound frames, oldest first.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.core_mut().out)
    }

    /// Take buffered application events, oldest first.
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.core_mut().events)
    }

    /// Send one payload toward the peer (responder push, or channel send).
    pub fn send_next(&mut self, payload: Payload, complete: bool) -> Result<()> {
        match self {
            StreamMachine::RequestResponse(m) => {
                if !complete {
                    return Err(ProtocolError::InvalidStreamOperation(
                        "request/response replies are single and complete",
                    ));
                }
                m.respond(payload)
            }
            StreamMachine::RequestStream(m) => m.send_next(payload, complete),
            StreamMachine::RequestChannel(m) => m.send_next(payload, complete),
            StreamMachine::FireAndForget(_) => Err(ProtocolError::InvalidStreamOperation(
                "fire-and-forget carries no responses",
            )),
        }
    }

    /// Complete the local sending direction without a payload.
    pub fn send_complete(&mut self) -> Result<()> {
        match self {
            StreamMachine::RequestStream(m) => m.send_complete(),
            StreamMachine::RequestChannel(m) => m.send_complete(),
            _ => Err(ProtocolError::InvalidStreamOperation(
                "completion applies to streams and channels",
            )),
        }
    }

    /// Terminate with a stream-level ERROR frame.
    pub fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<()> {
        if code.is_connection_level() {
            return Err(ProtocolError::InvalidStreamOperation(
                "connection-level error code on a stream",
            ));
        }
        let core = self.core_mut();
        if core.terminated {
            return Err(ProtocolError::StreamNotFound(core.stream_id));
        }
        core.emit(Frame::Error {
            stream_id: core.stream_id,
            code,
            message: message.to_owned(),
        });
        core.terminate();
        Ok(())
    }

    /// Requester-side cancellation: emits CANCEL and terminates.
    pub fn cancel(&mut self) -> Result<()> {
        match self {
            StreamMachine::RequestResponse(m) => m.cancel(),
            StreamMachine::RequestStream(m) => m.cancel(),
            StreamMachine::RequestChannel(m) => m.cancel(),
            StreamMachine::FireAndForget(_) => Err(ProtocolError::InvalidStreamOperation(
                "fire-and-forget cannot be canceled",
            )),
        }
    }

    /// Grant the peer demand for `n` more payloads.
    pub fn request_n(&mut self, n: u32) -> Result<()> {
        match self {
            StreamMachine::RequestStream(m) => m.request_n(n),
            StreamMachine::RequestChannel(m) => m.request_n(n),
            _ => Err(ProtocolError::InvalidStreamOperation(
                "request-n applies to streams and channels",
            )),
        }
    }
}

/// Allocates stream ids with role parity and builds requester machines.
///
/// Clients allocate odd ids from 1, servers even ids from 2, both strictly
/// increasing. Exhausting the 31-bit space is an error, not a wraparound.
#[derive(Debug)]
pub struct StreamsFactory {
    next_id: u32,
    client_role: bool,
}

impl StreamsFactory {
    pub fn for_client() -> Self {
        StreamsFactory {
            next_id: 1,
            client_role: true,
        }
    }

    pub fn for_server() -> Self {
        StreamsFactory {
            next_id: 2,
            client_role: false,
        }
    }

    /// Allocate the next local stream id.
    pub fn next_stream_id(&mut self) -> Result<u32> {
        if self.next_id > MAX_STREAM_ID {
            return Err(ProtocolError::StreamIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 2;
        Ok(id)
    }

    /// Whether `id` is a legal peer-initiated stream id for our role.
    pub fn is_remote_stream_id(&self, id: u32) -> bool {
        id != 0 && (id % 2 == 0) == self.client_role
    }

    pub fn fire_and_forget(&self, stream_id: u32, payload: Payload) -> StreamMachine {
        StreamMachine::FireAndForget(FireAndForget::requester(stream_id, payload))
    }

    pub fn request_response(&self, stream_id: u32, payload: Payload) -> StreamMachine {
        StreamMachine::RequestResponse(RequestResponse::requester(stream_id, payload))
    }

    pub fn request_stream(
        &self,
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
    ) -> StreamMachine {
        StreamMachine::RequestStream(RequestStream::requester(
            stream_id,
            initial_request_n,
            payload,
        ))
    }

    pub fn request_channel(
        &self,
        stream_id: u32,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> StreamMachine {
        StreamMachine::RequestChannel(RequestChannel::requester(
            stream_id,
            initial_request_n,
            complete,
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_odd_and_increasing() {
        let mut factory = StreamsFactory::for_client();
        assert_eq!(factory.next_stream_id().unwrap(), 1);
        assert_eq!(factory.next_stream_id().unwrap(), 3);
        assert_eq!(factory.next_stream_id().unwrap(), 5);
    }

    #[test]
    fn server_ids_are_even_and_increasing() {
        let mut factory = StreamsFactory::for_server();
        assert_eq!(factory.next_stream_id().unwrap(), 2);
        assert_eq!(factory.next_stream_id().unwrap(), 4);
    }

    #[test]
    fn remote_parity_check() {
        let client = StreamsFactory::for_client();
        assert!(client.is_remote_stream_id(2));
        assert!(!client.is_remote_stream_id(3));
        assert!(!client.is_remote_stream_id(0));

        let server = StreamsFactory::for_server();
        assert!(server.is_remote_stream_id(1));
        assert!(!server.is_remote_stream_id(4));
    }

    #[test]
    fn id_space_exhaustion_is_an_error() {
        let mut factory = StreamsFactory::for_client();
        factory.next_id = MAX_STREAM_ID;
        assert_eq!(factory.next_stream_id().unwrap(), MAX_STREAM_ID);
        assert!(matches!(
            factory.next_stream_id(),
            Err(ProtocolError::StreamIdExhausted)
        ));
    }

    #[test]
    fn close_is_idempotent_and_surfaces_one_event() {
        let mut machine = StreamsFactory::for_client()
            .request_stream(1, 8, Payload::from_data(bytes::Bytes::from_static(b"q")));
        machine.drain_frames();
        machine.close(StreamSignal::ConnectionError);
        machine.close(StreamSignal::Complete);
        assert!(machine.is_terminated());
        assert_eq!(machine.drain_events().len(), 1);
    }
}
