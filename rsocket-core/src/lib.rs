//! RSocket connection state machine and stream multiplexer.
//!
//! A bidirectional, asymmetric application-protocol engine over a single
//! framed transport. One connection multiplexes any number of streams across
//! four interaction patterns:
//! - **Fire-and-forget**: one request, no response
//! - **Request/response**: one request, one response
//! - **Request/stream**: one request, a stream of responses
//! - **Request/channel**: bidirectional payload streams
//!
//! plus the connection-level contract: SETUP handshake, KEEPALIVE liveness,
//! reassembly of fragmented initial requests, ERROR and CANCEL propagation,
//! and warm resumption across transports.
//!
//! The engine is sans-IO: it never opens sockets. The I/O layer feeds
//! complete frame buffers into [`ConnectionStateMachine::process_frame`] and
//! provides a [`FrameTransport`] for the outbound direction. All state runs
//! on one logical executor.

pub mod connection;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod keepalive;
pub mod responder;
pub mod resume;
pub mod serializer;
pub mod stream;
pub mod transport;

// Re-export key public types at crate root.
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionState, ConnectionStateMachine, ResumeCallback,
    ResumeParams, Role, SetupParams,
};
pub use error::{ErrorCode, ProtocolError, Result};
pub use frame::{Flags, Frame, FrameHeader, FrameType, Payload, Version};
pub use responder::{RejectingResponder, Responder, ResponderSink};
pub use resume::ResumeManager;
pub use serializer::FrameSerializer;
pub use stream::{Side, StreamEvent, StreamMachine, StreamSignal, StreamsFactory};
pub use transport::{CloseReason, FrameTransport};
