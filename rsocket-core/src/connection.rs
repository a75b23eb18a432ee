//! Connection state machine and stream multiplexer.
//!
//! Owns one transport at a time and everything multiplexed over it: the
//! demux table of per-stream machines, the first-frame fragment
//! accumulators, the serializer, the keepalive clock and the pending-frame
//! queue. All state lives on a single logical executor; nothing here locks
//! except the resume cache, which is shared with the caller's session store.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected`, with `Resuming` and
//! a return to `Disconnected` available only to resumable sessions, and
//! `Closed` terminal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ErrorCode, ProtocolError, Result};
use crate::fragment::FragmentAccumulator;
use crate::frame::{Frame, Payload, Version};
use crate::keepalive::KeepaliveTimer;
use crate::responder::{Responder, ResponderSink};
use crate::resume::ResumeManager;
use crate::serializer::FrameSerializer;
use crate::stream::{
    RequestChannel, RequestResponse, RequestStream, StreamEvent, StreamMachine, StreamSignal,
    StreamsFactory,
};
use crate::transport::{CloseReason, FrameTransport};

/// Which side of the connection we are. Fixed at construction; decides
/// stream id parity and who drives keepalive probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport bound. Streams and caches survive here for resumable
    /// sessions.
    Disconnected,
    /// Transport bound, handshake in flight.
    Connecting,
    /// Handshake (SETUP or RESUME_OK) exchanged.
    Connected,
    /// Transport bound, waiting for the peer to acknowledge our resume
    /// position.
    Resuming,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Resuming => write!(f, "Resuming"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Static configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version to speak. `None` enables auto-detection from the
    /// first inbound frame (servers only; clients always declare).
    pub version: Option<Version>,
    /// Upper bound on a reassembled initial request.
    pub max_fragment_bytes: usize,
    /// Retention budget for the outbound resume cache.
    pub resume_capacity_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: Some(Version::V1),
            max_fragment_bytes: 16 * 1024 * 1024,
            resume_capacity_bytes: 2 * 1024 * 1024,
        }
    }
}

/// SETUP handshake parameters, as sent by a client or as decoded from a
/// received SETUP on the server side.
#[derive(Debug, Clone)]
pub struct SetupParams {
    pub version: Version,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub resume_token: Option<Bytes>,
    pub lease: bool,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

impl Default for SetupParams {
    fn default() -> Self {
        Self {
            version: Version::V1,
            keepalive_interval: Duration::from_millis(30_000),
            max_lifetime: Duration::from_millis(90_000),
            resume_token: None,
            lease: false,
            metadata_mime_type: "application/octet-stream".into(),
            data_mime_type: "application/octet-stream".into(),
            payload: Payload::default(),
        }
    }
}

impl SetupParams {
    /// Extract parameters from a decoded SETUP frame (server accept path).
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let Frame::Setup {
            version,
            keepalive_interval_ms,
            max_lifetime_ms,
            resume_token,
            lease,
            metadata_mime_type,
            data_mime_type,
            payload,
        } = frame
        else {
            return None;
        };
        Some(SetupParams {
            version: *version,
            keepalive_interval: Duration::from_millis(u64::from(*keepalive_interval_ms)),
            max_lifetime: Duration::from_millis(u64::from(*max_lifetime_ms)),
            resume_token: resume_token.clone(),
            lease: *lease,
            metadata_mime_type: metadata_mime_type.clone(),
            data_mime_type: data_mime_type.clone(),
            payload: payload.clone(),
        })
    }
}

/// RESUME handshake parameters (server accept path).
#[derive(Debug, Clone)]
pub struct ResumeParams {
    pub version: Version,
    pub token: Bytes,
    pub last_received_server_position: u64,
    pub first_available_client_position: u64,
}

impl ResumeParams {
    /// Extract parameters from a decoded RESUME frame.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let Frame::Resume {
            version,
            token,
            last_received_server_position,
            first_available_client_position,
        } = frame
        else {
            return None;
        };
        Some(ResumeParams {
            version: *version,
            token: token.clone(),
            last_received_server_position: *last_received_server_position,
            first_available_client_position: *first_available_client_position,
        })
    }
}

/// Connection-level notifications for the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Resumed,
    Disconnected,
    Closed { code: ErrorCode, message: String },
}

/// Fired once when a client-side resume concludes.
pub type ResumeCallback = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Debug)]
struct LeaseState {
    permits: u32,
    expires_at: Instant,
}

/// The top-level protocol controller.
pub struct ConnectionStateMachine {
    role: Role,
    state: ConnectionState,
    serializer: FrameSerializer,
    transport: Option<Box<dyn FrameTransport>>,
    streams: HashMap<u32, StreamMachine>,
    fragments: HashMap<u32, FragmentAccumulator>,
    factory: StreamsFactory,
    responder: Box<dyn Responder>,
    resume: Option<Arc<Mutex<ResumeManager>>>,
    resume_token: Option<Bytes>,
    resume_callback: Option<ResumeCallback>,
    keepalive: Option<KeepaliveTimer>,
    pending: VecDeque<Frame>,
    stream_events: VecDeque<(u32, StreamEvent)>,
    connection_events: VecDeque<ConnectionEvent>,
    lease: Option<LeaseState>,
    lease_honored: bool,
    /// Highest peer-initiated stream id seen; new remote streams must be
    /// strictly above it.
    last_remote_stream_id: u32,
    max_fragment_bytes: usize,
    resume_capacity: usize,
}

impl ConnectionStateMachine {
    pub fn new(role: Role, responder: Box<dyn Responder>, config: ConnectionConfig) -> Result<Self> {
        let serializer = match config.version {
            Some(version) => FrameSerializer::with_version(version)?,
            None => FrameSerializer::detecting(),
        };
        let factory = match role {
            Role::Client => StreamsFactory::for_client(),
            Role::Server => StreamsFactory::for_server(),
        };
        Ok(ConnectionStateMachine {
            role,
            state: ConnectionState::Disconnected,
            serializer,
            transport: None,
            streams: HashMap::new(),
            fragments: HashMap::new(),
            factory,
            responder,
            resume: None,
            resume_token: None,
            resume_callback: None,
            keepalive: None,
            pending: VecDeque::new(),
            stream_events: VecDeque::new(),
            connection_events: VecDeque::new(),
            lease: None,
            lease_honored: false,
            last_remote_stream_id: 0,
            max_fragment_bytes: config.max_fragment_bytes,
            resume_capacity: config.resume_capacity_bytes,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_resumable(&self) -> bool {
        self.resume.is_some()
    }

    /// Shared handle to the resume cache, for the caller's session store.
    pub fn resume_manager(&self) -> Option<Arc<Mutex<ResumeManager>>> {
        self.resume.clone()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn has_fragment(&self, stream_id: u32) -> bool {
        self.fragments.contains_key(&stream_id)
    }

    /// Next queued per-stream event, oldest first.
    pub fn poll_event(&mut self) -> Option<(u32, StreamEvent)> {
        self.stream_events.pop_front()
    }

    /// Next queued connection-level event, oldest first.
    pub fn poll_connection_event(&mut self) -> Option<ConnectionEvent> {
        self.connection_events.pop_front()
    }

    // ------------------------------------------------------------------
    // Handshake and lifecycle
    // ------------------------------------------------------------------

    /// Client side: bind the transport and send SETUP.
    pub fn connect_client(
        &mut self,
        transport: Box<dyn FrameTransport>,
        params: SetupParams,
    ) -> Result<()> {
        self.require_role(Role::Client)?;
        self.require_state(ConnectionState::Disconnected, "Connecting")?;
        self.serializer = FrameSerializer::with_version(params.version)?;

        self.transport = Some(transport);
        self.state = ConnectionState::Connecting;

        if let Some(token) = &params.resume_token {
            self.resume = Some(Arc::new(Mutex::new(ResumeManager::new(self.resume_capacity))));
            self.resume_token = Some(token.clone());
        }

        let setup = Frame::Setup {
            version: params.version,
            keepalive_interval_ms: params.keepalive_interval.as_millis() as u32,
            max_lifetime_ms: params.max_lifetime.as_millis() as u32,
            resume_token: params.resume_token.clone(),
            lease: params.lease,
            metadata_mime_type: params.metadata_mime_type.clone(),
            data_mime_type: params.data_mime_type.clone(),
            payload: params.payload.clone(),
        };
        if let Err(err) = self.send_now(setup) {
            self.release_transport(CloseReason::Error("setup send failed".into()));
            self.state = ConnectionState::Closed;
            return Err(err);
        }

        self.lease_honored = params.lease;
        self.keepalive = Some(KeepaliveTimer::new(
            params.keepalive_interval,
            params.max_lifetime,
            Instant::now(),
        ));
        self.state = ConnectionState::Connected;
        self.connection_events.push_back(ConnectionEvent::Connected);
        self.send_pending()
    }

    /// Server side: apply an already-received SETUP and bind the transport.
    pub fn connect_server(
        &mut self,
        transport: Box<dyn FrameTransport>,
        params: SetupParams,
    ) -> Result<()> {
        self.require_role(Role::Server)?;
        self.require_state(ConnectionState::Disconnected, "Connected")?;

        self.transport = Some(transport);
        match self.serializer.version() {
            Some(version) if version != params.version => {
                self.close_with_error(ErrorCode::UnsupportedSetup, "protocol version mismatch");
                return Err(ProtocolError::UnsupportedVersion {
                    major: params.version.major,
                    minor: params.version.minor,
                });
            }
            Some(_) => {}
            None => match FrameSerializer::with_version(params.version) {
                Ok(serializer) => self.serializer = serializer,
                Err(err) => {
                    self.close_with_error(ErrorCode::UnsupportedSetup, "unsupported version");
                    return Err(err);
                }
            },
        }

        if let Some(token) = &params.resume_token {
            self.resume = Some(Arc::new(Mutex::new(ResumeManager::new(self.resume_capacity))));
            self.resume_token = Some(token.clone());
        }
        self.lease_honored = params.lease;
        self.keepalive = Some(KeepaliveTimer::new(
            params.keepalive_interval,
            params.max_lifetime,
            Instant::now(),
        ));
        self.state = ConnectionState::Connected;
        self.connection_events.push_back(ConnectionEvent::Connected);
        self.send_pending()
    }

    /// Client side: bind a fresh transport and ask the server to resume.
    ///
    /// `callback` fires exactly once: with `Ok` on RESUME_OK, with the error
    /// on rejection or if the connection dies while resuming.
    pub fn resume_client(
        &mut self,
        token: Bytes,
        transport: Box<dyn FrameTransport>,
        callback: ResumeCallback,
        version: Version,
    ) -> Result<()> {
        self.require_role(Role::Client)?;
        let Some(resume) = self.resume.clone() else {
            return Err(ProtocolError::ResumeRejected(
                "session is not resumable".into(),
            ));
        };
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connected
        ) {
            return Err(ProtocolError::InvalidStateTransition {
                from: self.state.to_string(),
                to: "Resuming".into(),
            });
        }
        if self.serializer.version().is_none() {
            self.serializer = FrameSerializer::with_version(version)?;
        }

        // A still-attached transport is replaced atomically; its loss has
        // simply not been observed yet.
        self.replace_transport(transport);
        self.state = ConnectionState::Resuming;
        self.resume_token = Some(token.clone());
        self.resume_callback = Some(callback);

        let (server_position, client_position) = {
            let cache = resume.lock();
            (
                cache.last_received_position(),
                cache.first_available_position(),
            )
        };
        let frame = Frame::Resume {
            version,
            token,
            last_received_server_position: server_position,
            first_available_client_position: client_position,
        };
        self.send_now(frame)?;
        if let Some(keepalive) = &mut self.keepalive {
            keepalive.rearm(Instant::now());
        }
        Ok(())
    }

    /// Server side: evaluate a RESUME request against the retained cache.
    ///
    /// On success sends RESUME_OK and replays every cached frame at or past
    /// the client's last received position, keeping streams live. On failure
    /// sends ERROR(REJECTED_RESUME) and closes.
    pub fn resume_server(
        &mut self,
        transport: Box<dyn FrameTransport>,
        params: ResumeParams,
    ) -> bool {
        if self.role != Role::Server || self.state == ConnectionState::Closed {
            return false;
        }
        self.replace_transport(transport);

        let acceptable = self.resume_token.as_ref() == Some(&params.token)
            && match &self.resume {
                Some(resume) => {
                    let cache = resume.lock();
                    params.first_available_client_position <= cache.last_received_position()
                        && cache.is_position_available(params.last_received_server_position)
                }
                None => false,
            };
        if !acceptable {
            self.close_with_error(ErrorCode::RejectedResume, "resume position unavailable");
            return false;
        }

        let resume = self.resume.clone();
        let (ack_position, replay) = match &resume {
            Some(resume) => {
                let cache = resume.lock();
                (
                    cache.last_received_position(),
                    cache
                        .replay_from(params.last_received_server_position)
                        .unwrap_or_default(),
                )
            }
            None => (0, Vec::new()),
        };

        let ok = Frame::ResumeOk {
            last_received_client_position: ack_position,
        };
        if self.send_now(ok).is_err() {
            self.release_transport(CloseReason::Error("resume acknowledgment failed".into()));
            return false;
        }
        for bytes in replay {
            // Already serialized and cached; do not re-track.
            if let Err(err) = self.send_raw(bytes) {
                warn!(%err, "replay write failed");
                self.release_transport(CloseReason::Error("replay failed".into()));
                return false;
            }
        }

        if let Some(keepalive) = &mut self.keepalive {
            keepalive.rearm(Instant::now());
        }
        self.state = ConnectionState::Connected;
        self.connection_events.push_back(ConnectionEvent::Resumed);
        let _ = self.send_pending();
        true
    }

    /// Detach the transport but keep streams and caches, if resumable;
    /// otherwise close with a connection error.
    pub fn disconnect(&mut self, cause: &str) {
        if !self.is_resumable() {
            self.close_with_error(ErrorCode::ConnectionError, cause);
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Resuming
        ) {
            return;
        }
        if self.state == ConnectionState::Resuming {
            self.fail_resume_callback(cause);
        }
        self.release_transport(CloseReason::Error(cause.to_owned()));
        self.state = ConnectionState::Disconnected;
        self.connection_events
            .push_back(ConnectionEvent::Disconnected);
    }

    /// Orderly local shutdown: streams complete, transport released, no
    /// ERROR frame on the wire. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.fail_resume_callback("connection closed");
        self.close_streams(StreamSignal::Complete);
        self.release_transport(CloseReason::Graceful);
        self.keepalive = None;
        self.state = ConnectionState::Closed;
        self.connection_events.push_back(ConnectionEvent::Closed {
            code: ErrorCode::ConnectionClose,
            message: String::new(),
        });
    }

    /// Fatal shutdown: best-effort ERROR at stream 0, every stream signaled
    /// with a connection error, transport released. Idempotent.
    pub fn close_with_error(&mut self, code: ErrorCode, message: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Ok(bytes) = self.serializer.serialize(&Frame::Error {
            stream_id: 0,
            code,
            message: message.to_owned(),
        }) {
            if let Some(transport) = self.transport.as_mut() {
                let _ = transport.send_frame(bytes);
            }
        }
        self.fail_resume_callback(message);
        self.close_streams(StreamSignal::ConnectionError);
        self.release_transport(CloseReason::Error(message.to_owned()));
        self.keepalive = None;
        self.state = ConnectionState::Closed;
        self.connection_events.push_back(ConnectionEvent::Closed {
            code,
            message: message.to_owned(),
        });
    }

    /// Resumable sessions detach; everything else dies.
    pub fn disconnect_or_close_with_error(&mut self, code: ErrorCode, message: &str) {
        if self.is_resumable() {
            self.disconnect(message);
        } else {
            self.close_with_error(code, message);
        }
    }

    /// Atomically swap in a fresh transport, closing the prior one. Stream
    /// state is preserved. Only legal for resumable sessions.
    pub fn reconnect(&mut self, transport: Box<dyn FrameTransport>) -> Result<()> {
        if !self.is_resumable() {
            return Err(ProtocolError::ResumeRejected(
                "reconnect requires a resumable session".into(),
            ));
        }
        if self.state == ConnectionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.replace_transport(transport);
        if let Some(keepalive) = &mut self.keepalive {
            keepalive.rearm(Instant::now());
        }
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connected;
            self.connection_events.push_back(ConnectionEvent::Connected);
            self.send_pending()?;
        }
        Ok(())
    }

    /// The I/O layer observed the transport die.
    pub fn on_transport_closed(&mut self, cause: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        // The channel is already gone; just drop the handle.
        self.transport = None;
        if self.is_resumable()
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Resuming
            )
        {
            if self.state == ConnectionState::Resuming {
                self.fail_resume_callback(cause);
            }
            self.state = ConnectionState::Disconnected;
            self.connection_events
                .push_back(ConnectionEvent::Disconnected);
        } else {
            self.fail_resume_callback(cause);
            self.close_streams(StreamSignal::ConnectionError);
            self.keepalive = None;
            self.state = ConnectionState::Closed;
            self.connection_events.push_back(ConnectionEvent::Closed {
                code: ErrorCode::ConnectionError,
                message: cause.to_owned(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Send a fire-and-forget request. No stream entry outlives the send.
    pub fn fire_and_forget(&mut self, payload: Payload) -> Result<u32> {
        self.require_open()?;
        self.consume_lease()?;
        let stream_id = self.allocate_stream_id()?;
        let mut machine = self.factory.fire_and_forget(stream_id, payload);
        for frame in machine.drain_frames() {
            self.write_frame(frame)?;
        }
        Ok(stream_id)
    }

    /// Push connection-scoped metadata to the peer's responder.
    pub fn metadata_push(&mut self, metadata: Bytes) -> Result<()> {
        self.require_open()?;
        self.write_frame(Frame::MetadataPush { metadata })
    }

    pub fn request_response(&mut self, payload: Payload) -> Result<u32> {
        self.require_open()?;
        self.consume_lease()?;
        let stream_id = self.allocate_stream_id()?;
        let machine = self.factory.request_response(stream_id, payload);
        self.streams.insert(stream_id, machine);
        self.flush_stream(stream_id)?;
        Ok(stream_id)
    }

    pub fn request_stream(&mut self, payload: Payload, initial_request_n: u32) -> Result<u32> {
        self.require_open()?;
        self.consume_lease()?;
        let stream_id = self.allocate_stream_id()?;
        let machine = self
            .factory
            .request_stream(stream_id, initial_request_n, payload);
        self.streams.insert(stream_id, machine);
        self.flush_stream(stream_id)?;
        Ok(stream_id)
    }

    pub fn request_channel(
        &mut self,
        payload: Payload,
        initial_request_n: u32,
        complete: bool,
    ) -> Result<u32> {
        self.require_open()?;
        self.consume_lease()?;
        let stream_id = self.allocate_stream_id()?;
        let machine = self
            .factory
            .request_channel(stream_id, initial_request_n, complete, payload);
        self.streams.insert(stream_id, machine);
        self.flush_stream(stream_id)?;
        Ok(stream_id)
    }

    /// Register a stream entry. Emits nothing by itself.
    pub fn add_stream(&mut self, stream_id: u32, machine: StreamMachine) -> Result<()> {
        if stream_id == 0 {
            return Err(ProtocolError::InvalidStreamId(0));
        }
        if self.streams.contains_key(&stream_id) || self.fragments.contains_key(&stream_id) {
            return Err(ProtocolError::StreamAlreadyExists(stream_id));
        }
        self.streams.insert(stream_id, machine);
        Ok(())
    }

    /// Push a payload on a live stream (responder pushes, channel sends).
    pub fn send_next(&mut self, stream_id: u32, payload: Payload, complete: bool) -> Result<()> {
        self.with_stream(stream_id, |machine| machine.send_next(payload, complete))
    }

    pub fn send_complete(&mut self, stream_id: u32) -> Result<()> {
        self.with_stream(stream_id, |machine| machine.send_complete())
    }

    pub fn send_error(&mut self, stream_id: u32, code: ErrorCode, message: &str) -> Result<()> {
        self.with_stream(stream_id, |machine| machine.send_error(code, message))
    }

    pub fn cancel_stream(&mut self, stream_id: u32) -> Result<()> {
        self.with_stream(stream_id, |machine| machine.cancel())
    }

    pub fn request_n(&mut self, stream_id: u32, n: u32) -> Result<()> {
        self.with_stream(stream_id, |machine| machine.request_n(n))
    }

    /// Remove a stream entry and signal it. Returns false if absent.
    pub fn end_stream(&mut self, stream_id: u32, signal: StreamSignal) -> bool {
        match self.streams.remove(&stream_id) {
            Some(mut machine) => {
                machine.close(signal);
                for event in machine.drain_events() {
                    self.stream_events.push_back((stream_id, event));
                }
                true
            }
            None => false,
        }
    }

    /// Emit a KEEPALIVE asking the peer to echo.
    pub fn send_keepalive(&mut self, data: Bytes) -> Result<()> {
        let position = self
            .resume
            .as_ref()
            .map_or(0, |resume| resume.lock().last_received_position());
        self.write_frame(Frame::Keepalive {
            respond: true,
            last_received_position: position,
            data,
        })?;
        if let Some(keepalive) = &mut self.keepalive {
            keepalive.mark_sent(Instant::now());
        }
        Ok(())
    }

    /// Periodic driver hook: enforce the lifetime bound, and on the client
    /// side emit the next probe when due.
    pub fn on_keepalive_tick(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let now = Instant::now();
        let (expired, due) = match &self.keepalive {
            Some(keepalive) => (keepalive.is_expired(now), keepalive.should_send(now)),
            None => return,
        };
        if expired {
            self.disconnect_or_close_with_error(ErrorCode::ConnectionError, "keepalive timeout");
            return;
        }
        if self.role == Role::Client && due {
            if let Err(err) = self.send_keepalive(Bytes::new()) {
                debug!(%err, "keepalive probe failed");
            }
        }
    }

    /// When the keepalive driver should tick next, while connected.
    pub fn next_keepalive_deadline(&self) -> Option<Instant> {
        match (self.state, &self.keepalive) {
            (ConnectionState::Connected, Some(keepalive)) => Some(keepalive.next_deadline()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Feed one complete inbound frame buffer from the transport.
    pub fn process_frame(&mut self, data: &[u8]) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.serializer.version().is_none() && self.serializer.detect(data).is_err() {
            self.close_with_error(ErrorCode::InvalidSetup, "could not detect protocol version");
            return;
        }
        let frame = match self.serializer.deserialize(data) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "undecodable frame");
                self.close_with_error(ErrorCode::ConnectionError, "invalid frame");
                return;
            }
        };

        if let Some(keepalive) = &mut self.keepalive {
            keepalive.record_activity(Instant::now());
        }
        if frame.is_resumable() {
            if let Some(resume) = &self.resume {
                resume.lock().track_received(data.len());
            }
        }
        self.route_frame(frame);
    }

    fn route_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        if stream_id == 0 {
            self.handle_connection_frame(frame);
            return;
        }
        if frame.is_request() {
            self.handle_new_stream(frame);
            return;
        }
        if self.streams.contains_key(&stream_id) {
            if let Some(machine) = self.streams.get_mut(&stream_id) {
                machine.on_frame(frame);
            }
            let _ = self.flush_stream(stream_id);
            return;
        }
        if self.fragments.contains_key(&stream_id) {
            self.append_fragment(stream_id, frame);
            return;
        }
        match frame {
            Frame::Cancel { .. }
            | Frame::Error { .. }
            | Frame::RequestN { .. }
            | Frame::Payload { .. } => {
                // Stream already terminated locally; late frames are normal.
                debug!(stream_id, "discarding frame for unknown stream");
            }
            _ => {
                self.close_with_error(ErrorCode::ConnectionError, "frame for unknown stream");
            }
        }
    }

    fn handle_connection_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Keepalive {
                respond,
                last_received_position,
                data,
            } => {
                if let Some(resume) = &self.resume {
                    resume.lock().release_up_to(last_received_position);
                }
                if respond {
                    let position = self
                        .resume
                        .as_ref()
                        .map_or(0, |resume| resume.lock().last_received_position());
                    let _ = self.write_frame(Frame::Keepalive {
                        respond: false,
                        last_received_position: position,
                        data,
                    });
                }
            }
            Frame::Error { code, message, .. } => {
                // Peer-declared connection failure; do not echo an ERROR back.
                self.fail_resume_callback(&message);
                self.close_streams(StreamSignal::ConnectionError);
                self.release_transport(CloseReason::Error(message.clone()));
                self.keepalive = None;
                self.state = ConnectionState::Closed;
                self.connection_events
                    .push_back(ConnectionEvent::Closed { code, message });
            }
            Frame::MetadataPush { metadata } => self.responder.metadata_push(metadata),
            Frame::Lease {
                ttl_ms,
                number_of_requests,
                ..
            } => {
                self.lease = Some(LeaseState {
                    permits: number_of_requests,
                    expires_at: Instant::now() + Duration::from_millis(u64::from(ttl_ms)),
                });
            }
            Frame::ResumeOk {
                last_received_client_position,
            } => self.handle_resume_ok(last_received_client_position),
            Frame::Setup { .. } | Frame::Resume { .. } => {
                self.close_with_error(
                    ErrorCode::ConnectionError,
                    "handshake frame on established connection",
                );
            }
            Frame::Ext { extended_type, .. } => {
                // No extensions registered.
                debug!(extended_type, "ignoring extension frame");
            }
            _ => {
                self.close_with_error(ErrorCode::ConnectionError, "invalid stream zero frame");
            }
        }
    }

    fn handle_resume_ok(&mut self, position: u64) {
        if self.role != Role::Client || self.state != ConnectionState::Resuming {
            self.close_with_error(ErrorCode::ConnectionError, "unexpected RESUME_OK");
            return;
        }
        let Some(resume) = self.resume.clone() else {
            self.close_with_error(ErrorCode::ConnectionError, "RESUME_OK without resume state");
            return;
        };
        let replay = {
            let mut cache = resume.lock();
            if !cache.is_position_available(position) {
                None
            } else {
                cache.release_up_to(position);
                cache.replay_from(position)
            }
        };
        let Some(replay) = replay else {
            self.close_with_error(
                ErrorCode::ConnectionError,
                "acknowledged position no longer available",
            );
            return;
        };
        for bytes in replay {
            if let Err(err) = self.send_raw(bytes) {
                warn!(%err, "replay write failed");
                self.disconnect("replay failed");
                return;
            }
        }
        self.state = ConnectionState::Connected;
        if let Some(keepalive) = &mut self.keepalive {
            keepalive.rearm(Instant::now());
        }
        if let Some(callback) = self.resume_callback.take() {
            callback(Ok(()));
        }
        self.connection_events.push_back(ConnectionEvent::Resumed);
        let _ = self.send_pending();
    }

    fn handle_new_stream(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        if self.streams.contains_key(&stream_id) || self.fragments.contains_key(&stream_id) {
            self.close_with_error(ErrorCode::ConnectionError, "stream id collision");
            return;
        }
        if !self.factory.is_remote_stream_id(stream_id) || stream_id <= self.last_remote_stream_id
        {
            self.close_with_error(ErrorCode::ConnectionError, "invalid remote stream id");
            return;
        }
        self.last_remote_stream_id = stream_id;

        if frame.follows() {
            match FragmentAccumulator::new(&frame, self.max_fragment_bytes) {
                Ok(accumulator) => {
                    self.fragments.insert(stream_id, accumulator);
                }
                Err(ProtocolError::FragmentLimitExceeded { .. }) => {
                    let _ = self.write_frame(Frame::Error {
                        stream_id,
                        code: ErrorCode::Rejected,
                        message: "fragmented request too large".into(),
                    });
                }
                Err(_) => {
                    self.close_with_error(ErrorCode::ConnectionError, "invalid initial fragment");
                }
            }
            return;
        }
        self.deliver_request(frame);
    }

    fn append_fragment(&mut self, stream_id: u32, frame: Frame) {
        match &frame {
            Frame::Payload { .. } => {}
            Frame::Cancel { .. } | Frame::Error { .. } => {
                // Reassembly abandoned by the peer.
                self.fragments.remove(&stream_id);
                return;
            }
            _ => {
                self.close_with_error(ErrorCode::ConnectionError, "unexpected frame during reassembly");
                return;
            }
        }
        let Some(accumulator) = self.fragments.get_mut(&stream_id) else {
            return;
        };
        match accumulator.append(&frame) {
            Ok(true) => {
                if let Some(accumulator) = self.fragments.remove(&stream_id) {
                    self.deliver_request(accumulator.finish());
                }
            }
            Ok(false) => {}
            Err(ProtocolError::FragmentLimitExceeded { size, max }) => {
                debug!(stream_id, size, max, "reassembly over budget");
                self.fragments.remove(&stream_id);
                let _ = self.write_frame(Frame::Error {
                    stream_id,
                    code: ErrorCode::Rejected,
                    message: "fragmented request too large".into(),
                });
            }
            Err(_) => {
                self.fragments.remove(&stream_id);
                self.close_with_error(ErrorCode::ConnectionError, "invalid fragment");
            }
        }
    }

    /// Hand a complete inbound request to the responder, creating the
    /// stream entry for response-bearing kinds.
    fn deliver_request(&mut self, frame: Frame) {
        match frame {
            Frame::RequestFnf { payload, .. } => {
                self.responder.fire_and_forget(payload);
            }
            Frame::RequestResponse {
                stream_id, payload, ..
            } => {
                let mut machine =
                    StreamMachine::RequestResponse(RequestResponse::responder(stream_id));
                self.responder
                    .request_response(payload, &mut ResponderSink::new(&mut machine));
                self.streams.insert(stream_id, machine);
                let _ = self.flush_stream(stream_id);
            }
            Frame::RequestStream {
                stream_id,
                initial_request_n,
                payload,
                ..
            } => {
                let mut machine = StreamMachine::RequestStream(RequestStream::responder(
                    stream_id,
                    initial_request_n,
                ));
                self.responder.request_stream(
                    initial_request_n,
                    payload,
                    &mut ResponderSink::new(&mut machine),
                );
                self.streams.insert(stream_id, machine);
                let _ = self.flush_stream(stream_id);
            }
            Frame::RequestChannel {
                stream_id,
                complete,
                initial_request_n,
                payload,
                ..
            } => {
                let mut machine = StreamMachine::RequestChannel(RequestChannel::responder(
                    stream_id,
                    initial_request_n,
                    complete,
                ));
                self.responder.request_channel(
                    initial_request_n,
                    payload,
                    &mut ResponderSink::new(&mut machine),
                );
                self.streams.insert(stream_id, machine);
                let _ = self.flush_stream(stream_id);
            }
            other => {
                debug!(frame_type = ?other.frame_type(), "not a request frame");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Drain a stream's buffered frames and events; reap it if terminal.
    fn flush_stream(&mut self, stream_id: u32) -> Result<()> {
        let (frames, events, terminated) = match self.streams.get_mut(&stream_id) {
            Some(machine) => (
                machine.drain_frames(),
                machine.drain_events(),
                machine.is_terminated(),
            ),
            None => return Ok(()),
        };
        for event in events {
            self.stream_events.push_back((stream_id, event));
        }
        if terminated {
            self.streams.remove(&stream_id);
        }
        for frame in frames {
            self.write_frame(frame)?;
        }
        Ok(())
    }

    fn with_stream<F>(&mut self, stream_id: u32, op: F) -> Result<()>
    where
        F: FnOnce(&mut StreamMachine) -> Result<()>,
    {
        let Some(machine) = self.streams.get_mut(&stream_id) else {
            return Err(ProtocolError::StreamNotFound(stream_id));
        };
        op(machine)?;
        self.flush_stream(stream_id)
    }

    /// The writer: queue while detached or resuming, otherwise serialize,
    /// track for resumption, and send.
    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.should_queue(&frame) {
            self.pending.push_back(frame);
            return Ok(());
        }
        self.send_now(frame)
    }

    fn should_queue(&self, frame: &Frame) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Resuming
        ) && !matches!(frame, Frame::Resume { .. } | Frame::ResumeOk { .. })
    }

    fn send_now(&mut self, frame: Frame) -> Result<()> {
        let bytes = self.serializer.serialize(&frame)?;
        if frame.is_resumable() {
            if let Some(resume) = &self.resume {
                resume.lock().track_sent(bytes.clone());
            }
        }
        self.send_raw(bytes)
    }

    fn send_raw(&mut self, bytes: Bytes) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.send_frame(bytes),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Flush the pending queue in FIFO order.
    fn send_pending(&mut self) -> Result<()> {
        while let Some(frame) = self.pending.pop_front() {
            self.send_now(frame)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn allocate_stream_id(&mut self) -> Result<u32> {
        match self.factory.next_stream_id() {
            Ok(stream_id) => Ok(stream_id),
            Err(err) => {
                self.close_with_error(ErrorCode::ConnectionError, "stream id space exhausted");
                Err(err)
            }
        }
    }

    fn close_streams(&mut self, signal: StreamSignal) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in ids {
            if let Some(mut machine) = self.streams.remove(&stream_id) {
                machine.close(signal.clone());
                for event in machine.drain_events() {
                    self.stream_events.push_back((stream_id, event));
                }
            }
        }
        self.fragments.clear();
    }

    fn consume_lease(&mut self) -> Result<()> {
        if !self.lease_honored {
            return Ok(());
        }
        match &mut self.lease {
            Some(lease) if lease.permits > 0 && Instant::now() < lease.expires_at => {
                lease.permits -= 1;
                Ok(())
            }
            _ => Err(ProtocolError::LeaseExhausted),
        }
    }

    fn fail_resume_callback(&mut self, cause: &str) {
        if let Some(callback) = self.resume_callback.take() {
            callback(Err(ProtocolError::ResumeRejected(cause.to_owned())));
        }
    }

    fn release_transport(&mut self, reason: CloseReason) {
        if let Some(mut transport) = self.transport.take() {
            transport.close(reason);
        }
    }

    fn replace_transport(&mut self, transport: Box<dyn FrameTransport>) {
        self.release_transport(CloseReason::Error("transport replaced".into()));
        self.transport = Some(transport);
    }

    fn require_role(&self, role: Role) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(ProtocolError::InvalidStateTransition {
                from: format!("{:?}", self.role),
                to: format!("{role:?} operation"),
            })
        }
    }

    fn require_state(&self, state: ConnectionState, target: &str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(ProtocolError::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_owned(),
            })
        }
    }

    fn require_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("fragments", &self.fragments.len())
            .field("pending", &self.pending.len())
            .field("resumable", &self.is_resumable())
            .finish()
    }
}
