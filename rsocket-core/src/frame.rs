//! RSocket wire frames and their bit-exact codec.
//!
//! A frame buffer starts with a 31-bit big-endian stream id (high bit
//! reserved, must be zero), followed by a 16-bit field holding the frame
//! type in the upper 6 bits and the flags in the lower 10. The 3-byte
//! outer length prefix used on byte-stream transports is transport framing
//! and never appears in these buffers; the transport seam exchanges one
//! complete frame per call.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, ProtocolError, Result};

/// Largest legal stream id / 31-bit field value.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Largest legal resume position (63-bit field).
pub const MAX_POSITION: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Largest metadata length expressible in the 24-bit length prefix.
pub const MAX_METADATA_LEN: usize = 0xFF_FFFF;

/// Protocol version as carried in SETUP and RESUME frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const V1: Version = Version { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Version { major, minor }
    }

    /// Whether this engine speaks the given version.
    pub fn is_supported(self) -> bool {
        self.major == 1
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Frame type identifiers, wire values per RSocket 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Setup),
            0x02 => Ok(FrameType::Lease),
            0x03 => Ok(FrameType::Keepalive),
            0x04 => Ok(FrameType::RequestResponse),
            0x05 => Ok(FrameType::RequestFnf),
            0x06 => Ok(FrameType::RequestStream),
            0x07 => Ok(FrameType::RequestChannel),
            0x08 => Ok(FrameType::RequestN),
            0x09 => Ok(FrameType::Cancel),
            0x0A => Ok(FrameType::Payload),
            0x0B => Ok(FrameType::Error),
            0x0C => Ok(FrameType::MetadataPush),
            0x0D => Ok(FrameType::Resume),
            0x0E => Ok(FrameType::ResumeOk),
            0x3F => Ok(FrameType::Ext),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// The 10-bit flags field.
///
/// IGNORE and METADATA are position-fixed for every type; the remaining bits
/// are interpreted per frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    pub const NONE: Self = Self(0x000);
    pub const IGNORE: Self = Self(0x200);
    pub const METADATA: Self = Self(0x100);
    /// SETUP: resume token present. KEEPALIVE: respond requested.
    /// REQUEST_* / PAYLOAD: more fragments follow.
    pub const RESUME_ENABLE: Self = Self(0x080);
    pub const RESPOND: Self = Self(0x080);
    pub const FOLLOWS: Self = Self(0x080);
    /// SETUP: lease honored. REQUEST_CHANNEL / PAYLOAD: completion.
    pub const LEASE: Self = Self(0x040);
    pub const COMPLETE: Self = Self(0x040);
    /// PAYLOAD: payload data present.
    pub const NEXT: Self = Self(0x020);

    pub fn contains(self, flag: Flags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    fn set_if(self, flag: Flags, cond: bool) -> Flags {
        if cond {
            Flags(self.0 | flag.0)
        } else {
            self
        }
    }
}

/// Application payload: optional metadata plus data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl Payload {
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Payload { metadata, data }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Payload {
            metadata: None,
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_empty()
    }

    fn encoded_len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| 3 + m.len()) + self.data.len()
    }
}

/// Decoded header, produced by the header-only peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: Flags,
}

impl FrameHeader {
    pub const SIZE: usize = 6;

    /// Decode the six header bytes without touching the body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure_len(data, Self::SIZE)?;
        let raw_id = (&data[0..4]).get_u32();
        if raw_id > MAX_STREAM_ID {
            return Err(ProtocolError::InvalidFrame("reserved stream id bit set"));
        }
        let type_and_flags = (&data[4..6]).get_u16();
        let frame_type = FrameType::try_from((type_and_flags >> 10) as u8)?;
        Ok(FrameHeader {
            stream_id: raw_id,
            frame_type,
            flags: Flags(type_and_flags & 0x03FF),
        })
    }
}

/// A decoded RSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// SETUP: connection handshake, stream id 0.
    Setup {
        version: Version,
        keepalive_interval_ms: u32,
        max_lifetime_ms: u32,
        resume_token: Option<Bytes>,
        lease: bool,
        metadata_mime_type: String,
        data_mime_type: String,
        payload: Payload,
    },
    /// LEASE: permit grant, stream id 0. Metadata is unprefixed.
    Lease {
        ttl_ms: u32,
        number_of_requests: u32,
        metadata: Option<Bytes>,
    },
    /// KEEPALIVE: liveness probe/echo, stream id 0.
    Keepalive {
        respond: bool,
        last_received_position: u64,
        data: Bytes,
    },
    RequestResponse {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestFnf {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestStream {
        stream_id: u32,
        follows: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestChannel {
        stream_id: u32,
        follows: bool,
        complete: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestN {
        stream_id: u32,
        n: u32,
    },
    Cancel {
        stream_id: u32,
    },
    Payload {
        stream_id: u32,
        follows: bool,
        complete: bool,
        next: bool,
        payload: Payload,
    },
    /// ERROR: stream-scoped, or connection-scoped at stream id 0.
    Error {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },
    /// METADATA_PUSH: stream id 0, metadata is the unprefixed remainder.
    MetadataPush {
        metadata: Bytes,
    },
    /// RESUME: session resumption request, stream id 0.
    Resume {
        version: Version,
        token: Bytes,
        last_received_server_position: u64,
        first_available_client_position: u64,
    },
    /// RESUME_OK: resumption acknowledgment, stream id 0.
    ResumeOk {
        last_received_client_position: u64,
    },
    /// EXT: extension frame; dispatched only to registered extensions.
    Ext {
        stream_id: u32,
        extended_type: u32,
        ignore: bool,
        payload: Payload,
    },
}

impl Frame {
    /// Return the frame type discriminant.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup { .. } => FrameType::Setup,
            Frame::Lease { .. } => FrameType::Lease,
            Frame::Keepalive { .. } => FrameType::Keepalive,
            Frame::RequestResponse { .. } => FrameType::RequestResponse,
            Frame::RequestFnf { .. } => FrameType::RequestFnf,
            Frame::RequestStream { .. } => FrameType::RequestStream,
            Frame::RequestChannel { .. } => FrameType::RequestChannel,
            Frame::RequestN { .. } => FrameType::RequestN,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::Payload { .. } => FrameType::Payload,
            Frame::Error { .. } => FrameType::Error,
            Frame::MetadataPush { .. } => FrameType::MetadataPush,
            Frame::Resume { .. } => FrameType::Resume,
            Frame::ResumeOk { .. } => FrameType::ResumeOk,
            Frame::Ext { .. } => FrameType::Ext,
        }
    }

    /// The stream this frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Setup { .. }
            | Frame::Lease { .. }
            | Frame::Keepalive { .. }
            | Frame::MetadataPush { .. }
            | Frame::Resume { .. }
            | Frame::ResumeOk { .. } => 0,
            Frame::RequestResponse { stream_id, .. }
            | Frame::RequestFnf { stream_id, .. }
            | Frame::RequestStream { stream_id, .. }
            | Frame::RequestChannel { stream_id, .. }
            | Frame::RequestN { stream_id, .. }
            | Frame::Cancel { stream_id }
            | Frame::Payload { stream_id, .. }
            | Frame::Error { stream_id, .. }
            | Frame::Ext { stream_id, .. } => *stream_id,
        }
    }

    /// Whether this frame counts toward resume positions.
    ///
    /// Only REQUEST_*, REQUEST_N, CANCEL, PAYLOAD and ERROR frames are
    /// position-tracked; handshake, keepalive, lease, metadata-push and the
    /// resume control frames are not.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Frame::RequestResponse { .. }
                | Frame::RequestFnf { .. }
                | Frame::RequestStream { .. }
                | Frame::RequestChannel { .. }
                | Frame::RequestN { .. }
                | Frame::Cancel { .. }
                | Frame::Payload { .. }
                | Frame::Error { .. }
        )
    }

    /// Whether this frame opens a new stream.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Frame::RequestResponse { .. }
                | Frame::RequestFnf { .. }
                | Frame::RequestStream { .. }
                | Frame::RequestChannel { .. }
        )
    }

    /// FOLLOWS flag of request and payload frames.
    pub fn follows(&self) -> bool {
        match self {
            Frame::RequestResponse { follows, .. }
            | Frame::RequestFnf { follows, .. }
            | Frame::RequestStream { follows, .. }
            | Frame::RequestChannel { follows, .. }
            | Frame::Payload { follows, .. } => *follows,
            _ => false,
        }
    }

    /// Encode this frame into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Setup {
                version,
                keepalive_interval_ms,
                max_lifetime_ms,
                resume_token,
                lease,
                metadata_mime_type,
                data_mime_type,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::RESUME_ENABLE, resume_token.is_some())
                    .set_if(Flags::LEASE, *lease);
                put_header(buf, 0, FrameType::Setup, flags);
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u32(*keepalive_interval_ms & MAX_STREAM_ID);
                buf.put_u32(*max_lifetime_ms & MAX_STREAM_ID);
                if let Some(token) = resume_token {
                    buf.put_u16(token.len() as u16);
                    buf.put_slice(token);
                }
                buf.put_u8(metadata_mime_type.len() as u8);
                buf.put_slice(metadata_mime_type.as_bytes());
                buf.put_u8(data_mime_type.len() as u8);
                buf.put_slice(data_mime_type.as_bytes());
                put_payload(buf, payload);
            }
            Frame::Lease {
                ttl_ms,
                number_of_requests,
                metadata,
            } => {
                let flags = Flags::NONE.set_if(Flags::METADATA, metadata.is_some());
                put_header(buf, 0, FrameType::Lease, flags);
                buf.put_u32(*ttl_ms & MAX_STREAM_ID);
                buf.put_u32(*number_of_requests & MAX_STREAM_ID);
                if let Some(m) = metadata {
                    buf.put_slice(m);
                }
            }
            Frame::Keepalive {
                respond,
                last_received_position,
                data,
            } => {
                let flags = Flags::NONE.set_if(Flags::RESPOND, *respond);
                put_header(buf, 0, FrameType::Keepalive, flags);
                buf.put_u64(*last_received_position & MAX_POSITION);
                buf.put_slice(data);
            }
            Frame::RequestResponse {
                stream_id,
                follows,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::FOLLOWS, *follows);
                put_header(buf, *stream_id, FrameType::RequestResponse, flags);
                put_payload(buf, payload);
            }
            Frame::RequestFnf {
                stream_id,
                follows,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::FOLLOWS, *follows);
                put_header(buf, *stream_id, FrameType::RequestFnf, flags);
                put_payload(buf, payload);
            }
            Frame::RequestStream {
                stream_id,
                follows,
                initial_request_n,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::FOLLOWS, *follows);
                put_header(buf, *stream_id, FrameType::RequestStream, flags);
                buf.put_u32(*initial_request_n & MAX_STREAM_ID);
                put_payload(buf, payload);
            }
            Frame::RequestChannel {
                stream_id,
                follows,
                complete,
                initial_request_n,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::FOLLOWS, *follows)
                    .set_if(Flags::COMPLETE, *complete);
                put_header(buf, *stream_id, FrameType::RequestChannel, flags);
                buf.put_u32(*initial_request_n & MAX_STREAM_ID);
                put_payload(buf, payload);
            }
            Frame::RequestN { stream_id, n } => {
                put_header(buf, *stream_id, FrameType::RequestN, Flags::NONE);
                buf.put_u32(*n & MAX_STREAM_ID);
            }
            Frame::Cancel { stream_id } => {
                put_header(buf, *stream_id, FrameType::Cancel, Flags::NONE);
            }
            Frame::Payload {
                stream_id,
                follows,
                complete,
                next,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::FOLLOWS, *follows)
                    .set_if(Flags::COMPLETE, *complete)
                    .set_if(Flags::NEXT, *next);
                put_header(buf, *stream_id, FrameType::Payload, flags);
                put_payload(buf, payload);
            }
            Frame::Error {
                stream_id,
                code,
                message,
            } => {
                put_header(buf, *stream_id, FrameType::Error, Flags::NONE);
                buf.put_u32(*code as u32);
                buf.put_slice(message.as_bytes());
            }
            Frame::MetadataPush { metadata } => {
                put_header(buf, 0, FrameType::MetadataPush, Flags::METADATA);
                buf.put_slice(metadata);
            }
            Frame::Resume {
                version,
                token,
                last_received_server_position,
                first_available_client_position,
            } => {
                put_header(buf, 0, FrameType::Resume, Flags::NONE);
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u16(token.len() as u16);
                buf.put_slice(token);
                buf.put_u64(*last_received_server_position & MAX_POSITION);
                buf.put_u64(*first_available_client_position & MAX_POSITION);
            }
            Frame::ResumeOk {
                last_received_client_position,
            } => {
                put_header(buf, 0, FrameType::ResumeOk, Flags::NONE);
                buf.put_u64(*last_received_client_position & MAX_POSITION);
            }
            Frame::Ext {
                stream_id,
                extended_type,
                ignore,
                payload,
            } => {
                let flags = Flags::NONE
                    .set_if(Flags::METADATA, payload.metadata.is_some())
                    .set_if(Flags::IGNORE, *ignore);
                put_header(buf, *stream_id, FrameType::Ext, flags);
                buf.put_u32(*extended_type);
                put_payload(buf, payload);
            }
        }
    }

    /// The total number of bytes this frame occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE
            + match self {
                Frame::Setup {
                    resume_token,
                    metadata_mime_type,
                    data_mime_type,
                    payload,
                    ..
                } => {
                    12 + resume_token.as_ref().map_or(0, |t| 2 + t.len())
                        + 1
                        + metadata_mime_type.len()
                        + 1
                        + data_mime_type.len()
                        + payload.encoded_len()
                }
                Frame::Lease { metadata, .. } => 8 + metadata.as_ref().map_or(0, Bytes::len),
                Frame::Keepalive { data, .. } => 8 + data.len(),
                Frame::RequestResponse { payload, .. } | Frame::RequestFnf { payload, .. } => {
                    payload.encoded_len()
                }
                Frame::RequestStream { payload, .. } | Frame::RequestChannel { payload, .. } => {
                    4 + payload.encoded_len()
                }
                Frame::RequestN { .. } => 4,
                Frame::Cancel { .. } => 0,
                Frame::Payload { payload, .. } => payload.encoded_len(),
                Frame::Error { message, .. } => 4 + message.len(),
                Frame::MetadataPush { metadata } => metadata.len(),
                Frame::Resume { token, .. } => 4 + 2 + token.len() + 16,
                Frame::ResumeOk { .. } => 8,
                Frame::Ext { payload, .. } => 4 + payload.encoded_len(),
            }
    }

    /// Decode a frame from a complete frame buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(data)?;
        let stream_id = header.stream_id;
        let flags = header.flags;
        let body = &data[FrameHeader::SIZE..];

        match header.frame_type {
            FrameType::Setup => {
                require_stream_zero(stream_id)?;
                ensure_len(body, 12)?;
                let version = Version::new((&body[0..2]).get_u16(), (&body[2..4]).get_u16());
                let keepalive_interval_ms = (&body[4..8]).get_u32() & MAX_STREAM_ID;
                let max_lifetime_ms = (&body[8..12]).get_u32() & MAX_STREAM_ID;
                let mut rest = &body[12..];
                let resume_token = if flags.contains(Flags::RESUME_ENABLE) {
                    ensure_len(rest, 2)?;
                    let token_len = (&rest[0..2]).get_u16() as usize;
                    rest = &rest[2..];
                    ensure_len(rest, token_len)?;
                    let token = Bytes::copy_from_slice(&rest[..token_len]);
                    rest = &rest[token_len..];
                    Some(token)
                } else {
                    None
                };
                let metadata_mime_type = take_mime(&mut rest)?;
                let data_mime_type = take_mime(&mut rest)?;
                let payload = take_payload(rest, flags)?;
                Ok(Frame::Setup {
                    version,
                    keepalive_interval_ms,
                    max_lifetime_ms,
                    resume_token,
                    lease: flags.contains(Flags::LEASE),
                    metadata_mime_type,
                    data_mime_type,
                    payload,
                })
            }
            FrameType::Lease => {
                require_stream_zero(stream_id)?;
                ensure_len(body, 8)?;
                let ttl_ms = (&body[0..4]).get_u32() & MAX_STREAM_ID;
                let number_of_requests = (&body[4..8]).get_u32() & MAX_STREAM_ID;
                let metadata = if flags.contains(Flags::METADATA) {
                    Some(Bytes::copy_from_slice(&body[8..]))
                } else if body.len() > 8 {
                    return Err(ProtocolError::InvalidFrame("lease trailing bytes"));
                } else {
                    None
                };
                Ok(Frame::Lease {
                    ttl_ms,
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => {
                require_stream_zero(stream_id)?;
                ensure_len(body, 8)?;
                let last_received_position = take_position(&body[0..8])?;
                Ok(Frame::Keepalive {
                    respond: flags.contains(Flags::RESPOND),
                    last_received_position,
                    data: Bytes::copy_from_slice(&body[8..]),
                })
            }
            FrameType::RequestResponse => Ok(Frame::RequestResponse {
                stream_id,
                follows: flags.contains(Flags::FOLLOWS),
                payload: take_payload(body, flags)?,
            }),
            FrameType::RequestFnf => Ok(Frame::RequestFnf {
                stream_id,
                follows: flags.contains(Flags::FOLLOWS),
                payload: take_payload(body, flags)?,
            }),
            FrameType::RequestStream => {
                ensure_len(body, 4)?;
                Ok(Frame::RequestStream {
                    stream_id,
                    follows: flags.contains(Flags::FOLLOWS),
                    initial_request_n: (&body[0..4]).get_u32() & MAX_STREAM_ID,
                    payload: take_payload(&body[4..], flags)?,
                })
            }
            FrameType::RequestChannel => {
                ensure_len(body, 4)?;
                Ok(Frame::RequestChannel {
                    stream_id,
                    follows: flags.contains(Flags::FOLLOWS),
                    complete: flags.contains(Flags::COMPLETE),
                    initial_request_n: (&body[0..4]).get_u32() & MAX_STREAM_ID,
                    payload: take_payload(&body[4..], flags)?,
                })
            }
            FrameType::RequestN => {
                ensure_len(body, 4)?;
                Ok(Frame::RequestN {
                    stream_id,
                    n: (&body[0..4]).get_u32() & MAX_STREAM_ID,
                })
            }
            FrameType::Cancel => Ok(Frame::Cancel { stream_id }),
            FrameType::Payload => Ok(Frame::Payload {
                stream_id,
                follows: flags.contains(Flags::FOLLOWS),
                complete: flags.contains(Flags::COMPLETE),
                next: flags.contains(Flags::NEXT),
                payload: take_payload(body, flags)?,
            }),
            FrameType::Error => {
                ensure_len(body, 4)?;
                let code = ErrorCode::try_from((&body[0..4]).get_u32())?;
                let message = String::from_utf8(body[4..].to_vec())
                    .map_err(|_| ProtocolError::InvalidFrame("error message is not UTF-8"))?;
                Ok(Frame::Error {
                    stream_id,
                    code,
                    message,
                })
            }
            FrameType::MetadataPush => {
                require_stream_zero(stream_id)?;
                if !flags.contains(Flags::METADATA) {
                    return Err(ProtocolError::InvalidFrame(
                        "metadata-push without metadata flag",
                    ));
                }
                Ok(Frame::MetadataPush {
                    metadata: Bytes::copy_from_slice(body),
                })
            }
            FrameType::Resume => {
                require_stream_zero(stream_id)?;
                ensure_len(body, 6)?;
                let version = Version::new((&body[0..2]).get_u16(), (&body[2..4]).get_u16());
                let token_len = (&body[4..6]).get_u16() as usize;
                let rest = &body[6..];
                ensure_len(rest, token_len + 16)?;
                let token = Bytes::copy_from_slice(&rest[..token_len]);
                let last_received_server_position =
                    take_position(&rest[token_len..token_len + 8])?;
                let first_available_client_position =
                    take_position(&rest[token_len + 8..token_len + 16])?;
                Ok(Frame::Resume {
                    version,
                    token,
                    last_received_server_position,
                    first_available_client_position,
                })
            }
            FrameType::ResumeOk => {
                require_stream_zero(stream_id)?;
                ensure_len(body, 8)?;
                Ok(Frame::ResumeOk {
                    last_received_client_position: take_position(&body[0..8])?,
                })
            }
            FrameType::Ext => {
                ensure_len(body, 4)?;
                Ok(Frame::Ext {
                    stream_id,
                    extended_type: (&body[0..4]).get_u32(),
                    ignore: flags.contains(Flags::IGNORE),
                    payload: take_payload(&body[4..], flags)?,
                })
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, stream_id: u32, frame_type: FrameType, flags: Flags) {
    buf.put_u32(stream_id & MAX_STREAM_ID);
    buf.put_u16(((frame_type as u16) << 10) | (flags.0 & 0x03FF));
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = &payload.metadata {
        let len = metadata.len().min(MAX_METADATA_LEN) as u32;
        buf.put_u8((len >> 16) as u8);
        buf.put_u16((len & 0xFFFF) as u16);
        buf.put_slice(metadata);
    }
    buf.put_slice(&payload.data);
}

fn take_payload(data: &[u8], flags: Flags) -> Result<Payload> {
    if flags.contains(Flags::METADATA) {
        ensure_len(data, 3)?;
        let len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
        let rest = &data[3..];
        ensure_len(rest, len)?;
        Ok(Payload {
            metadata: Some(Bytes::copy_from_slice(&rest[..len])),
            data: Bytes::copy_from_slice(&rest[len..]),
        })
    } else {
        Ok(Payload {
            metadata: None,
            data: Bytes::copy_from_slice(data),
        })
    }
}

fn take_mime(data: &mut &[u8]) -> Result<String> {
    ensure_len(data, 1)?;
    let len = data[0] as usize;
    ensure_len(&data[1..], len)?;
    let mime = std::str::from_utf8(&data[1..1 + len])
        .map_err(|_| ProtocolError::InvalidFrame("mime type is not UTF-8"))?
        .to_owned();
    *data = &data[1 + len..];
    Ok(mime)
}

fn take_position(data: &[u8]) -> Result<u64> {
    let raw = (&data[0..8]).get_u64();
    if raw > MAX_POSITION {
        return Err(ProtocolError::InvalidFrame("reserved position bit set"));
    }
    Ok(raw)
}

fn require_stream_zero(stream_id: u32) -> Result<()> {
    if stream_id != 0 {
        return Err(ProtocolError::InvalidFrame(
            "connection frame on nonzero stream id",
        ));
    }
    Ok(())
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(ProtocolError::FrameTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}
