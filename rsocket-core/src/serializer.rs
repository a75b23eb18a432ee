//! Version-aware frame serialization.
//!
//! Wraps the raw codec in `frame` with version negotiation: a serializer is
//! either pinned to a protocol version at construction or starts in
//! auto-detect mode and fixes its version from the first inbound frame.
//! Detection never runs twice.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, FrameHeader, FrameType, Version, MAX_METADATA_LEN, MAX_POSITION};

/// Resume tokens are length-prefixed with a u16 on the wire.
pub const MAX_RESUME_TOKEN_LEN: usize = u16::MAX as usize;

/// Serializes and deserializes frames for one negotiated protocol version.
#[derive(Debug, Clone)]
pub struct FrameSerializer {
    version: Option<Version>,
}

impl FrameSerializer {
    /// Serializer pinned to a known version.
    pub fn with_version(version: Version) -> Result<Self> {
        if !version.is_supported() {
            return Err(ProtocolError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        Ok(FrameSerializer {
            version: Some(version),
        })
    }

    /// Serializer awaiting version auto-detection from the first inbound frame.
    pub fn detecting() -> Self {
        FrameSerializer { version: None }
    }

    /// The negotiated version, if fixed.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Probe the first inbound frame of a connection for the peer's version.
    ///
    /// Only SETUP and RESUME open a connection, and both carry the version
    /// immediately after the header. Fixes the serializer's version on
    /// success; a serializer whose version is already fixed refuses to
    /// re-detect.
    pub fn detect(&mut self, data: &[u8]) -> Result<Version> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        let header = FrameHeader::decode(data)?;
        if header.stream_id != 0
            || !matches!(header.frame_type, FrameType::Setup | FrameType::Resume)
        {
            return Err(ProtocolError::InvalidFrame(
                "connection must open with SETUP or RESUME",
            ));
        }
        let body = &data[FrameHeader::SIZE..];
        if body.len() < 4 {
            return Err(ProtocolError::FrameTooShort {
                expected: FrameHeader::SIZE + 4,
                actual: data.len(),
            });
        }
        let version = Version::new(
            u16::from_be_bytes([body[0], body[1]]),
            u16::from_be_bytes([body[2], body[3]]),
        );
        if !version.is_supported() {
            return Err(ProtocolError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        self.version = Some(version);
        Ok(version)
    }

    /// Header-only peek: stream id, type and flags without decoding the body.
    pub fn peek_header(&self, data: &[u8]) -> Result<FrameHeader> {
        FrameHeader::decode(data)
    }

    /// Validate field limits and encode a frame to its wire form.
    pub fn serialize(&self, frame: &Frame) -> Result<Bytes> {
        if self.version.is_none() {
            return Err(ProtocolError::VersionNotNegotiated);
        }
        validate(frame)?;
        Ok(frame.encode())
    }

    /// Decode a complete frame buffer.
    pub fn deserialize(&self, data: &[u8]) -> Result<Frame> {
        if self.version.is_none() {
            return Err(ProtocolError::VersionNotNegotiated);
        }
        Frame::decode(data)
    }
}

/// Reject values that cannot be represented on the wire before encoding
/// masks them.
fn validate(frame: &Frame) -> Result<()> {
    fn check_metadata(metadata: &Option<Bytes>) -> Result<()> {
        match metadata {
            Some(m) if m.len() > MAX_METADATA_LEN => {
                Err(ProtocolError::InvalidFrame("metadata exceeds 24-bit length"))
            }
            _ => Ok(()),
        }
    }

    match frame {
        Frame::Setup {
            resume_token,
            metadata_mime_type,
            data_mime_type,
            keepalive_interval_ms,
            max_lifetime_ms,
            payload,
            ..
        } => {
            if let Some(token) = resume_token {
                if token.len() > MAX_RESUME_TOKEN_LEN {
                    return Err(ProtocolError::TokenTooLong(token.len()));
                }
            }
            if metadata_mime_type.len() > u8::MAX as usize
                || data_mime_type.len() > u8::MAX as usize
            {
                return Err(ProtocolError::InvalidFrame("mime type exceeds 255 bytes"));
            }
            if *keepalive_interval_ms == 0 || *max_lifetime_ms == 0 {
                return Err(ProtocolError::InvalidFrame(
                    "keepalive settings must be positive",
                ));
            }
            check_metadata(&payload.metadata)
        }
        Frame::Resume {
            token,
            last_received_server_position,
            first_available_client_position,
            ..
        } => {
            if token.len() > MAX_RESUME_TOKEN_LEN {
                return Err(ProtocolError::TokenTooLong(token.len()));
            }
            if *last_received_server_position > MAX_POSITION
                || *first_available_client_position > MAX_POSITION
            {
                return Err(ProtocolError::InvalidFrame("position exceeds 63 bits"));
            }
            Ok(())
        }
        Frame::Keepalive {
            last_received_position,
            ..
        } => {
            if *last_received_position > MAX_POSITION {
                return Err(ProtocolError::InvalidFrame("position exceeds 63 bits"));
            }
            Ok(())
        }
        Frame::ResumeOk {
            last_received_client_position,
        } => {
            if *last_received_client_position > MAX_POSITION {
                return Err(ProtocolError::InvalidFrame("position exceeds 63 bits"));
            }
            Ok(())
        }
        Frame::RequestResponse { payload, .. }
        | Frame::RequestFnf { payload, .. }
        | Frame::RequestStream { payload, .. }
        | Frame::RequestChannel { payload, .. }
        | Frame::Payload { payload, .. }
        | Frame::Ext { payload, .. } => check_metadata(&payload.metadata),
        Frame::Lease { metadata, .. } => check_metadata(metadata),
        Frame::Error { .. }
        | Frame::RequestN { .. }
        | Frame::Cancel { .. }
        | Frame::MetadataPush { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Payload;

    fn setup_frame(token: Option<Bytes>) -> Frame {
        Frame::Setup {
            version: Version::V1,
            keepalive_interval_ms: 30_000,
            max_lifetime_ms: 90_000,
            resume_token: token,
            lease: false,
            metadata_mime_type: "application/octet-stream".into(),
            data_mime_type: "application/octet-stream".into(),
            payload: Payload::default(),
        }
    }

    #[test]
    fn detect_from_setup() {
        let mut serializer = FrameSerializer::detecting();
        let encoded = setup_frame(None).encode();
        assert_eq!(serializer.detect(&encoded).unwrap(), Version::V1);
        assert_eq!(serializer.version(), Some(Version::V1));
    }

    #[test]
    fn detect_refuses_non_handshake_frame() {
        let mut serializer = FrameSerializer::detecting();
        let encoded = Frame::Cancel { stream_id: 1 }.encode();
        assert!(serializer.detect(&encoded).is_err());
        assert_eq!(serializer.version(), None);
    }

    #[test]
    fn detect_is_sticky() {
        let mut serializer = FrameSerializer::with_version(Version::V1).unwrap();
        // A later RESUME claiming 2.0 must not re-detect.
        let resume = Frame::Resume {
            version: Version::new(2, 0),
            token: Bytes::from_static(b"t"),
            last_received_server_position: 0,
            first_available_client_position: 0,
        };
        assert_eq!(serializer.detect(&resume.encode()).unwrap(), Version::V1);
    }

    #[test]
    fn unsupported_version_rejected() {
        assert!(FrameSerializer::with_version(Version::new(2, 0)).is_err());
        let mut serializer = FrameSerializer::detecting();
        let mut frame = setup_frame(None);
        if let Frame::Setup { version, .. } = &mut frame {
            *version = Version::new(9, 9);
        }
        assert!(matches!(
            serializer.detect(&frame.encode()),
            Err(ProtocolError::UnsupportedVersion { major: 9, minor: 9 })
        ));
    }

    #[test]
    fn serialize_enforces_token_limit() {
        let serializer = FrameSerializer::with_version(Version::V1).unwrap();
        let oversized = Bytes::from(vec![0u8; MAX_RESUME_TOKEN_LEN + 1]);
        assert!(matches!(
            serializer.serialize(&setup_frame(Some(oversized))),
            Err(ProtocolError::TokenTooLong(_))
        ));
    }

    #[test]
    fn serialize_requires_version() {
        let serializer = FrameSerializer::detecting();
        assert!(matches!(
            serializer.serialize(&Frame::Cancel { stream_id: 1 }),
            Err(ProtocolError::VersionNotNegotiated)
        ));
    }
}
