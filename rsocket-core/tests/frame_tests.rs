//! Frame codec tests: fixtures, round-trips, malformed input.

use bytes::Bytes;
use rsocket_core::{
    ErrorCode, Frame, FrameHeader, FrameSerializer, FrameType, Payload, ProtocolError, Version,
};

/// SETUP bytes for a plain client handshake, validated field by field
/// against the wire layout.
#[test]
fn setup_frame_fixture() {
    let frame = Frame::Setup {
        version: Version::V1,
        keepalive_interval_ms: 30_000,
        max_lifetime_ms: 90_000,
        resume_token: None,
        lease: false,
        metadata_mime_type: "application/octet-stream".into(),
        data_mime_type: "application/octet-stream".into(),
        payload: Payload::from_data(Bytes::from_static(b"hi")),
    };

    let mime = b"application/octet-stream";
    let mut expected: Vec<u8> = vec![
        0x00, 0x00, 0x00, 0x00, // stream id 0
        0x04, 0x00, // SETUP, no flags
        0x00, 0x01, 0x00, 0x00, // version 1.0
        0x00, 0x00, 0x75, 0x30, // keepalive 30000ms
        0x00, 0x01, 0x5F, 0x90, // max lifetime 90000ms
    ];
    expected.push(mime.len() as u8);
    expected.extend_from_slice(mime);
    expected.push(mime.len() as u8);
    expected.extend_from_slice(mime);
    expected.extend_from_slice(b"hi");

    assert_eq!(&frame.encode()[..], &expected[..]);
    assert_eq!(Frame::decode(&expected).unwrap(), frame);
}

#[test]
fn setup_with_resume_token_and_lease() {
    let frame = Frame::Setup {
        version: Version::V1,
        keepalive_interval_ms: 5_000,
        max_lifetime_ms: 20_000,
        resume_token: Some(Bytes::from_static(b"session-token")),
        lease: true,
        metadata_mime_type: "text/plain".into(),
        data_mime_type: "application/json".into(),
        payload: Payload::new(Some(Bytes::from_static(b"m")), Bytes::from_static(b"d")),
    };
    let encoded = frame.encode();
    // METADATA | RESUME_ENABLE | LEASE on a SETUP.
    assert_eq!(encoded[4], 0x05);
    assert_eq!(encoded[5], 0xC0);
    assert_eq!(Frame::decode(&encoded).unwrap(), frame);
}

#[test]
fn keepalive_roundtrip() {
    let frame = Frame::Keepalive {
        respond: true,
        last_received_position: 1_024,
        data: Bytes::from_static(b"ka"),
    };
    let encoded = frame.encode();
    let decoded = Frame::decode(&encoded).unwrap();
    assert_eq!(decoded, frame);
    assert_eq!(encoded.len(), frame.encoded_len());
}

#[test]
fn resume_and_resume_ok_roundtrip() {
    let resume = Frame::Resume {
        version: Version::V1,
        token: Bytes::from_static(b"resume token"),
        last_received_server_position: 512,
        first_available_client_position: 800,
    };
    assert_eq!(Frame::decode(&resume.encode()).unwrap(), resume);

    let ok = Frame::ResumeOk {
        last_received_client_position: 800,
    };
    assert_eq!(Frame::decode(&ok.encode()).unwrap(), ok);
}

#[test]
fn request_frames_roundtrip() {
    let frames = [
        Frame::RequestResponse {
            stream_id: 3,
            follows: false,
            payload: Payload::new(Some(Bytes::from_static(b"m")), Bytes::from_static(b"d")),
        },
        Frame::RequestFnf {
            stream_id: 1,
            follows: true,
            payload: Payload::from_data(Bytes::from_static(b"first half")),
        },
        Frame::RequestStream {
            stream_id: 5,
            follows: false,
            initial_request_n: 128,
            payload: Payload::from_data(Bytes::from_static(b"query")),
        },
        Frame::RequestChannel {
            stream_id: 7,
            follows: false,
            complete: true,
            initial_request_n: 1,
            payload: Payload::from_data(Bytes::from_static(b"only")),
        },
    ];
    for frame in frames {
        let encoded = frame.encode();
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        // Byte-exact both directions.
        assert_eq!(Frame::decode(&encoded).unwrap().encode(), encoded);
    }
}

#[test]
fn control_frames_roundtrip() {
    let frames = [
        Frame::RequestN {
            stream_id: 3,
            n: 64,
        },
        Frame::Cancel { stream_id: 3 },
        Frame::Error {
            stream_id: 3,
            code: ErrorCode::ApplicationError,
            message: "handler failed".into(),
        },
        Frame::MetadataPush {
            metadata: Bytes::from_static(b"routing"),
        },
        Frame::Lease {
            ttl_ms: 10_000,
            number_of_requests: 50,
            metadata: None,
        },
        Frame::Ext {
            stream_id: 9,
            extended_type: 0xABCD,
            ignore: true,
            payload: Payload::from_data(Bytes::from_static(b"ext")),
        },
    ];
    for frame in frames {
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }
}

#[test]
fn payload_frame_flag_combinations() {
    let frame = Frame::Payload {
        stream_id: 2,
        follows: false,
        complete: true,
        next: true,
        payload: Payload::from_data(Bytes::from_static(b"final")),
    };
    let encoded = frame.encode();
    // PAYLOAD = 0x0A, flags COMPLETE | NEXT.
    assert_eq!(encoded[4], 0x28);
    assert_eq!(encoded[5], 0x60);
    assert_eq!(Frame::decode(&encoded).unwrap(), frame);
}

#[test]
fn header_peek_reads_type_without_body() {
    let frame = Frame::RequestStream {
        stream_id: 21,
        follows: false,
        initial_request_n: 4,
        payload: Payload::from_data(Bytes::from_static(b"peek")),
    };
    let encoded = frame.encode();
    let header = FrameHeader::decode(&encoded).unwrap();
    assert_eq!(header.stream_id, 21);
    assert_eq!(header.frame_type, FrameType::RequestStream);
}

#[test]
fn truncated_frames_are_rejected() {
    let frame = Frame::Resume {
        version: Version::V1,
        token: Bytes::from_static(b"token"),
        last_received_server_position: 1,
        first_available_client_position: 0,
    };
    let encoded = frame.encode();
    for cut in [1, 5, encoded.len() - 1] {
        assert!(matches!(
            Frame::decode(&encoded[..cut]),
            Err(ProtocolError::FrameTooShort { .. })
        ));
    }
}

#[test]
fn unknown_frame_type_is_rejected() {
    // Type 0x3E is unassigned.
    let data = [0x00, 0x00, 0x00, 0x00, 0xF8, 0x00];
    assert!(matches!(
        Frame::decode(&data),
        Err(ProtocolError::UnknownFrameType(0x3E))
    ));
}

#[test]
fn unknown_error_code_is_rejected() {
    let mut data = Frame::Error {
        stream_id: 1,
        code: ErrorCode::Invalid,
        message: String::new(),
    }
    .encode()
    .to_vec();
    // Patch the code to a reserved value.
    data[6..10].copy_from_slice(&0x0300u32.to_be_bytes());
    assert!(matches!(
        Frame::decode(&data),
        Err(ProtocolError::UnknownErrorCode(0x300))
    ));
}

#[test]
fn serializer_probe_fixes_version_once() {
    let setup = Frame::Setup {
        version: Version::V1,
        keepalive_interval_ms: 1000,
        max_lifetime_ms: 3000,
        resume_token: None,
        lease: false,
        metadata_mime_type: "a/b".into(),
        data_mime_type: "a/b".into(),
        payload: Payload::default(),
    };
    let mut serializer = FrameSerializer::detecting();
    assert!(serializer.deserialize(&setup.encode()).is_err());
    assert_eq!(serializer.detect(&setup.encode()).unwrap(), Version::V1);
    assert!(serializer.deserialize(&setup.encode()).is_ok());
}
