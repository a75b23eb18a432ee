//! Reassembly of fragmented initial requests.
//!
//! A remote-initiated request whose first frame carries FOLLOWS arrives as a
//! REQUEST_* frame followed by PAYLOAD continuations on the same stream; the
//! last continuation clears FOLLOWS. The accumulator buffers metadata and
//! data until then and synthesizes the logical unfragmented request, which
//! re-enters the stream creation path as if it had arrived whole.

use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, FrameType, Payload};

#[derive(Debug)]
pub struct FragmentAccumulator {
    stream_id: u32,
    kind: FrameType,
    initial_request_n: u32,
    /// COMPLETE observed on the request or its final fragment (channels only).
    complete: bool,
    metadata: Option<BytesMut>,
    data: BytesMut,
    max_bytes: usize,
}

impl FragmentAccumulator {
    /// Start reassembly from an initial request frame carrying FOLLOWS.
    pub fn new(frame: &Frame, max_bytes: usize) -> Result<Self> {
        let (stream_id, kind, initial_request_n, complete, payload) = match frame {
            Frame::RequestResponse {
                stream_id,
                follows: true,
                payload,
            } => (*stream_id, FrameType::RequestResponse, 0, false, payload),
            Frame::RequestFnf {
                stream_id,
                follows: true,
                payload,
            } => (*stream_id, FrameType::RequestFnf, 0, false, payload),
            Frame::RequestStream {
                stream_id,
                follows: true,
                initial_request_n,
                payload,
            } => (
                *stream_id,
                FrameType::RequestStream,
                *initial_request_n,
                false,
                payload,
            ),
            Frame::RequestChannel {
                stream_id,
                follows: true,
                complete,
                initial_request_n,
                payload,
            } => (
                *stream_id,
                FrameType::RequestChannel,
                *initial_request_n,
                *complete,
                payload,
            ),
            _ => {
                return Err(ProtocolError::InvalidFrame(
                    "fragment accumulator requires an initial request with FOLLOWS",
                ))
            }
        };

        let mut acc = FragmentAccumulator {
            stream_id,
            kind,
            initial_request_n,
            complete,
            metadata: None,
            data: BytesMut::new(),
            max_bytes,
        };
        acc.absorb(payload)?;
        Ok(acc)
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Append a PAYLOAD continuation. Returns `true` when FOLLOWS cleared
    /// and the request is fully assembled.
    pub fn append(&mut self, frame: &Frame) -> Result<bool> {
        let Frame::Payload {
            stream_id,
            follows,
            complete,
            payload,
            ..
        } = frame
        else {
            return Err(ProtocolError::InvalidFrame(
                "request fragments must be PAYLOAD frames",
            ));
        };
        if *stream_id != self.stream_id {
            return Err(ProtocolError::InvalidStreamId(*stream_id));
        }
        self.absorb(payload)?;
        self.complete |= *complete;
        Ok(!*follows)
    }

    /// Build the logical request frame the fragments add up to.
    pub fn finish(self) -> Frame {
        let payload = Payload {
            metadata: self.metadata.map(BytesMut::freeze),
            data: self.data.freeze(),
        };
        match self.kind {
            FrameType::RequestResponse => Frame::RequestResponse {
                stream_id: self.stream_id,
                follows: false,
                payload,
            },
            FrameType::RequestFnf => Frame::RequestFnf {
                stream_id: self.stream_id,
                follows: false,
                payload,
            },
            FrameType::RequestStream => Frame::RequestStream {
                stream_id: self.stream_id,
                follows: false,
                initial_request_n: self.initial_request_n,
                payload,
            },
            // `new` only admits the four request types.
            _ => Frame::RequestChannel {
                stream_id: self.stream_id,
                follows: false,
                complete: self.complete,
                initial_request_n: self.initial_request_n,
                payload,
            },
        }
    }

    fn absorb(&mut self, payload: &Payload) -> Result<()> {
        if let Some(metadata) = &payload.metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(metadata);
        }
        self.data.extend_from_slice(&payload.data);
        let size = self.metadata.as_ref().map_or(0, BytesMut::len) + self.data.len();
        if size > self.max_bytes {
            return Err(ProtocolError::FragmentLimitExceeded {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_fragment(stream_id: u32, data: &'static [u8], follows: bool) -> Frame {
        Frame::Payload {
            stream_id,
            follows,
            complete: false,
            next: true,
            payload: Payload::from_data(Bytes::from_static(data)),
        }
    }

    #[test]
    fn reassembles_request_stream() {
        let initial = Frame::RequestStream {
            stream_id: 2,
            follows: true,
            initial_request_n: 16,
            payload: Payload::from_data(Bytes::from_static(b"abc")),
        };
        let mut acc = FragmentAccumulator::new(&initial, 1024).unwrap();
        assert!(!acc.append(&payload_fragment(2, b"def", true)).unwrap());
        assert!(acc.append(&payload_fragment(2, b"ghi", false)).unwrap());

        let assembled = acc.finish();
        match assembled {
            Frame::RequestStream {
                stream_id,
                follows,
                initial_request_n,
                payload,
            } => {
                assert_eq!(stream_id, 2);
                assert!(!follows);
                assert_eq!(initial_request_n, 16);
                assert_eq!(&payload.data[..], b"abcdefghi");
                assert!(payload.metadata.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn metadata_concatenates_across_fragments() {
        let initial = Frame::RequestFnf {
            stream_id: 4,
            follows: true,
            payload: Payload::new(Some(Bytes::from_static(b"me")), Bytes::from_static(b"da")),
        };
        let mut acc = FragmentAccumulator::new(&initial, 1024).unwrap();
        let done = acc
            .append(&Frame::Payload {
                stream_id: 4,
                follows: false,
                complete: false,
                next: true,
                payload: Payload::new(Some(Bytes::from_static(b"ta")), Bytes::from_static(b"ta")),
            })
            .unwrap();
        assert!(done);

        match acc.finish() {
            Frame::RequestFnf { payload, .. } => {
                assert_eq!(payload.metadata.as_deref(), Some(&b"meta"[..]));
                assert_eq!(&payload.data[..], b"data");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn channel_complete_flag_survives_reassembly() {
        let initial = Frame::RequestChannel {
            stream_id: 6,
            follows: true,
            complete: false,
            initial_request_n: 1,
            payload: Payload::from_data(Bytes::from_static(b"x")),
        };
        let mut acc = FragmentAccumulator::new(&initial, 1024).unwrap();
        acc.append(&Frame::Payload {
            stream_id: 6,
            follows: false,
            complete: true,
            next: true,
            payload: Payload::from_data(Bytes::from_static(b"y")),
        })
        .unwrap();
        assert!(matches!(
            acc.finish(),
            Frame::RequestChannel { complete: true, .. }
        ));
    }

    #[test]
    fn oversized_reassembly_is_rejected() {
        let initial = Frame::RequestFnf {
            stream_id: 8,
            follows: true,
            payload: Payload::from_data(Bytes::from(vec![0u8; 600])),
        };
        let mut acc = FragmentAccumulator::new(&initial, 1000).unwrap();
        let err = acc
            .append(&Frame::Payload {
                stream_id: 8,
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from_data(Bytes::from(vec![0u8; 600])),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FragmentLimitExceeded { .. }));
    }

    #[test]
    fn unfragmented_request_is_refused() {
        let whole = Frame::RequestResponse {
            stream_id: 2,
            follows: false,
            payload: Payload::from_data(Bytes::from_static(b"whole")),
        };
        assert!(FragmentAccumulator::new(&whole, 1024).is_err());
    }
}
