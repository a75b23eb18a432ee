//! Fire-and-forget: a single request frame, no responses.
//!
//! The requester machine exists just long enough to emit REQUEST_FNF; it is
//! terminal from birth and the connection reaps it after the first drain.
//! Inbound fire-and-forget requests never get a machine at all — the
//! connection hands the (reassembled) payload straight to the responder.

use crate::frame::{Frame, Payload};

use super::{Side, StreamCore};

#[derive(Debug)]
pub struct FireAndForget {
    pub(crate) core: StreamCore,
}

impl FireAndForget {
    pub fn requester(stream_id: u32, payload: Payload) -> Self {
        let mut core = StreamCore::new(stream_id, Side::Requester);
        core.emit(Frame::RequestFnf {
            stream_id,
            follows: false,
            payload,
        });
        core.terminate();
        FireAndForget { core }
    }

    pub(crate) fn on_frame(&mut self, frame: Frame) {
        tracing::debug!(
            stream_id = self.core.stream_id,
            frame_type = ?frame.frame_type(),
            "dropping frame for fire-and-forget stream"
        );
    }
}
