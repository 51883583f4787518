use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Error, Frame, Head, Kind, Reason, StreamId};

/// GOAWAY frame: no streams beyond `last_stream_id` will be processed.
#[derive(Debug, Clone)]
pub struct GoAway {
    last_stream_id: StreamId,
    error_code: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub fn new(last_stream_id: StreamId, reason: Reason) -> Self {
        GoAway {
            last_stream_id,
            error_code: reason,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(last_stream_id: StreamId, reason: Reason, debug_data: Bytes) -> Self {
        GoAway {
            last_stream_id,
            error_code: reason,
            debug_data,
        }
    }

    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }

    pub fn load(payload: &[u8]) -> Result<GoAway, Error> {
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let last_stream_id = StreamId::parse(&payload[..4]);
        let error_code = unpack_octets_4!(payload, 4, u32);
        let debug_data = Bytes::copy_from_slice(&payload[8..]);

        Ok(GoAway {
            last_stream_id,
            error_code: error_code.into(),
            debug_data,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        log::trace!(
            "encoding GO_AWAY; code={:?} last={:?}",
            self.error_code,
            self.last_stream_id
        );
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.into());
        dst.put_u32(self.error_code.into());
        dst.put_slice(&self.debug_data);
    }
}

impl From<GoAway> for Frame {
    fn from(src: GoAway) -> Frame {
        Frame::GoAway(src)
    }
}
