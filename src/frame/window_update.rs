use bytes::{BufMut, BytesMut};

use crate::frame::{Error, Frame, Head, Kind, StreamId};

const SIZE_INCREMENT_MASK: u32 = 1 << 31;

/// WINDOW_UPDATE frame: replenishes a flow-control window by `increment`
/// octets. Stream zero targets the connection-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    stream_id: StreamId,
    size_increment: u32,
}

impl WindowUpdate {
    pub fn new(stream_id: StreamId, size_increment: u32) -> WindowUpdate {
        WindowUpdate {
            stream_id,
            size_increment,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn size_increment(&self) -> u32 {
        self.size_increment
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<WindowUpdate, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);

        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // Clear the reserved high bit.
        let size_increment = unpack_octets_4!(payload, 0, u32) & !SIZE_INCREMENT_MASK;

        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        log::trace!("encoding WINDOW_UPDATE; id={:?} incr={}", self.stream_id, self.size_increment);
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}

impl From<WindowUpdate> for Frame {
    fn from(src: WindowUpdate) -> Frame {
        Frame::WindowUpdate(src)
    }
}
