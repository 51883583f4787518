use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{util, Error, Frame, Head, Kind, StreamId};

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;

/// Data frame
///
/// DATA frames convey arbitrary, variable-length sequences of octets
/// associated with a stream.
#[derive(Debug)]
pub struct Data {
    stream_id: StreamId,
    data: Bytes,
    flags: DataFlag,
    /// Octets of padding stripped on load, pad-length octet included. Padding
    /// counts against flow control even though it never reaches the
    /// application.
    pad_len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFlag(u8);

impl Data {
    pub fn new(stream_id: StreamId, data: Bytes) -> Data {
        Data {
            stream_id,
            data,
            flags: DataFlag(0),
            pad_len: 0,
        }
    }

    pub fn load(head: Head, mut payload: Bytes) -> Result<Data, Error> {
        debug_assert_eq!(head.kind(), Kind::Data);

        let flags = DataFlag(head.flag());

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let pad_len = if flags.is_padded() {
            util::strip_padding(&mut payload)?
        } else {
            0
        };

        Ok(Data {
            stream_id: head.stream_id(),
            data: payload,
            flags,
            pad_len,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.is_end_stream()
    }

    pub fn set_end_stream(&mut self) {
        self.flags.set_end_stream()
    }

    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }

    /// Octets the frame occupied on the wire past its header; this is the
    /// amount to charge against flow-control windows.
    pub fn flow_len(&self) -> usize {
        self.data.len() + self.pad_len as usize
    }

    /// Octets that were padding.
    pub fn pad_len(&self) -> usize {
        self.pad_len as usize
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Data, self.flags.into(), self.stream_id);
        head.encode(self.data.len(), dst);
        dst.put_slice(&self.data);
    }
}

impl From<Data> for Frame {
    fn from(src: Data) -> Frame {
        Frame::Data(src)
    }
}

// ===== impl DataFlag =====

impl DataFlag {
    pub fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.0 |= END_STREAM
    }

    pub fn is_padded(&self) -> bool {
        self.0 & PADDED == PADDED
    }
}

impl From<DataFlag> for u8 {
    fn from(src: DataFlag) -> u8 {
        // Padding is stripped on load and never written, so the flag must not
        // survive a re-encode.
        src.0 & !PADDED
    }
}
