use bytes::BufMut;

use crate::frame::Error;

/// The 9-byte header that precedes every HTTP/2 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Origin = 12,
    Unknown,
}

/// A stream identifier: odd ids are pull (client-initiated) streams, even
/// non-zero ids are push (server-initiated) streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

pub const STREAM_ID_MASK: u32 = 1 << 31;

// ===== impl Head =====

impl Head {
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse a frame header, exclusive of the 24-bit length that precedes it
    /// on the wire.
    pub fn parse(header: &[u8]) -> Head {
        Head {
            kind: Kind::new(header[3]),
            flag: header[4],
            stream_id: StreamId::parse(&header[5..9]),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn encode<T: BufMut>(&self, payload_len: usize, dst: &mut T) {
        debug_assert!(self.kind != Kind::Unknown);
        debug_assert!(payload_len < 1 << 24);

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.into());
    }
}

// ===== impl Kind =====

impl Kind {
    pub fn new(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            12 => Kind::Origin,
            _ => Kind::Unknown,
        }
    }
}

// ===== impl StreamId =====

impl StreamId {
    pub const ZERO: StreamId = StreamId(0);
    pub const MAX: StreamId = StreamId(u32::max_value() >> 1);

    /// Parse the stream identifier field of a frame header, ignoring the
    /// reserved high bit.
    pub fn parse(buf: &[u8]) -> StreamId {
        let unpacked = unpack_octets_4!(buf, 0, u32);
        StreamId(unpacked & !STREAM_ID_MASK)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the id names a client-initiated stream.
    pub fn is_pull(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Returns true if the id names a server-initiated stream.
    pub fn is_push(&self) -> bool {
        !self.is_zero() && self.0 % 2 == 0
    }

    pub fn next_push(&self) -> Result<StreamId, Error> {
        let next = self.0 + 2;
        if next > u32::from(StreamId::MAX) {
            return Err(Error::InvalidStreamId);
        }
        Ok(StreamId(next))
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> Self {
        debug_assert_eq!(src & STREAM_ID_MASK, 0, "invalid stream id -- MSB is set");
        StreamId(src)
    }
}

impl From<StreamId> for u32 {
    fn from(src: StreamId) -> Self {
        src.0
    }
}

impl PartialEq<u32> for StreamId {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}
