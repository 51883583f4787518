use bytes::{BufMut, BytesMut};

use crate::frame::{Head, Kind, StreamId};

/// ORIGIN frame (RFC 8336), server to client only.
///
/// This engine never parses ORIGIN frames; a client has no business sending
/// them, and unknown/unexpected types are skipped at the codec layer.
#[derive(Debug, Clone)]
pub struct Origin {
    origins: Vec<String>,
}

impl Origin {
    pub fn new(origins: Vec<String>) -> Origin {
        Origin { origins }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let payload_len: usize = self.origins.iter().map(|o| 2 + o.len()).sum();

        log::trace!("encoding ORIGIN; entries={}", self.origins.len());

        let head = Head::new(Kind::Origin, 0, StreamId::ZERO);
        head.encode(payload_len, dst);

        for origin in &self.origins {
            dst.put_u16(origin.len() as u16);
            dst.put_slice(origin.as_bytes());
        }
    }
}
