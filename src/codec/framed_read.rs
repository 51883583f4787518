use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};

use crate::codec::RecvError;
use crate::frame::{self, Frame, Head, Kind, Reason, StreamId};

/// Decodes frames out of a raw inbound byte buffer.
///
/// The reactor appends whatever it read from the socket; `next_frame` hands
/// back one complete frame at a time. HEADERS and their CONTINUATIONs are
/// assembled here and delivered as a single decoded `Headers` frame, so the
/// connection layer never sees a partial header block.
pub struct FramedRead {
    buf: BytesMut,

    // hpack decoder state (the inbound dynamic table)
    hpack: hpack::Decoder<'static>,

    max_frame_size: u32,

    /// Cap on the accumulated size of one header block across CONTINUATIONs.
    max_header_list_size: usize,

    partial: Option<Partial>,
}

/// A headers frame waiting for the rest of its block.
#[derive(Debug)]
struct Partial {
    frame: frame::Headers,
    buf: BytesMut,

    /// Set once the block outgrew `max_header_list_size`; the rest of the
    /// block is discarded and the stream refused at END_HEADERS.
    overflow: bool,
}

impl std::fmt::Debug for FramedRead {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        // The hpack decoder carries no Debug impl; summarize around it.
        fmt.debug_struct("FramedRead")
            .field("buffered", &self.buf.len())
            .field("max_frame_size", &self.max_frame_size)
            .field("partial", &self.partial)
            .finish()
    }
}

impl FramedRead {
    pub fn new(max_frame_size: u32, max_header_list_size: usize) -> FramedRead {
        FramedRead {
            buf: BytesMut::with_capacity(4_096),
            hpack: hpack::Decoder::new(),
            max_frame_size,
            max_header_list_size,
            partial: None,
        }
    }

    pub fn extend(&mut self, src: &[u8]) {
        self.buf.extend_from_slice(src);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to take the 24-byte client preface off the front of the buffer.
    ///
    /// `Ok(false)` means not enough bytes yet; `Err(())` means the bytes are
    /// not a preface and the connection must be dropped on the floor.
    pub fn read_preface(&mut self, preface: &[u8]) -> Result<bool, ()> {
        let n = self.buf.len().min(preface.len());

        if self.buf[..n] != preface[..n] {
            return Err(());
        }
        if n < preface.len() {
            return Ok(false);
        }

        let _ = self.buf.split_to(preface.len());
        Ok(true)
    }

    /// Update the decoder's dynamic table limit, from our own
    /// HEADER_TABLE_SIZE setting.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.hpack.set_max_table_size(size);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            if self.buf.len() < frame::HEADER_LEN {
                return Ok(None);
            }

            let len = BigEndian::read_uint(&self.buf[..3], 3) as usize;

            if len > self.max_frame_size as usize {
                debug!("connection error FRAME_SIZE_ERROR -- frame len={}", len);
                return Err(RecvError::connection(
                    Reason::FRAME_SIZE_ERROR,
                    "frame exceeds SETTINGS_MAX_FRAME_SIZE",
                ));
            }

            if self.buf.len() < frame::HEADER_LEN + len {
                return Ok(None);
            }

            let mut bytes = self.buf.split_to(frame::HEADER_LEN + len);
            let head = Head::parse(&bytes);
            let _ = bytes.split_to(frame::HEADER_LEN);

            if let Some(frame) = self.decode_frame(head, bytes.freeze())? {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_frame(&mut self, head: Head, payload: Bytes) -> Result<Option<Frame>, RecvError> {
        let kind = head.kind();

        trace!("decoding frame; kind={:?} len={}", kind, payload.len());

        if self.partial.is_some() && kind != Kind::Continuation {
            debug!(
                "connection error PROTOCOL_ERROR -- expected CONTINUATION, got {:?}",
                kind
            );
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "expected CONTINUATION frame",
            ));
        }

        let frame = match kind {
            Kind::Settings => frame::Settings::load(head, &payload)
                .map_err(|e| {
                    debug!("failed to load SETTINGS frame; err={:?}", e);
                    RecvError::connection(Reason::PROTOCOL_ERROR, "invalid SETTINGS frame")
                })?
                .into(),
            Kind::Ping => frame::Ping::load(head, &payload)
                .map_err(|e| {
                    debug!("failed to load PING frame; err={:?}", e);
                    match e {
                        frame::Error::BadFrameSize => RecvError::connection(
                            Reason::FRAME_SIZE_ERROR,
                            "invalid PING frame size",
                        ),
                        _ => RecvError::connection(Reason::PROTOCOL_ERROR, "invalid PING frame"),
                    }
                })?
                .into(),
            Kind::WindowUpdate => frame::WindowUpdate::load(head, &payload)
                .map_err(|e| {
                    debug!("failed to load WINDOW_UPDATE frame; err={:?}", e);
                    RecvError::connection(Reason::FRAME_SIZE_ERROR, "invalid WINDOW_UPDATE frame")
                })?
                .into(),
            Kind::Data => frame::Data::load(head, payload)
                .map_err(|e| {
                    debug!("failed to load DATA frame; err={:?}", e);
                    RecvError::connection(Reason::PROTOCOL_ERROR, "invalid DATA frame")
                })?
                .into(),
            Kind::Headers => {
                let (frame, block) = frame::Headers::load(head, payload).map_err(|e| match e {
                    frame::Error::InvalidDependencyId => {
                        // A stream cannot depend on itself; the original
                        // treats this as a connection-level violation.
                        RecvError::connection(
                            Reason::PROTOCOL_ERROR,
                            "stream cannot depend on itself",
                        )
                    }
                    _ => {
                        debug!("failed to load HEADERS frame; err={:?}", e);
                        RecvError::connection(Reason::PROTOCOL_ERROR, "invalid HEADERS frame")
                    }
                })?;

                let mut partial = Partial {
                    frame,
                    buf: BytesMut::from(&block[..]),
                    overflow: false,
                };

                if partial.buf.len() > self.max_header_list_size {
                    partial.overflow = true;
                    partial.buf.clear();
                }

                if partial.frame.is_end_headers() {
                    return self.finish_header_block(partial).map(Some);
                }

                self.partial = Some(partial);
                return Ok(None);
            }
            Kind::Reset => frame::Reset::load(head, &payload)
                .map_err(|_| RecvError::connection(Reason::FRAME_SIZE_ERROR, "invalid RST_STREAM frame"))?
                .into(),
            Kind::GoAway => frame::GoAway::load(&payload)
                .map_err(|_| RecvError::connection(Reason::PROTOCOL_ERROR, "invalid GOAWAY frame"))?
                .into(),
            Kind::Priority => {
                if head.stream_id().is_zero() {
                    return Err(RecvError::connection(
                        Reason::PROTOCOL_ERROR,
                        "invalid stream id in PRIORITY frame",
                    ));
                }

                frame::Priority::load(head, &payload)
                    .map_err(|_| {
                        RecvError::connection(Reason::FRAME_SIZE_ERROR, "invalid PRIORITY frame")
                    })?
                    .into()
            }
            Kind::PushPromise => {
                // Clients must not push.
                return Err(RecvError::connection(
                    Reason::PROTOCOL_ERROR,
                    "received PUSH_PROMISE frame",
                ));
            }
            Kind::Continuation => {
                let mut partial = match self.partial.take() {
                    Some(partial) => partial,
                    None => {
                        debug!("connection error PROTOCOL_ERROR -- unexpected CONTINUATION");
                        return Err(RecvError::connection(
                            Reason::PROTOCOL_ERROR,
                            "received invalid CONTINUATION frame",
                        ));
                    }
                };

                // The stream identifiers must match.
                if partial.frame.stream_id() != head.stream_id() {
                    return Err(RecvError::connection(
                        Reason::PROTOCOL_ERROR,
                        "unexpected stream id in CONTINUATION frame",
                    ));
                }

                if partial.buf.len() + payload.len() > self.max_header_list_size {
                    partial.overflow = true;
                    partial.buf.clear();
                }
                if !partial.overflow {
                    partial.buf.extend_from_slice(&payload);
                }

                let end_of_headers = head.flag() & 0x4 == 0x4;
                if !end_of_headers {
                    self.partial = Some(partial);
                    return Ok(None);
                }

                return self.finish_header_block(partial).map(Some);
            }
            Kind::Origin | Kind::Unknown => {
                // Unknown and unexpected extension frames are ignored.
                return Ok(None);
            }
        };

        Ok(Some(frame))
    }

    fn finish_header_block(&mut self, mut partial: Partial) -> Result<Frame, RecvError> {
        let id = partial.frame.stream_id();

        if partial.overflow {
            debug!("stream error REFUSED_STREAM -- header block too large; id={:?}", id);
            return Err(RecvError::stream(id, Reason::REFUSED_STREAM));
        }

        match partial.frame.load_hpack(&partial.buf, &mut self.hpack) {
            Ok(()) => {}
            Err(frame::Error::MalformedMessage) => {
                debug!("stream error PROTOCOL_ERROR -- malformed header block; id={:?}", id);
                return Err(RecvError::stream(id, Reason::PROTOCOL_ERROR));
            }
            Err(e) => {
                debug!("connection error COMPRESSION_ERROR -- {:?}", e);
                return Err(RecvError::connection(
                    Reason::COMPRESSION_ERROR,
                    "error while decoding header block",
                ));
            }
        }

        partial.frame.set_end_headers();
        Ok(partial.frame.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn framed() -> FramedRead {
        FramedRead::new(16_384, 16_384)
    }

    fn encode_headers_block(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        encoder.encode(pairs.iter().map(|&(n, v)| (n, v)))
    }

    #[test]
    fn assembles_headers_and_continuation() {
        let block = encode_headers_block(&[
            (b":method", b"GET"),
            (b":scheme", b"https"),
            (b":authority", b"x"),
            (b":path", b"/"),
        ]);
        let (first, rest) = block.split_at(block.len() / 2);

        let mut buf = BytesMut::new();
        // HEADERS without END_HEADERS
        Head::new(Kind::Headers, 0x1, 1.into()).encode(first.len(), &mut buf);
        buf.put_slice(first);
        // CONTINUATION with END_HEADERS
        Head::new(Kind::Continuation, 0x4, 1.into()).encode(rest.len(), &mut buf);
        buf.put_slice(rest);

        let mut framed = framed();
        framed.extend(&buf);

        match framed.next_frame().unwrap() {
            Some(Frame::Headers(h)) => {
                assert!(h.is_end_stream());
                assert_eq!(h.pseudo().path.as_deref(), Some(&b"/"[..]));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(framed.next_frame().unwrap().is_none());
    }

    #[test]
    fn unexpected_continuation_is_a_connection_error() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Continuation, 0x4, 1.into()).encode(0, &mut buf);

        let mut framed = framed();
        framed.extend(&buf);

        match framed.next_frame() {
            Err(RecvError::Connection { reason, .. }) => {
                assert_eq!(reason, Reason::PROTOCOL_ERROR)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn interleaved_frame_during_header_block_is_rejected() {
        let block = encode_headers_block(&[(b":method", b"GET")]);

        let mut buf = BytesMut::new();
        Head::new(Kind::Headers, 0, 1.into()).encode(block.len(), &mut buf);
        buf.put_slice(&block);
        Head::new(Kind::Ping, 0, 0.into()).encode(8, &mut buf);
        buf.put_slice(&[0; 8]);

        let mut framed = framed();
        framed.extend(&buf);

        assert!(framed.next_frame().unwrap().is_none());
        match framed.next_frame() {
            Err(RecvError::Connection { desc, .. }) => {
                assert_eq!(desc, "expected CONTINUATION frame")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn oversized_header_block_refuses_the_stream() {
        let mut framed = FramedRead::new(16_384, 32);

        let block = encode_headers_block(&[(b":method", b"GET"), (b"x-pad", &[b'a'; 100])]);
        let mut buf = BytesMut::new();
        Head::new(Kind::Headers, 0x4, 3.into()).encode(block.len(), &mut buf);
        buf.put_slice(&block);

        framed.extend(&buf);
        match framed.next_frame() {
            Err(RecvError::Stream { id, reason }) => {
                assert_eq!(id, StreamId::from(3));
                assert_eq!(reason, Reason::REFUSED_STREAM);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn preface_is_consumed_incrementally() {
        let preface = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
        let mut framed = framed();

        framed.extend(&preface[..10]);
        assert_eq!(framed.read_preface(preface), Ok(false));

        framed.extend(&preface[10..]);
        assert_eq!(framed.read_preface(preface), Ok(true));
        assert_eq!(framed.buffered(), 0);
    }

    #[test]
    fn garbage_preface_is_rejected() {
        let mut framed = framed();
        framed.extend(b"GET / HTTP/1.1\r\n");
        assert!(framed.read_preface(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").is_err());
    }
}
