use bytes::{Bytes, BytesMut};
use log::trace;

use crate::frame::{self, Frame};

/// Initialize the connection with this amount of write buffer.
const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1_024;

/// The gathered-write buffer.
///
/// Frames are flattened into `buf`; `start_write` swaps the whole buffer into
/// the in-flight slot and hands it to the reactor. While a write is in
/// flight no second write may be issued, and new frames keep accumulating in
/// `buf` for the next cycle.
pub struct FramedWrite {
    /// Write buffer being filled.
    buf: BytesMut,

    /// Buffer handed to the reactor, owned here until `on_write_complete`.
    in_flight: Option<Bytes>,

    /// HPACK encoder (the outbound dynamic table).
    hpack: hpack::Encoder<'static>,

    /// Max frame size, as specified by the peer.
    max_frame_size: usize,
}

impl std::fmt::Debug for FramedWrite {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        // The hpack encoder carries no Debug impl; summarize around it.
        fmt.debug_struct("FramedWrite")
            .field("buffered", &self.buf.len())
            .field("in_flight", &self.in_flight.as_ref().map(|b| b.len()))
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl FramedWrite {
    pub fn new() -> FramedWrite {
        FramedWrite {
            buf: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            in_flight: None,
            hpack: hpack::Encoder::new(),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, val: usize) {
        debug_assert!(
            frame::DEFAULT_MAX_FRAME_SIZE as usize <= val
                && val <= frame::MAX_MAX_FRAME_SIZE as usize
        );
        self.max_frame_size = val;
    }

    /// Flatten a frame into the write buffer.
    pub fn buffer(&mut self, item: Frame) {
        trace!("buffering frame; frame={:?}", item);

        match item {
            Frame::Data(v) => v.encode(&mut self.buf),
            Frame::Headers(v) => v.encode(&mut self.hpack, &mut self.buf, self.max_frame_size),
            Frame::PushPromise(v) => {
                v.encode(&mut self.hpack, &mut self.buf, self.max_frame_size)
            }
            Frame::Settings(v) => v.encode(&mut self.buf),
            Frame::Ping(v) => v.encode(&mut self.buf),
            Frame::Reset(v) => v.encode(&mut self.buf),
            Frame::GoAway(v) => v.encode(&mut self.buf),
            Frame::WindowUpdate(v) => v.encode(&mut self.buf),
            Frame::Priority(_) => unreachable!("server never sends PRIORITY"),
        }
    }

    pub fn buffer_origin(&mut self, origin: &frame::Origin) {
        origin.encode(&mut self.buf);
    }

    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Bytes sitting in this writer, in-flight write included. The
    /// connection's soft output limit is enforced against this value.
    pub fn bytes_in_buf(&self) -> usize {
        self.buf.len() + self.in_flight.as_ref().map_or(0, |b| b.len())
    }

    /// Take the buffered bytes for one gathered socket write.
    ///
    /// Returns `None` while a previous write is still in flight or when there
    /// is nothing to send.
    pub fn start_write(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() || self.buf.is_empty() {
            return None;
        }

        let bytes = self.buf.split().freeze();
        trace!("starting write; len={}", bytes.len());
        self.in_flight = Some(bytes.clone());
        Some(bytes)
    }

    pub fn on_write_complete(&mut self) {
        debug_assert!(self.in_flight.is_some());
        self.in_flight = None;
    }
}
