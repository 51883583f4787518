//! A fake client driving the engine through its public surface: it encodes
//! client-side frames (with its own HPACK tables), feeds them to the
//! connection, and decodes whatever the connection wants written.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use bytes::Bytes;
use h2core::server::Builder;
use h2core::{Connection, Reason, StreamId};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const END_STREAM: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;
pub const FLAG_ACK: u8 = 0x1;

/// A server-side frame, decoded back out of the engine's write buffer.
#[derive(Debug, PartialEq)]
pub enum TestFrame {
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    Headers {
        id: u32,
        end_stream: bool,
        fields: Vec<(String, String)>,
    },
    Data {
        id: u32,
        end_stream: bool,
        payload: Vec<u8>,
    },
    Reset {
        id: u32,
        reason: Reason,
    },
    GoAway {
        last_stream_id: u32,
        reason: Reason,
        debug: String,
    },
    WindowUpdate {
        id: u32,
        increment: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    PushPromise {
        id: u32,
        promised_id: u32,
        fields: Vec<(String, String)>,
    },
    Origin {
        origins: Vec<String>,
    },
}

pub struct Peer {
    pub conn: Connection,
    pub now: Instant,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl Peer {
    /// A connection that has completed the preface exchange; the server
    /// preface frames are drained and sanity-checked.
    pub fn connected(builder: &Builder) -> Peer {
        let mut peer = Peer::handshaking(builder);
        peer.send(PREFACE);
        peer.send(&settings_frame(false, &[]));

        let frames = peer.drain_writes();
        assert!(
            matches!(frames[0], TestFrame::Settings { ack: false, .. }),
            "expected server SETTINGS, got {:?}",
            frames
        );
        peer
    }

    /// A connection that is still waiting for the client preface.
    pub fn handshaking(builder: &Builder) -> Peer {
        let now = Instant::now();
        Peer::from_conn(builder.handshake(now), now)
    }

    /// Wrap a connection built elsewhere (e.g. the h2c upgrade entry).
    pub fn from_conn(conn: Connection, now: Instant) -> Peer {
        Peer {
            conn,
            now,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    pub fn advance(&mut self, dur: Duration) {
        self.now += dur;
    }

    /// Advance past the next engine deadline and fire it.
    pub fn fire_next_timeout(&mut self) {
        let deadline = self.conn.next_timeout().expect("no pending timeout");
        self.now = deadline;
        self.conn.handle_timeout(self.now);
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.conn.recv(bytes, self.now);
    }

    pub fn send_headers(&mut self, id: u32, headers: &[(&str, &str)], flags: u8) {
        let frame = self.headers_frame(id, headers, flags);
        self.send(&frame);
    }

    pub fn send_data(&mut self, id: u32, payload: &[u8], end_stream: bool) {
        let frame = data_frame(id, payload, end_stream);
        self.send(&frame);
    }

    /// Encode a HEADERS frame with the peer's HPACK table.
    pub fn headers_frame(&mut self, id: u32, headers: &[(&str, &str)], flags: u8) -> Vec<u8> {
        let block = self
            .encoder
            .encode(headers.iter().map(|&(n, v)| (n.as_bytes(), v.as_bytes())));
        let mut frame = frame_header(block.len(), 0x1, flags | END_HEADERS, id);
        frame.extend_from_slice(&block);
        frame
    }

    /// Pull gathered writes out of the engine until it runs dry, decoding
    /// them into frames.
    pub fn drain_writes(&mut self) -> Vec<TestFrame> {
        let mut bytes = Vec::new();
        while let Some(buf) = self.conn.start_write(self.now) {
            bytes.extend_from_slice(&buf);
            self.conn.on_write_complete(self.now);
        }
        self.decode_frames(&bytes)
    }

    pub fn poll_events(&mut self) -> Vec<h2core::server::Event> {
        let mut events = Vec::new();
        while let Some(event) = self.conn.poll_event() {
            events.push(event);
        }
        events
    }

    fn decode_frames(&mut self, mut bytes: &[u8]) -> Vec<TestFrame> {
        let mut frames = Vec::new();

        while !bytes.is_empty() {
            assert!(bytes.len() >= 9, "truncated frame header");
            let len = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize;
            let kind = bytes[3];
            let flags = bytes[4];
            let id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & !(1 << 31);
            assert!(bytes.len() >= 9 + len, "truncated frame payload");
            let payload = &bytes[9..9 + len];

            match kind {
                0x0 => frames.push(TestFrame::Data {
                    id,
                    end_stream: flags & END_STREAM != 0,
                    payload: payload.to_vec(),
                }),
                0x1 => {
                    assert_ne!(flags & END_HEADERS, 0, "fragmented response headers");
                    frames.push(TestFrame::Headers {
                        id,
                        end_stream: flags & END_STREAM != 0,
                        fields: self.decode_block(payload),
                    });
                }
                0x3 => {
                    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    frames.push(TestFrame::Reset {
                        id,
                        reason: Reason::from(code),
                    });
                }
                0x4 => {
                    let params = payload
                        .chunks(6)
                        .map(|raw| {
                            (
                                ((raw[0] as u16) << 8) | raw[1] as u16,
                                u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
                            )
                        })
                        .collect();
                    frames.push(TestFrame::Settings {
                        ack: flags & FLAG_ACK != 0,
                        params,
                    });
                }
                0x5 => {
                    assert_ne!(flags & END_HEADERS, 0, "fragmented push promise");
                    let promised =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    frames.push(TestFrame::PushPromise {
                        id,
                        promised_id: promised,
                        fields: self.decode_block(&payload[4..]),
                    });
                }
                0x6 => {
                    let mut data = [0; 8];
                    data.copy_from_slice(payload);
                    frames.push(TestFrame::Ping {
                        ack: flags & FLAG_ACK != 0,
                        payload: data,
                    });
                }
                0x7 => {
                    let last =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                            & !(1 << 31);
                    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    frames.push(TestFrame::GoAway {
                        last_stream_id: last,
                        reason: Reason::from(code),
                        debug: String::from_utf8_lossy(&payload[8..]).into_owned(),
                    });
                }
                0x8 => frames.push(TestFrame::WindowUpdate {
                    id,
                    increment: u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) & !(1 << 31),
                }),
                0xc => {
                    let mut origins = Vec::new();
                    let mut rest = payload;
                    while rest.len() >= 2 {
                        let n = ((rest[0] as usize) << 8) | rest[1] as usize;
                        origins.push(String::from_utf8_lossy(&rest[2..2 + n]).into_owned());
                        rest = &rest[2 + n..];
                    }
                    frames.push(TestFrame::Origin { origins });
                }
                other => panic!("server emitted unexpected frame type {}", other),
            }

            bytes = &bytes[9 + len..];
        }

        frames
    }

    fn decode_block(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .expect("invalid header block from server")
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect()
    }
}

// ===== raw client-side frame builders =====

pub fn frame_header(len: usize, kind: u8, flags: u8, stream_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + len);
    buf.push((len >> 16) as u8);
    buf.push((len >> 8) as u8);
    buf.push(len as u8);
    buf.push(kind);
    buf.push(flags);
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf
}

pub fn data_frame(id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
    let flags = if end_stream { END_STREAM } else { 0 };
    let mut frame = frame_header(payload.len(), 0x0, flags, id);
    frame.extend_from_slice(payload);
    frame
}

pub fn settings_frame(ack: bool, params: &[(u16, u32)]) -> Vec<u8> {
    let flags = if ack { FLAG_ACK } else { 0 };
    let mut frame = frame_header(params.len() * 6, 0x4, flags, 0);
    for &(id, val) in params {
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&val.to_be_bytes());
    }
    frame
}

pub fn window_update_frame(id: u32, increment: u32) -> Vec<u8> {
    let mut frame = frame_header(4, 0x8, 0, id);
    frame.extend_from_slice(&increment.to_be_bytes());
    frame
}

pub fn rst_stream_frame(id: u32, code: u32) -> Vec<u8> {
    let mut frame = frame_header(4, 0x3, 0, id);
    frame.extend_from_slice(&code.to_be_bytes());
    frame
}

pub fn ping_frame(ack: bool, payload: [u8; 8]) -> Vec<u8> {
    let flags = if ack { FLAG_ACK } else { 0 };
    let mut frame = frame_header(8, 0x6, flags, 0);
    frame.extend_from_slice(&payload);
    frame
}

pub fn priority_frame(id: u32, dependency: u32, weight: u16, exclusive: bool) -> Vec<u8> {
    debug_assert!(weight >= 1 && weight <= 256);
    let mut frame = frame_header(5, 0x2, 0, id);
    let mut dep = dependency;
    if exclusive {
        dep |= 1 << 31;
    }
    frame.extend_from_slice(&dep.to_be_bytes());
    frame.push((weight - 1) as u8);
    frame
}

pub fn push_promise_frame(id: u32, promised_id: u32) -> Vec<u8> {
    let mut frame = frame_header(4, 0x5, END_HEADERS, id);
    frame.extend_from_slice(&promised_id.to_be_bytes());
    frame
}

pub fn goaway_frame(last_stream_id: u32, code: u32) -> Vec<u8> {
    let mut frame = frame_header(8, 0x7, 0, 0);
    frame.extend_from_slice(&last_stream_id.to_be_bytes());
    frame.extend_from_slice(&code.to_be_bytes());
    frame
}

// ===== small helpers =====

pub fn sid(id: u32) -> StreamId {
    StreamId::from(id)
}

pub fn bytes_of(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

pub fn get_headers<'a>(path: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", "example.com"),
        (":path", path),
    ]
}
