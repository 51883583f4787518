use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

use crate::frame::{util, Error, Frame, Head, Kind, StreamDependency, StreamId};

/// Header frame
///
/// Decoded from the wire this is a request (or a trailer block); encoded to
/// the wire it is a response. Pseudo headers are broken out as they must be
/// sent before any regular field.
#[derive(Debug)]
pub struct Headers {
    stream_id: StreamId,

    /// The stream dependency information, present when the PRIORITY flag was
    /// set on the frame.
    stream_dep: Option<StreamDependency>,

    /// The decoded regular header fields.
    fields: HeaderMap,

    pseudo: Pseudo,

    flags: HeadersFlag,

    /// Parsed `content-length`, if the field was present.
    content_length: Option<u64>,

    /// Set when a field carried a character that may not appear in a header
    /// name or value. The block stays usable; the connection answers with a
    /// 400 instead of tearing anything down.
    invalid_header_char: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersFlag(u8);

/// PUSH_PROMISE frame. The engine only ever emits these.
#[derive(Debug)]
pub struct PushPromise {
    stream_id: StreamId,
    promised_id: StreamId,
    pseudo: Pseudo,
    fields: HeaderMap,
}

#[derive(Debug, Default)]
pub struct Pseudo {
    pub method: Option<Method>,
    pub scheme: Option<Bytes>,
    pub authority: Option<Bytes>,
    pub path: Option<Bytes>,
    pub status: Option<StatusCode>,
}

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;
const ALL: u8 = END_STREAM | END_HEADERS | PADDED | PRIORITY;

// ===== impl Headers =====

impl Headers {
    /// Create a response HEADERS frame.
    pub fn response(stream_id: StreamId, status: StatusCode, fields: HeaderMap) -> Self {
        Headers {
            stream_id,
            stream_dep: None,
            fields,
            pseudo: Pseudo::response(status),
            flags: HeadersFlag::default(),
            content_length: None,
            invalid_header_char: false,
        }
    }

    /// Create a trailers frame.
    pub fn trailers(stream_id: StreamId, fields: HeaderMap) -> Self {
        let mut headers = Headers::response(stream_id, StatusCode::OK, fields);
        headers.pseudo = Pseudo::default();
        headers.flags.set_end_stream();
        headers
    }

    /// Parse the non-compressed portion of the frame, returning the frame
    /// along with the (possibly partial) header block fragment.
    pub fn load(head: Head, mut payload: Bytes) -> Result<(Self, Bytes), Error> {
        let flags = HeadersFlag::load(head.flag());

        if flags.is_padded() {
            util::strip_padding(&mut payload)?;
        }

        let stream_dep = if flags.is_priority() {
            if payload.len() < 5 {
                return Err(Error::PayloadLengthTooShort);
            }

            let dep = StreamDependency::load(&payload[..5])?;

            // A stream cannot depend on itself. An endpoint MUST treat this
            // as a stream error (Section 5.4.2) of type PROTOCOL_ERROR.
            if dep.dependency == head.stream_id() {
                return Err(Error::InvalidDependencyId);
            }

            let _ = payload.split_to(5);
            Some(dep)
        } else {
            None
        };

        let headers = Headers {
            stream_id: head.stream_id(),
            stream_dep,
            fields: HeaderMap::new(),
            pseudo: Pseudo::default(),
            flags,
            content_length: None,
            invalid_header_char: false,
        };

        Ok((headers, payload))
    }

    /// Decode the assembled header block into pseudo and regular fields.
    pub fn load_hpack(
        &mut self,
        src: &[u8],
        decoder: &mut hpack::Decoder,
    ) -> Result<(), Error> {
        let decoded = decoder.decode(src).map_err(Error::Hpack)?;

        let mut saw_regular = false;
        let mut malformed = false;

        macro_rules! set_pseudo {
            ($field:ident, $val:expr) => {{
                if saw_regular || self.pseudo.$field.is_some() {
                    malformed = true;
                } else {
                    self.pseudo.$field = Some($val);
                }
            }};
        }

        for (name, value) in decoded {
            match &name[..] {
                b":method" => match Method::from_bytes(&value) {
                    Ok(method) => set_pseudo!(method, method),
                    Err(_) => malformed = true,
                },
                b":scheme" => set_pseudo!(scheme, Bytes::from(value)),
                b":authority" => set_pseudo!(authority, Bytes::from(value)),
                b":path" => set_pseudo!(path, Bytes::from(value)),
                b":status" => {
                    // A request carrying :status is malformed.
                    malformed = true;
                }
                _ if name.starts_with(b":") => {
                    malformed = true;
                }
                b"content-length" => {
                    saw_regular = true;
                    match parse_u64(&value) {
                        Some(len) => {
                            if self.content_length.map_or(false, |cur| cur != len) {
                                malformed = true;
                            }
                            self.content_length = Some(len);
                        }
                        None => malformed = true,
                    }
                }
                b"connection" | b"keep-alive" | b"proxy-connection" | b"transfer-encoding"
                | b"upgrade" => {
                    // Connection-specific fields must not appear in HTTP/2.
                    malformed = true;
                }
                b"te" => {
                    saw_regular = true;
                    if &value[..] != b"trailers" {
                        malformed = true;
                    }
                }
                _ => {
                    saw_regular = true;

                    if name.iter().any(u8::is_ascii_uppercase) {
                        malformed = true;
                        continue;
                    }

                    let name = match HeaderName::from_bytes(&name) {
                        Ok(name) => name,
                        Err(_) => {
                            self.invalid_header_char = true;
                            continue;
                        }
                    };
                    let value = match HeaderValue::from_bytes(&value) {
                        Ok(value) => value,
                        Err(_) => {
                            self.invalid_header_char = true;
                            continue;
                        }
                    };

                    self.fields.append(name, value);
                }
            }
        }

        if malformed {
            return Err(Error::MalformedMessage);
        }

        Ok(())
    }

    /// Returns `true` if the frame represents trailers.
    ///
    /// Trailers are header frames that contain no pseudo headers.
    pub fn is_trailers(&self) -> bool {
        self.pseudo.method.is_none() && self.pseudo.status.is_none()
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags.is_end_headers()
    }

    pub fn set_end_headers(&mut self) {
        self.flags.set_end_headers()
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.is_end_stream()
    }

    pub fn set_end_stream(&mut self) {
        self.flags.set_end_stream()
    }

    pub fn has_priority(&self) -> bool {
        self.stream_dep.is_some()
    }

    pub fn stream_dep(&self) -> Option<StreamDependency> {
        self.stream_dep
    }

    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn has_invalid_header_char(&self) -> bool {
        self.invalid_header_char
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    pub fn into_parts(self) -> (Pseudo, HeaderMap) {
        (self.pseudo, self.fields)
    }

    /// Flatten the frame into `dst`, splitting the header block into
    /// CONTINUATION frames when it exceeds `max_frame_size`.
    pub fn encode(self, encoder: &mut hpack::Encoder, dst: &mut BytesMut, max_frame_size: usize) {
        let block = encode_block(encoder, &self.pseudo, &self.fields);

        let mut flags = self.flags;
        flags.unset_end_headers();

        encode_header_block(
            dst,
            Kind::Headers,
            flags.into(),
            self.stream_id,
            &[],
            &block,
            max_frame_size,
        );
    }
}

impl From<Headers> for Frame {
    fn from(src: Headers) -> Frame {
        Frame::Headers(src)
    }
}

// ===== impl PushPromise =====

impl PushPromise {
    /// A PUSH_PROMISE carrying a synthesized GET request head.
    pub fn new(
        stream_id: StreamId,
        promised_id: StreamId,
        pseudo: Pseudo,
        fields: HeaderMap,
    ) -> Self {
        PushPromise {
            stream_id,
            promised_id,
            pseudo,
            fields,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn promised_id(&self) -> StreamId {
        self.promised_id
    }

    pub fn encode(self, encoder: &mut hpack::Encoder, dst: &mut BytesMut, max_frame_size: usize) {
        let block = encode_block(encoder, &self.pseudo, &self.fields);

        let mut promised = [0; 4];
        promised.copy_from_slice(&u32::from(self.promised_id).to_be_bytes());

        encode_header_block(
            dst,
            Kind::PushPromise,
            0,
            self.stream_id,
            &promised,
            &block,
            max_frame_size,
        );
    }
}

impl From<PushPromise> for Frame {
    fn from(src: PushPromise) -> Frame {
        Frame::PushPromise(src)
    }
}

// ===== impl Pseudo =====

impl Pseudo {
    pub fn request(method: Method, scheme: Bytes, authority: Bytes, path: Bytes) -> Self {
        Pseudo {
            method: Some(method),
            scheme: Some(scheme),
            authority: Some(authority),
            path: Some(path),
            status: None,
        }
    }

    pub fn response(status: StatusCode) -> Self {
        Pseudo {
            method: None,
            scheme: None,
            authority: None,
            path: None,
            status: Some(status),
        }
    }
}

// ===== impl HeadersFlag =====

impl HeadersFlag {
    pub fn empty() -> HeadersFlag {
        HeadersFlag(0)
    }

    pub fn load(bits: u8) -> HeadersFlag {
        HeadersFlag(bits & ALL)
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.0 |= END_STREAM
    }

    pub fn is_end_headers(&self) -> bool {
        self.0 & END_HEADERS == END_HEADERS
    }

    pub fn set_end_headers(&mut self) {
        self.0 |= END_HEADERS
    }

    fn unset_end_headers(&mut self) {
        self.0 &= !END_HEADERS;
    }

    pub fn is_padded(&self) -> bool {
        self.0 & PADDED == PADDED
    }

    pub fn is_priority(&self) -> bool {
        self.0 & PRIORITY == PRIORITY
    }
}

impl Default for HeadersFlag {
    /// Returns a `HeadersFlag` value with `END_HEADERS` set.
    fn default() -> Self {
        HeadersFlag(END_HEADERS)
    }
}

impl From<HeadersFlag> for u8 {
    fn from(src: HeadersFlag) -> u8 {
        src.0
    }
}

// ===== encoding helpers =====

fn encode_block(encoder: &mut hpack::Encoder, pseudo: &Pseudo, fields: &HeaderMap) -> Vec<u8> {
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(fields.len() + 4);

    if let Some(ref method) = pseudo.method {
        pairs.push((b":method".to_vec(), method.as_str().as_bytes().to_vec()));
    }
    if let Some(ref scheme) = pseudo.scheme {
        pairs.push((b":scheme".to_vec(), scheme.to_vec()));
    }
    if let Some(ref authority) = pseudo.authority {
        pairs.push((b":authority".to_vec(), authority.to_vec()));
    }
    if let Some(ref path) = pseudo.path {
        pairs.push((b":path".to_vec(), path.to_vec()));
    }
    if let Some(status) = pseudo.status {
        pairs.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
    }

    for (name, value) in fields.iter() {
        pairs.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
    }

    encoder.encode(pairs.iter().map(|&(ref n, ref v)| (&n[..], &v[..])))
}

/// Write a header-bearing frame, spilling the block into CONTINUATION frames
/// past `max_frame_size`. The `prefix` (promised stream id for PUSH_PROMISE)
/// counts against the first frame's length.
fn encode_header_block(
    dst: &mut BytesMut,
    kind: Kind,
    flags: u8,
    stream_id: StreamId,
    prefix: &[u8],
    block: &[u8],
    max_frame_size: usize,
) {
    debug_assert!(prefix.len() < max_frame_size);

    let first_len = (max_frame_size - prefix.len()).min(block.len());
    let (first, mut rest) = block.split_at(first_len);

    let mut first_flags = flags;
    if rest.is_empty() {
        first_flags |= END_HEADERS;
    }

    let head = Head::new(kind, first_flags, stream_id);
    head.encode(prefix.len() + first.len(), dst);
    dst.put_slice(prefix);
    dst.put_slice(first);

    while !rest.is_empty() {
        let len = max_frame_size.min(rest.len());
        let (chunk, tail) = rest.split_at(len);
        rest = tail;

        let flags = if rest.is_empty() { END_HEADERS } else { 0 };
        let head = Head::new(Kind::Continuation, flags, stream_id);
        head.encode(chunk.len(), dst);
        dst.put_slice(chunk);
    }
}

fn parse_u64(src: &[u8]) -> Option<u64> {
    if src.is_empty() || src.len() > 19 {
        return None;
    }

    let mut value = 0u64;
    for &b in src {
        if b < b'0' || b > b'9' {
            return None;
        }
        value = value * 10 + (b - b'0') as u64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(block: &[u8]) -> Headers {
        let head = Head::new(Kind::Headers, END_STREAM | END_HEADERS, 1.into());
        let (mut headers, frag) = Headers::load(head, Bytes::copy_from_slice(block)).unwrap();
        let mut decoder = hpack::Decoder::new();
        headers.load_hpack(&frag, &mut decoder).unwrap();
        headers
    }

    fn encode_request(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        encoder.encode(pairs.iter().map(|&(ref n, ref v)| (&n[..], &v[..])))
    }

    #[test]
    fn decodes_request_pseudo_headers() {
        let block = encode_request(vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":scheme".to_vec(), b"https".to_vec()),
            (b":authority".to_vec(), b"example.com".to_vec()),
            (b":path".to_vec(), b"/index.html".to_vec()),
            (b"accept".to_vec(), b"*/*".to_vec()),
        ]);

        let headers = decode(&block);
        assert_eq!(headers.pseudo().method, Some(Method::GET));
        assert_eq!(headers.pseudo().path.as_deref(), Some(&b"/index.html"[..]));
        assert_eq!(headers.fields().len(), 1);
        assert!(!headers.is_trailers());
    }

    #[test]
    fn pseudo_after_regular_field_is_malformed() {
        let block = encode_request(vec![
            (b"accept".to_vec(), b"*/*".to_vec()),
            (b":method".to_vec(), b"GET".to_vec()),
        ]);

        let head = Head::new(Kind::Headers, END_HEADERS, 1.into());
        let (mut headers, frag) = Headers::load(head, Bytes::from(block)).unwrap();
        let mut decoder = hpack::Decoder::new();
        assert_eq!(
            headers.load_hpack(&frag, &mut decoder),
            Err(Error::MalformedMessage)
        );
    }

    #[test]
    fn content_length_is_parsed() {
        let block = encode_request(vec![
            (b":method".to_vec(), b"POST".to_vec()),
            (b"content-length".to_vec(), b"42".to_vec()),
        ]);

        let headers = decode(&block);
        assert_eq!(headers.content_length(), Some(42));
    }

    #[test]
    fn invalid_value_byte_flags_but_does_not_fail() {
        let block = encode_request(vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b"x-weird".to_vec(), b"a\x00b".to_vec()),
        ]);

        let headers = decode(&block);
        assert!(headers.has_invalid_header_char());
        assert!(headers.fields().is_empty());
    }

    #[test]
    fn long_response_spills_into_continuation() {
        let mut fields = HeaderMap::new();
        fields.insert(
            "x-filler",
            HeaderValue::from_bytes(&[b'a'; 200][..]).unwrap(),
        );
        let frame = Headers::response(1.into(), StatusCode::OK, fields);

        let mut encoder = hpack::Encoder::new();
        let mut dst = BytesMut::new();
        frame.encode(&mut encoder, &mut dst, 64);

        // First frame must not carry END_HEADERS; a CONTINUATION follows.
        assert_eq!(dst[3], 1);
        assert_eq!(dst[4] & END_HEADERS, 0);
        let first_len = ((dst[0] as usize) << 16) | ((dst[1] as usize) << 8) | dst[2] as usize;
        assert_eq!(first_len, 64);
        assert_eq!(dst[9 + first_len + 3], 9);
    }
}
