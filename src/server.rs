use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::error::Error;
use crate::frame::{Reason, StreamId};
use crate::proto::Connection;

/// The parsed head of a request, as handed to the application.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub scheme: Bytes,
    pub authority: Bytes,
    pub path: Bytes,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

/// What the connection wants from the application.
///
/// Events are pulled with [`Connection::poll_event`]; the application
/// answers through the connection's `send_*` and `proceed_request` methods.
#[derive(Debug)]
pub enum Event {
    /// A request is ready to be processed. For a buffered request `body`
    /// holds the complete entity; with `streaming` set, body chunks follow
    /// as [`Event::RequestBody`].
    Request {
        id: StreamId,
        head: RequestHead,
        body: Bytes,
        streaming: bool,
    },

    /// One chunk of a streamed request body. The engine sends no further
    /// chunk until `proceed_request(id)` acknowledges this one.
    RequestBody {
        id: StreamId,
        data: Bytes,
        is_end: bool,
    },

    /// The stream's queued response data was flushed to the socket; more
    /// can be produced now.
    SendReady { id: StreamId },

    /// The peer reset the stream; processing for it should stop.
    Reset { id: StreamId, reason: Reason },
}

/// Connection configuration; built by [`Builder`].
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub idle_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub write_timeout: Duration,
    pub max_concurrent_requests: u32,
    pub max_concurrent_streaming_requests: u32,
    pub max_streams_for_priority: u32,
    pub active_stream_window_size: u32,
    pub max_request_entity_size: u64,
    pub max_header_list_size: usize,
    pub soft_max_output_size: usize,
    pub push_preload: bool,
    pub origin_frame: Option<Vec<String>>,
    pub request_streaming: fn(&RequestHead) -> bool,
    pub tls: bool,
    pub early_data: bool,
}

/// Builds server connections.
#[derive(Debug, Clone)]
pub struct Builder {
    config: Config,
}

fn never_stream(_: &RequestHead) -> bool {
    false
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            config: Config {
                idle_timeout: Duration::from_secs(10),
                graceful_shutdown_timeout: Duration::from_secs(0),
                write_timeout: Duration::from_secs(30),
                max_concurrent_requests: 100,
                max_concurrent_streaming_requests: 1,
                max_streams_for_priority: 100,
                active_stream_window_size: 16 * 1024 * 1024,
                max_request_entity_size: 1024 * 1024 * 1024,
                max_header_list_size: 16 * 1024,
                soft_max_output_size: 512 * 1024,
                push_preload: false,
                origin_frame: None,
                request_streaming: never_stream,
                tls: true,
                early_data: false,
            },
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Close the connection after this long without activity.
    pub fn idle_timeout(&mut self, dur: Duration) -> &mut Self {
        self.config.idle_timeout = dur;
        self
    }

    /// How long after the final GOAWAY a shutting-down connection may keep
    /// straggling streams alive. Zero disables the forced close.
    pub fn graceful_shutdown_timeout(&mut self, dur: Duration) -> &mut Self {
        self.config.graceful_shutdown_timeout = dur;
        self
    }

    pub fn write_timeout(&mut self, dur: Duration) -> &mut Self {
        self.config.write_timeout = dur;
        self
    }

    /// Requests processed concurrently on one connection.
    pub fn max_concurrent_requests(&mut self, max: u32) -> &mut Self {
        self.config.max_concurrent_requests = max;
        self
    }

    /// Request bodies streamed into the application concurrently (tunnels
    /// are exempt).
    pub fn max_concurrent_streaming_requests(&mut self, max: u32) -> &mut Self {
        self.config.max_concurrent_streaming_requests = max;
        self
    }

    /// Cap on streams existing only as priority placeholders.
    pub fn max_streams_for_priority(&mut self, max: u32) -> &mut Self {
        self.config.max_streams_for_priority = max;
        self
    }

    /// Receive window granted to a stream whose body is actively consumed.
    pub fn active_stream_window_size(&mut self, size: u32) -> &mut Self {
        self.config.active_stream_window_size = size;
        self
    }

    pub fn max_request_entity_size(&mut self, size: u64) -> &mut Self {
        self.config.max_request_entity_size = size;
        self
    }

    pub fn max_header_list_size(&mut self, size: usize) -> &mut Self {
        self.config.max_header_list_size = size;
        self
    }

    /// Stop reading from the socket while at least this much output is
    /// buffered.
    pub fn soft_max_output_size(&mut self, size: usize) -> &mut Self {
        self.config.soft_max_output_size = size;
        self
    }

    /// Allow `Connection::push`.
    pub fn push_preload(&mut self, enabled: bool) -> &mut Self {
        self.config.push_preload = enabled;
        self
    }

    /// Emit an ORIGIN frame listing these origins right after the preface.
    pub fn origin_frame(&mut self, origins: Vec<String>) -> &mut Self {
        self.config.origin_frame = Some(origins);
        self
    }

    /// Predicate electing requests for streamed body delivery.
    pub fn request_streaming(&mut self, predicate: fn(&RequestHead) -> bool) -> &mut Self {
        self.config.request_streaming = predicate;
        self
    }

    /// Whether the transport is TLS; picks the default `:scheme` and is
    /// reported to handlers.
    pub fn tls(&mut self, tls: bool) -> &mut Self {
        self.config.tls = tls;
        self
    }

    /// The connection starts inside TLS early data: requests are parked
    /// until `early_data_complete` and the idle timer always runs.
    pub fn early_data(&mut self, early: bool) -> &mut Self {
        self.config.early_data = early;
        self
    }

    /// Create a connection that expects the client preface next.
    pub fn handshake(&self, now: Instant) -> Connection {
        Connection::new(self.config.clone(), now)
    }

    /// Create a connection from an HTTP/1.1 `Upgrade: h2c` handoff.
    ///
    /// `http2_settings` is the raw value of the request's `HTTP2-Settings`
    /// header (base64url); `head` is the already-parsed HTTP/1.1 request,
    /// which becomes stream 1 and is dispatched immediately. The client
    /// preface is still expected as the first bytes on the upgraded socket.
    pub fn upgrade(
        &self,
        http2_settings: &[u8],
        head: RequestHead,
        now: Instant,
    ) -> Result<Connection, Error> {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(http2_settings)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(http2_settings))
            .map_err(|_| Error::User("malformed HTTP2-Settings header"))?;

        let mut config = self.config.clone();
        config.tls = false;
        Connection::upgrade(config, &decoded, head, now)
    }
}
