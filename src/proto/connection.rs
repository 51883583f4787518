use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};

use crate::codec::{FramedRead, FramedWrite, RecvError};
use crate::error::Error;
use crate::frame::{
    self, Frame, GoAway, Reason, SettingSet, Settings, SettingsError, StreamDependency, StreamId,
    WindowUpdate,
};
use crate::proto::counts::Counts;
use crate::proto::scheduler::Scheduler;
use crate::proto::store::{Key, Queue, Store};
use crate::proto::stream::{EarlyData, Pending, Proceed, ReqBodyState, Stream, StreamState};
use crate::proto::timers::{Timer, Timers};
use crate::proto::window::Window;
use crate::proto::{
    CONNECTION_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, LOCAL_MAX_CONCURRENT_STREAMS, PREFACE,
};
use crate::server::{Config, Event, RequestHead};

/// Connection lifecycle. HALF_CLOSED means a GOAWAY has been sent;
/// IS_CLOSING means no further frames may be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Open,
    HalfClosed,
    IsClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Preface,
    Frames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    NotStarted,
    /// GOAWAY(last=2^31-1) sent; waiting one RTT-ish second.
    AdvisorySent,
    /// Final GOAWAY sent; waiting out the configured straggler timeout.
    FinalSent,
}

/// A server-side HTTP/2 connection engine.
///
/// The engine is a plain state object: the reactor feeds it socket bytes
/// (`recv`), drains gathered writes (`start_write` / `on_write_complete`)
/// and fires deadlines (`handle_timeout`); the application pulls `Event`s
/// and answers through the `send_*` / `proceed_request` methods. All methods
/// must be called from one thread; there is no interior synchronization.
#[derive(Debug)]
pub struct Connection {
    state: State,
    read_state: ReadState,
    closed: bool,

    config: Config,
    peer_settings: SettingSet,
    /// Last stream id from a peer GOAWAY; push streams are not opened past
    /// receiving one.
    peer_goaway_last_id: Option<StreamId>,

    streams: Store,
    scheduler: Scheduler,

    pending_reqs: Queue<Pending>,
    streams_to_proceed: Queue<Proceed>,
    early_data_blocked: Queue<EarlyData>,

    counts: Counts,

    /// Flow control over data received on the whole connection.
    input_window: Window,
    /// Flow control over data sent on the whole connection.
    output_window: Window,

    framed_read: FramedRead,
    framed_write: FramedWrite,

    events: VecDeque<Event>,
    timers: Timers,
    shutdown: Shutdown,

    settings_sent_at: Option<Instant>,
    settings_acked_at: Option<Instant>,
    last_now: Instant,

    early_data: bool,

    /// Assume the client builds a Chromium-style dependency chain until an
    /// observation proves otherwise.
    is_chromium_dependency_tree: bool,

    /// URLs already pushed on this connection.
    push_memo: HashSet<String>,
}

impl Connection {
    pub(crate) fn new(config: Config, now: Instant) -> Connection {
        let mut conn = Connection {
            state: State::Open,
            read_state: ReadState::Preface,
            closed: false,
            framed_read: FramedRead::new(
                frame::DEFAULT_MAX_FRAME_SIZE,
                config.max_header_list_size,
            ),
            framed_write: FramedWrite::new(),
            peer_settings: SettingSet::default(),
            peer_goaway_last_id: None,
            streams: Store::new(),
            scheduler: Scheduler::new(),
            pending_reqs: Queue::new(),
            streams_to_proceed: Queue::new(),
            early_data_blocked: Queue::new(),
            counts: Counts::new(),
            input_window: Window::new(DEFAULT_INITIAL_WINDOW_SIZE),
            output_window: Window::new(DEFAULT_INITIAL_WINDOW_SIZE),
            events: VecDeque::new(),
            timers: Timers::new(),
            shutdown: Shutdown::NotStarted,
            settings_sent_at: None,
            settings_acked_at: None,
            last_now: now,
            early_data: config.early_data,
            is_chromium_dependency_tree: cfg!(feature = "chromium-tree"),
            push_memo: HashSet::new(),
            config,
        };
        conn.update_idle_timeout();
        conn
    }

    /// Entry point for an `Upgrade: h2c` handoff: peer settings come from
    /// the `HTTP2-Settings` header and stream 1 is preloaded with the
    /// already-parsed HTTP/1 request. The client preface is still expected
    /// on the wire before any frame.
    pub(crate) fn upgrade(
        config: Config,
        settings_payload: &[u8],
        head: RequestHead,
        now: Instant,
    ) -> Result<Connection, Error> {
        let mut conn = Connection::new(config, now);

        let settings = Settings::load_payload(settings_payload)
            .map_err(|_| Error::User("malformed HTTP2-Settings header"))?;
        conn.peer_settings
            .apply(&settings)
            .map_err(|_| Error::User("invalid HTTP2-Settings header"))?;
        conn.framed_write
            .set_max_frame_size(conn.peer_settings.max_frame_size as usize);

        conn.queue_server_preface();

        // Open stream 1 as if its HEADERS (with END_STREAM) had arrived.
        let id = StreamId::from(1);
        let key = conn.open_stream(id);
        conn.counts.pull_ids.note_open(id);
        conn.set_priority(key, StreamDependency::default_priority(), false);
        conn.set_stream_state(key, StreamState::RecvHeaders);
        conn.streams[key].head = Some(head);
        conn.execute_or_enqueue_request(key);

        Ok(conn)
    }

    // ===== reactor-facing surface =====

    /// Feed bytes read from the socket.
    pub fn recv(&mut self, src: &[u8], now: Instant) {
        self.last_now = now;

        if self.closed || self.state == State::IsClosing {
            return;
        }

        self.framed_read.extend(src);
        self.parse_input();

        if !self.closed && self.state < State::IsClosing {
            self.update_idle_timeout();
        }
    }

    /// True while the engine is willing to accept more socket bytes; goes
    /// false when the write buffer crosses the soft output limit.
    pub fn wants_read(&self) -> bool {
        !self.closed
            && self.state < State::IsClosing
            && self.framed_write.bytes_in_buf() < self.config.soft_max_output_size
    }

    /// True when `start_write` would hand out bytes.
    pub fn wants_write(&self) -> bool {
        if self.closed || self.framed_write.is_in_flight() {
            return false;
        }
        self.framed_write.has_pending()
            || (self.state < State::IsClosing
                && self.output_window.is_positive()
                && self.scheduler.is_active())
    }

    /// Collect one gathered write. Returns `None` while a write is in
    /// flight or nothing is pending; the reactor must call
    /// `on_write_complete` once the returned bytes hit the socket.
    pub fn start_write(&mut self, now: Instant) -> Option<Bytes> {
        self.last_now = now;

        if self.closed || self.framed_write.is_in_flight() {
            return None;
        }

        self.do_emit_writereq();

        match self.framed_write.start_write() {
            Some(bytes) => {
                self.timers.cancel(Timer::Idle);
                self.timers.set(Timer::Write, now + self.config.write_timeout);
                Some(bytes)
            }
            None => {
                self.maybe_finalize();
                None
            }
        }
    }

    pub fn on_write_complete(&mut self, now: Instant) {
        self.last_now = now;

        if self.closed {
            return;
        }

        self.framed_write.on_write_complete();
        self.timers.cancel(Timer::Write);

        // Run the proceed hooks of the streams that have been flushed.
        if self.state < State::IsClosing {
            while let Some(key) = self.streams_to_proceed.pop(&mut self.streams) {
                let (id, has_work, send_done, headers_queued, recv_in_progress) = {
                    let stream = &self.streams[key];
                    (
                        stream.id,
                        stream.has_send_work(),
                        stream.send_done_flattened,
                        stream.send_headers_queued,
                        stream.req_body_in_progress(),
                    )
                };
                if has_work {
                    // Re-armed with new data since it was queued.
                    continue;
                }
                if send_done {
                    if !recv_in_progress {
                        if self.streams[key].state != StreamState::EndStream {
                            self.set_stream_state(key, StreamState::EndStream);
                        }
                        self.close_stream(key);
                    }
                } else if headers_queued {
                    self.events.push_back(Event::SendReady { id });
                }
            }
        }

        self.update_idle_timeout();
        self.maybe_finalize();
    }

    /// Earliest pending deadline, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.last_now = now;

        while let Some(timer) = self.timers.take_expired(now) {
            if self.closed {
                return;
            }
            match timer {
                Timer::Write => {
                    debug!("write timeout; closing connection");
                    self.close_connection_now();
                }
                Timer::Idle => {
                    if self.framed_write.is_in_flight() {
                        self.close_connection_now();
                    } else {
                        self.enqueue_goaway(Reason::NO_ERROR, "idle timeout");
                        self.close_connection();
                    }
                }
                Timer::Graceful => match self.shutdown {
                    Shutdown::AdvisorySent => {
                        if self.state < State::HalfClosed {
                            self.enqueue_goaway(Reason::NO_ERROR, "");
                        }
                        // After waiting a second there is still an active
                        // connection; give stragglers one more configured
                        // timeout before forcing the close.
                        if !self.config.graceful_shutdown_timeout.is_zero() {
                            self.shutdown = Shutdown::FinalSent;
                            self.timers
                                .set(Timer::Graceful, now + self.config.graceful_shutdown_timeout);
                        }
                    }
                    Shutdown::FinalSent => {
                        self.close_connection();
                    }
                    Shutdown::NotStarted => {}
                },
            }
        }
    }

    /// Begin the staged graceful shutdown: an advisory GOAWAY now, the real
    /// one a second later, and an optional forced close after that.
    pub fn initiate_graceful_shutdown(&mut self, now: Instant) {
        self.last_now = now;

        if self.shutdown != Shutdown::NotStarted {
            return;
        }

        if self.state < State::HalfClosed {
            let frame = GoAway::with_debug_data(
                StreamId::MAX,
                Reason::NO_ERROR,
                Bytes::from_static(b"graceful shutdown"),
            );
            self.framed_write.buffer(frame.into());
        }

        self.shutdown = Shutdown::AdvisorySent;
        self.timers.set(Timer::Graceful, now + Duration::from_secs(1));
    }

    /// The connection is fully torn down; the reactor can drop it.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pull the next application-facing event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Round-trip time measured between our SETTINGS and the peer's ACK.
    pub fn rtt(&self) -> Option<Duration> {
        match (self.settings_sent_at, self.settings_acked_at) {
            (Some(sent), Some(acked)) => Some(acked - sent),
            _ => None,
        }
    }

    /// TLS early data is done; dispatch the requests that were parked on it.
    pub fn early_data_complete(&mut self, now: Instant) {
        self.last_now = now;
        self.early_data = false;

        while let Some(key) = self.early_data_blocked.pop(&mut self.streams) {
            if !self.streams[key].blocked_by_server {
                self.set_blocked_by_server(key, true);
            }
            self.pending_reqs.push(&mut self.streams[key]);
        }
        self.run_pending_requests();
        self.update_idle_timeout();
    }

    // ===== application-facing surface =====

    /// Start the response for a stream. With `end_of_stream` the response
    /// has no body.
    pub fn send_response(
        &mut self,
        id: StreamId,
        status: http::StatusCode,
        headers: http::HeaderMap,
        end_of_stream: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        if self.streams[key].send_headers_queued {
            return Err(Error::User("response headers already sent"));
        }

        let mut frame = frame::Headers::response(id, status, headers);
        if end_of_stream {
            frame.set_end_stream();
        }
        self.framed_write.buffer(frame.into());

        {
            let stream = &mut self.streams[key];
            stream.send_headers_queued = true;
        }
        if self.streams[key].state == StreamState::ReqPending {
            self.set_stream_state(key, StreamState::SendHeaders);
        }

        if end_of_stream {
            self.streams[key].is_final_queued = true;
            self.streams[key].send_done_flattened = true;
            if self.streams[key].state >= StreamState::ReqPending {
                self.set_stream_state(key, StreamState::EndStream);
            }
        }

        self.register_for_send(key);
        Ok(())
    }

    /// Queue response body bytes. The writer drains them into DATA frames
    /// as both flow-control windows allow.
    pub fn send_data(&mut self, id: StreamId, data: Bytes, end_of_stream: bool) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        {
            let stream = &self.streams[key];
            if !stream.send_headers_queued {
                return Err(Error::User("response headers not sent yet"));
            }
            if stream.is_final_queued {
                return Err(Error::User("response already finished"));
            }
        }

        if !data.is_empty() {
            self.streams[key].pending_send.push_back(data);
            if self.streams[key].state == StreamState::SendHeaders {
                self.set_stream_state(key, StreamState::SendBody);
            }
        }
        if end_of_stream {
            self.streams[key].is_final_queued = true;
            let state = self.streams[key].state;
            if state == StreamState::SendHeaders || state == StreamState::SendBody {
                self.set_stream_state(key, StreamState::SendBodyIsFinal);
            }
        }

        self.register_for_send(key);
        Ok(())
    }

    /// Finish the response with a trailing HEADERS frame.
    pub fn send_trailers(&mut self, id: StreamId, trailers: http::HeaderMap) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        {
            let stream = &self.streams[key];
            if !stream.send_headers_queued {
                return Err(Error::User("response headers not sent yet"));
            }
            if stream.is_final_queued {
                return Err(Error::User("response already finished"));
            }
        }

        self.streams[key].trailers = Some(trailers);
        self.streams[key].is_final_queued = true;
        let state = self.streams[key].state;
        if state == StreamState::SendHeaders || state == StreamState::SendBody {
            self.set_stream_state(key, StreamState::SendBodyIsFinal);
        }

        self.register_for_send(key);
        Ok(())
    }

    /// Abort a stream: emit RST_STREAM and drop the local state.
    pub fn send_reset(&mut self, id: StreamId, reason: Reason) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        self.stream_send_error(id, reason);
        self.reset_stream(key);
        Ok(())
    }

    /// Acknowledge the request-body chunk most recently delivered through
    /// `Event::RequestBody`, releasing its flow-control credit and pulling
    /// the next chunk if one is buffered.
    pub fn proceed_request(&mut self, id: StreamId) -> Result<(), Error> {
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        let written = match self.streams[key].chunk_in_flight.take() {
            Some(len) => len,
            None => return Err(Error::User("no request body chunk to proceed")),
        };

        match self.streams[key].req_body_state {
            ReqBodyState::Open => {
                if written > 0 {
                    self.update_stream_input_window(key, written);
                }
                if self.streams[key].blocked_by_server
                    && self.streams[key].input_window.is_positive()
                {
                    self.set_blocked_by_server(key, false);
                    self.update_idle_timeout();
                }
                if !self.streams[key].req_body.is_empty() {
                    self.write_streaming_body(key);
                }
            }
            ReqBodyState::CloseQueued => {
                self.write_streaming_body(key);
            }
            ReqBodyState::CloseDelivered => {
                self.maybe_close_stream(key);
            }
            _ => {}
        }

        Ok(())
    }

    /// Error path of `proceed_request`: the application cannot consume the
    /// request body. The stream is answered with RST_STREAM(STREAM_CLOSED).
    pub fn abort_request(&mut self, id: StreamId) -> Result<(), Error> {
        let key = self.streams.find(id).ok_or(Error::InactiveStream)?;

        self.streams[key].chunk_in_flight = None;
        if self.streams[key].req_body_in_progress() {
            mark_close_delivered(&mut self.counts, &mut self.streams[key]);
        }

        if self.state < State::IsClosing {
            self.stream_send_error(id, Reason::STREAM_CLOSED);
            self.reset_stream(key);
        }
        Ok(())
    }

    /// Open a server-push stream for `path`, returning the promised stream
    /// id, or `None` when any of the admission conditions fails. `critical`
    /// pushes are scheduled ahead of every pull stream.
    pub fn push(&mut self, parent: StreamId, path: &str, critical: bool) -> Option<StreamId> {
        // PUSH_PROMISE frames can only be sent in response to a
        // client-initiated stream.
        if !parent.is_pull() {
            return None;
        }
        let parent_key = self.streams.find(parent)?;

        if !self.config.push_preload || !self.peer_settings.enable_push {
            return None;
        }
        if self.counts.num.push.open >= self.peer_settings.max_concurrent_streams {
            return None;
        }
        if self.state >= State::IsClosing || self.closed {
            return None;
        }
        if self.peer_goaway_last_id.is_some() {
            return None;
        }
        if u32::from(self.counts.push_ids.max_open) >= 0x7fff_fff0 {
            return None;
        }
        // Pushing only makes sense while there is spare request capacity.
        if !self.pending_reqs.is_empty(&self.streams)
            || !self
                .counts
                .can_run_requests(self.config.max_concurrent_requests)
        {
            return None;
        }

        let parent_head = self.streams[parent_key].head.as_ref()?;
        let url = format!(
            "{}://{}{}",
            String::from_utf8_lossy(&parent_head.scheme),
            String::from_utf8_lossy(&parent_head.authority),
            path
        );
        if !self.push_memo.insert(url) {
            return None;
        }

        let head = RequestHead {
            method: http::Method::GET,
            scheme: parent_head.scheme.clone(),
            authority: parent_head.authority.clone(),
            path: Bytes::copy_from_slice(path.as_bytes()),
            headers: copy_push_headers(&parent_head.headers),
            content_length: None,
        };

        let id = match self.counts.push_ids.max_open.next_push() {
            Ok(id) => id,
            Err(_) => return None,
        };

        let key = self.open_stream(id);
        self.counts.push_ids.note_open(id);
        self.streams[key].push_parent = Some(parent);
        self.streams[key].received_priority =
            StreamDependency::new(parent, frame::DEFAULT_WEIGHT, false);
        self.streams[key].head = Some(head);

        let node = if critical {
            self.scheduler.open(self.scheduler.root(), 257, false, id)
        } else {
            let parent_node = self.streams[parent_key]
                .sched
                .expect("open stream without scheduler node");
            self.scheduler.open(parent_node, frame::DEFAULT_WEIGHT, false, id)
        };
        self.streams[key].sched = Some(node);

        self.set_stream_state(key, StreamState::RecvHeaders);
        self.execute_or_enqueue_request(key);

        // Send the promise before the parent stream has any chance to
        // close, even if admission left the pushed request queued.
        if let Some(key) = self.streams.find(id) {
            if !self.streams[key].promise_sent
                && self.streams[key].state != StreamState::EndStream
            {
                self.send_push_promise(key);
            }
        }

        Some(id)
    }

    // ===== diagnostics =====

    pub fn stats(&self) -> Stats {
        Stats {
            pull_open: self.counts.num.pull.open,
            push_open: self.counts.num.push.open,
            priority_open: self.counts.num.priority_open,
            streaming: self.counts.num.req_streaming_in_progress,
            tunnels: self.counts.num.tunnel,
            max_pull_open: self.counts.pull_ids.max_open,
            max_pull_processed: self.counts.pull_ids.max_processed,
            max_push_open: self.counts.push_ids.max_open,
        }
    }

    // ===== inbound frame handling =====

    fn parse_input(&mut self) {
        loop {
            if self.closed || self.state == State::IsClosing {
                return;
            }

            if self.read_state == ReadState::Preface {
                match self.framed_read.read_preface(&PREFACE) {
                    Ok(true) => {
                        self.read_state = ReadState::Frames;
                        // The upgrade entry has already queued the server
                        // preface alongside the 101 response.
                        if self.settings_sent_at.is_none() {
                            self.queue_server_preface();
                        }
                    }
                    Ok(false) => return,
                    Err(()) => {
                        // Not HTTP/2: close without GOAWAY.
                        debug!("bad connection preface");
                        self.close_connection();
                        return;
                    }
                }
            }

            match self.framed_read.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = self.recv_frame(frame) {
                        self.handle_recv_error(err);
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let is_conn = matches!(err, RecvError::Connection { .. });
                    self.handle_recv_error(err);
                    if is_conn {
                        return;
                    }
                }
            }
        }
    }

    fn handle_recv_error(&mut self, err: RecvError) {
        match err {
            RecvError::Connection { reason, desc } => {
                debug!("connection error {:?} -- {}", reason, desc);
                self.enqueue_goaway(reason, desc);
                self.close_connection();
            }
            RecvError::Stream { id, reason } => {
                debug!("stream error {:?}; id={:?}", reason, id);
                self.stream_send_error(id, reason);
                if let Some(key) = self.streams.find(id) {
                    self.reset_stream(key);
                }
            }
        }
    }

    fn recv_frame(&mut self, frame: Frame) -> Result<(), RecvError> {
        trace!("recv frame; frame={:?}", frame);
        match frame {
            Frame::Data(frame) => self.recv_data(frame),
            Frame::Headers(frame) => self.recv_headers(frame),
            Frame::Priority(frame) => self.recv_priority(frame),
            Frame::Reset(frame) => self.recv_reset(frame),
            Frame::Settings(frame) => self.recv_settings(frame),
            Frame::Ping(frame) => self.recv_ping(frame),
            Frame::GoAway(frame) => self.recv_goaway(frame),
            Frame::WindowUpdate(frame) => self.recv_window_update(frame),
            Frame::PushPromise(_) => unreachable!("rejected by the codec"),
        }
    }

    fn recv_data(&mut self, frame: frame::Data) -> Result<(), RecvError> {
        let id = frame.stream_id();
        let len = frame.flow_len();

        // Connection-level accounting happens whether or not the stream is
        // still around.
        self.input_window.consume(len);
        if self.input_window.avail() <= (CONNECTION_WINDOW_SIZE / 2) as i64 {
            let incr = (CONNECTION_WINDOW_SIZE as i64 - self.input_window.avail()) as u32;
            self.framed_write
                .buffer(WindowUpdate::new(StreamId::ZERO, incr).into());
            let _ = self.input_window.update(incr as i64);
        }

        let key = match self.streams.find(id) {
            Some(key) => key,
            None => {
                if id <= self.counts.pull_ids.max_open {
                    self.stream_send_error(id, Reason::STREAM_CLOSED);
                    return Ok(());
                }
                return Err(RecvError::connection(
                    Reason::PROTOCOL_ERROR,
                    "invalid DATA frame",
                ));
            }
        };

        match self.streams[key].req_body_state {
            ReqBodyState::OpenBeforeFirstFrame | ReqBodyState::Open => {}
            _ => {
                self.stream_send_error(id, Reason::STREAM_CLOSED);
                self.reset_stream(key);
                return Ok(());
            }
        }

        self.streams[key].input_window.consume(len);
        let pad = frame.pad_len();
        if pad != 0 {
            // Padding never reaches the application; hand its credit back
            // right away.
            self.update_stream_input_window(key, pad);
        }

        let is_end = frame.is_end_stream();
        let payload = frame.into_payload();
        if !payload.is_empty() || is_end {
            self.handle_request_body_chunk(key, payload, is_end);
        }

        Ok(())
    }

    fn recv_headers(&mut self, frame: frame::Headers) -> Result<(), RecvError> {
        let id = frame.stream_id();

        if !id.is_pull() {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "invalid stream id in HEADERS frame",
            ));
        }

        if id <= self.counts.pull_ids.max_open {
            // Known id: only trailers are acceptable here.
            return self.recv_trailers(frame);
        }

        let (key, was_priority_only) = match self.streams.find(id) {
            Some(key) => {
                // Opened earlier by a PRIORITY frame; the placeholder keeps
                // its scheduler node, rebound if the HEADERS carries a new
                // dependency.
                if self.streams[key].state != StreamState::Idle {
                    return Err(RecvError::connection(
                        Reason::PROTOCOL_ERROR,
                        "invalid stream id in HEADERS frame",
                    ));
                }
                if let Some(dep) = frame.stream_dep() {
                    self.streams[key].received_priority = dep;
                    self.set_priority(key, dep, true);
                }
                (key, true)
            }
            None => {
                let key = self.open_stream(id);
                let dep = frame
                    .stream_dep()
                    .unwrap_or_else(StreamDependency::default_priority);
                self.streams[key].received_priority = dep;
                self.set_priority(key, dep, false);
                (key, false)
            }
        };

        // The stream only counts as opened for request purposes now; the
        // watermark freezes once a GOAWAY has been sent.
        if self.state == State::Open {
            self.counts.pull_ids.note_open(id);
        }
        if was_priority_only {
            self.counts.num.priority_open -= 1;
        }
        self.set_stream_state(key, StreamState::RecvHeaders);

        self.handle_incoming_request(key, frame)
    }

    fn handle_incoming_request(
        &mut self,
        key: Key,
        frame: frame::Headers,
    ) -> Result<(), RecvError> {
        debug_assert_eq!(self.streams[key].state, StreamState::RecvHeaders);

        let id = frame.stream_id();
        let expects_body = !frame.is_end_stream();
        let invalid_char = frame.has_invalid_header_char();
        let content_length = frame.content_length();
        let (pseudo, fields) = frame.into_parts();

        let is_connect = pseudo.method == Some(http::Method::CONNECT);

        // Check existence of the required pseudo headers.
        let pseudo_ok = if is_connect {
            pseudo.method.is_some() && pseudo.authority.is_some()
        } else {
            pseudo.method.is_some() && pseudo.scheme.is_some() && pseudo.path.is_some()
        };
        if !pseudo_ok {
            self.stream_send_error(id, Reason::PROTOCOL_ERROR);
            self.reset_stream(key);
            return Ok(());
        }

        if self.counts.num.pull.open > LOCAL_MAX_CONCURRENT_STREAMS {
            self.stream_send_error(id, Reason::REFUSED_STREAM);
            self.reset_stream(key);
            return Ok(());
        }

        let default_scheme: &'static [u8] = if self.config.tls { b"https" } else { b"http" };
        let head = RequestHead {
            method: pseudo.method.expect("checked above"),
            scheme: pseudo
                .scheme
                .unwrap_or_else(|| Bytes::from_static(default_scheme)),
            authority: pseudo.authority.unwrap_or_else(Bytes::new),
            path: pseudo.path.unwrap_or_else(Bytes::new),
            headers: fields,
            content_length,
        };
        self.streams[key].content_length = content_length;
        self.streams[key].head = Some(head);

        // A request with unrepresentable header characters gets a plain 400
        // response rather than a reset.
        if invalid_char {
            return self.send_invalid_request_error(key, "invalid request header");
        }

        if is_connect {
            // A tunnel must not declare a length, and must leave the stream
            // open in both directions.
            if content_length.is_some() || !expects_body {
                return self.send_invalid_request_error(key, "invalid CONNECT request");
            }
            self.streams[key].is_tunnel = true;
            self.streams[key].streaming_elected = true;
            self.set_stream_state(key, StreamState::RecvBody);
            self.streams[key].set_req_body_state(ReqBodyState::Open);
            self.process_request(key);
            return Ok(());
        }

        if !expects_body {
            self.execute_or_enqueue_request(key);
        } else {
            self.set_stream_state(key, StreamState::RecvBody);
            self.streams[key].set_req_body_state(ReqBodyState::OpenBeforeFirstFrame);
        }
        Ok(())
    }

    fn recv_trailers(&mut self, frame: frame::Headers) -> Result<(), RecvError> {
        let id = frame.stream_id();

        let key = self.streams.find(id).ok_or_else(|| {
            RecvError::connection(Reason::STREAM_CLOSED, "closed stream id in HEADERS frame")
        })?;

        match self.streams[key].req_body_state {
            ReqBodyState::OpenBeforeFirstFrame | ReqBodyState::Open => {}
            _ => {
                return Err(RecvError::connection(
                    Reason::PROTOCOL_ERROR,
                    "invalid stream id in HEADERS frame",
                ));
            }
        }

        if self.streams[key].is_tunnel {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "trailer cannot be used in a CONNECT request",
            ));
        }
        if !frame.is_end_stream() {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "trailing HEADERS frame MUST have END_STREAM flag set",
            ));
        }

        let (_, fields) = frame.into_parts();
        if let Some(head) = self.streams[key].head.as_mut() {
            head.headers.extend(fields);
        }

        self.handle_request_body_chunk(key, Bytes::new(), true);
        Ok(())
    }

    fn recv_priority(&mut self, frame: frame::Priority) -> Result<(), RecvError> {
        let id = frame.stream_id();
        let dep = frame.dependency();

        if dep.dependency == id {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "stream cannot depend on itself",
            ));
        }

        if let Some(key) = self.streams.find(id) {
            self.streams[key].received_priority = dep;
            // Skip reprioritization of critical pushes (weight 257); that is
            // where we are trying to be smarter than the browser.
            let node = self.streams[key].sched;
            if let Some(node) = node {
                if self.scheduler.weight(node) != 257 {
                    self.set_priority(key, dep, true);
                }
            }
            return Ok(());
        }

        if id.is_push() {
            // Ignore PRIORITY frames for closed or idle pushed streams.
            return Ok(());
        }
        if id <= self.counts.pull_ids.max_open {
            // Ignore PRIORITY frames for closed pull streams.
            return Ok(());
        }

        if self.counts.num.priority_open >= self.config.max_streams_for_priority {
            return Err(RecvError::connection(
                Reason::ENHANCE_YOUR_CALM,
                "too many streams in idle/closed state",
            ));
        }

        let key = self.open_stream(id);
        self.streams[key].received_priority = dep;
        self.counts.num.priority_open += 1;
        self.set_priority(key, dep, false);

        Ok(())
    }

    fn recv_reset(&mut self, frame: frame::Reset) -> Result<(), RecvError> {
        let id = frame.stream_id();

        if self.is_idle_stream_id(id) {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "unexpected stream id in RST_STREAM frame",
            ));
        }

        if let Some(key) = self.streams.find(id) {
            if self.streams[key].process_dispatched {
                self.events.push_back(Event::Reset {
                    id,
                    reason: frame.reason(),
                });
            }
            self.reset_stream(key);
        }
        Ok(())
    }

    fn recv_settings(&mut self, frame: Settings) -> Result<(), RecvError> {
        if frame.is_ack() {
            if self.settings_acked_at.is_none() && self.settings_sent_at.is_some() {
                self.settings_acked_at = Some(self.last_now);
            }
            return Ok(());
        }

        let prev_initial_window_size = self.peer_settings.initial_window_size;

        self.peer_settings.apply(&frame).map_err(|err| match err {
            SettingsError::WindowSizeOverflow => RecvError::connection(
                Reason::FLOW_CONTROL_ERROR,
                "invalid SETTINGS_INITIAL_WINDOW_SIZE",
            ),
            _ => RecvError::connection(Reason::PROTOCOL_ERROR, "invalid SETTINGS frame"),
        })?;

        self.framed_write.buffer(Settings::ack().into());
        self.framed_write
            .set_max_frame_size(self.peer_settings.max_frame_size as usize);

        // Apply the change to the window size of all the streams (but not
        // the connection, see RFC 7540 section 6.9.2).
        if prev_initial_window_size != self.peer_settings.initial_window_size {
            let delta =
                self.peer_settings.initial_window_size as i64 - prev_initial_window_size as i64;
            for key in self.streams.keys() {
                if self.update_stream_output_window(key, delta).is_err() {
                    return Err(RecvError::connection(
                        Reason::FLOW_CONTROL_ERROR,
                        "flow control window overflow",
                    ));
                }
            }
        }

        self.run_pending_requests();
        Ok(())
    }

    fn recv_ping(&mut self, frame: frame::Ping) -> Result<(), RecvError> {
        if !frame.is_ack() {
            self.framed_write
                .buffer(frame::Ping::pong(frame.into_payload()).into());
        }
        Ok(())
    }

    fn recv_goaway(&mut self, frame: GoAway) -> Result<(), RecvError> {
        debug!(
            "recv GOAWAY; last={:?} code={:?}",
            frame.last_stream_id(),
            frame.reason()
        );
        // Remember the peer's watermark and stop opening push streams; the
        // peer has promised not to process anything beyond it.
        self.peer_goaway_last_id = Some(frame.last_stream_id());
        Ok(())
    }

    fn recv_window_update(&mut self, frame: WindowUpdate) -> Result<(), RecvError> {
        let id = frame.stream_id();
        let incr = frame.size_increment();

        if id.is_zero() {
            if incr == 0 {
                return Err(RecvError::connection(
                    Reason::PROTOCOL_ERROR,
                    "zero increment in WINDOW_UPDATE frame",
                ));
            }
            self.output_window.update(incr as i64).map_err(|_| {
                RecvError::connection(Reason::FLOW_CONTROL_ERROR, "flow control window overflow")
            })?;
        } else if !self.is_idle_stream_id(id) {
            if incr == 0 {
                self.stream_send_error(id, Reason::PROTOCOL_ERROR);
                if let Some(key) = self.streams.find(id) {
                    self.reset_stream(key);
                }
                return Ok(());
            }
            // The update may name a stream that is already gone; that is
            // fine.
            if let Some(key) = self.streams.find(id) {
                if self.update_stream_output_window(key, incr as i64).is_err() {
                    self.stream_send_error(id, Reason::FLOW_CONTROL_ERROR);
                    self.reset_stream(key);
                }
            }
        } else {
            return Err(RecvError::connection(
                Reason::PROTOCOL_ERROR,
                "invalid stream id in WINDOW_UPDATE frame",
            ));
        }

        Ok(())
    }

    // ===== request admission =====

    fn execute_or_enqueue_request(&mut self, key: Key) {
        debug_assert!(matches!(
            self.streams[key].state,
            StreamState::RecvHeaders | StreamState::ReqPending
        ));

        if self.reset_stream_if_disregarded(key) {
            return;
        }

        if self.streams[key].state < StreamState::ReqPending {
            self.set_stream_state(key, StreamState::ReqPending);
        }
        if !self.streams[key].blocked_by_server {
            self.set_blocked_by_server(key, true);
        }
        self.execute_or_enqueue_request_core(key);
    }

    fn execute_or_enqueue_request_core(&mut self, key: Key) {
        if self.early_data {
            self.early_data_blocked.push(&mut self.streams[key]);
        } else {
            self.pending_reqs.push(&mut self.streams[key]);
            self.run_pending_requests();
        }
        self.update_idle_timeout();
    }

    fn run_pending_requests(&mut self) {
        let mut skipped: Vec<StreamId> = Vec::new();

        loop {
            if !self
                .counts
                .can_run_requests(self.config.max_concurrent_requests)
            {
                break;
            }
            let key = match self.pending_reqs.pop(&mut self.streams) {
                Some(key) => key,
                None => break,
            };

            // Handle no more than the configured number of streaming
            // requests at a time; skipped streams keep their place in line.
            if self.streams[key].streaming_elected
                && self.counts.num.req_streaming_in_progress - self.counts.num.tunnel
                    >= self.config.max_concurrent_streaming_requests
            {
                skipped.push(self.streams[key].id);
                continue;
            }

            self.process_request(key);
        }

        self.pending_reqs.requeue_front(skipped, &mut self.streams);
    }

    fn process_request(&mut self, key: Key) {
        let id = self.streams[key].id;

        self.streams[key].process_dispatched = true;
        if self.streams[key].blocked_by_server {
            self.set_blocked_by_server(key, false);
        }

        if self.streams[key].streaming_elected {
            debug_assert!(self.streams[key].req_body_in_progress());
            self.counts.num.req_streaming_in_progress += 1;
            self.streams[key].streamed = true;
            if self.streams[key].is_tunnel {
                self.counts.num.tunnel += 1;
            } else {
                // Give the peer runway beyond the default window while the
                // body is being streamed into the application.
                let delta = self
                    .config
                    .active_stream_window_size
                    .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
                if delta > 0 {
                    self.update_stream_input_window(key, delta as usize);
                }
            }
        } else if self.streams[key].state < StreamState::SendHeaders {
            self.set_stream_state(key, StreamState::SendHeaders);
        }

        if id.is_pull() && self.counts.pull_ids.max_processed < id {
            self.counts.pull_ids.max_processed = id;
        }

        let head = self.streams[key]
            .head
            .clone()
            .expect("request head missing at dispatch");
        let streaming = self.streams[key].streamed;
        let body = if streaming {
            Bytes::new()
        } else {
            self.streams[key].req_body.split().freeze()
        };
        self.events.push_back(Event::Request {
            id,
            head,
            body,
            streaming,
        });

        if streaming
            && self.streams[key].chunk_in_flight.is_none()
            && (!self.streams[key].req_body.is_empty()
                || self.streams[key].req_body_state == ReqBodyState::CloseQueued)
        {
            self.write_streaming_body(key);
        }
    }

    /// Streams opened after the GOAWAY watermark are refused outright.
    fn reset_stream_if_disregarded(&mut self, key: Key) -> bool {
        let id = self.streams[key].id;
        if id.is_pull() && id > self.counts.pull_ids.max_open {
            self.stream_send_error(id, Reason::REFUSED_STREAM);
            self.reset_stream(key);
            return true;
        }
        false
    }

    fn send_invalid_request_error(&mut self, key: Key, desc: &'static str) -> Result<(), RecvError> {
        // Fast forward the stream's state so that the response can be sent.
        if self.streams[key].state < StreamState::ReqPending {
            self.set_stream_state(key, StreamState::ReqPending);
        }
        self.set_stream_state(key, StreamState::SendHeaders);

        let id = self.streams[key].id;
        let body = Bytes::from_static(desc.as_bytes());

        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        let body_is_empty = body.is_empty();
        let mut frame =
            frame::Headers::response(id, http::StatusCode::BAD_REQUEST, headers);
        if body_is_empty {
            frame.set_end_stream();
        }
        self.framed_write.buffer(frame.into());
        self.streams[key].send_headers_queued = true;

        if !body_is_empty {
            self.streams[key].pending_send.push_back(body);
            self.set_stream_state(key, StreamState::SendBody);
        }
        self.streams[key].is_final_queued = true;
        if body_is_empty {
            self.streams[key].send_done_flattened = true;
            self.set_stream_state(key, StreamState::EndStream);
        } else {
            self.set_stream_state(key, StreamState::SendBodyIsFinal);
        }

        self.register_for_send(key);
        Ok(())
    }

    // ===== request body plumbing =====

    fn handle_request_body_chunk(&mut self, key: Key, payload: Bytes, is_end: bool) {
        let id = self.streams[key].id;

        let is_first = self.streams[key].req_body_state == ReqBodyState::OpenBeforeFirstFrame;
        if is_first {
            self.streams[key].set_req_body_state(ReqBodyState::Open);
        }

        self.streams[key].body_bytes_received += payload.len() as u64;

        // Size guards.
        if self.streams[key].body_bytes_received > self.config.max_request_entity_size {
            self.stream_send_error(id, Reason::REFUSED_STREAM);
            self.reset_stream(key);
            return;
        }
        if let Some(cl) = self.streams[key].content_length {
            let received = self.streams[key].body_bytes_received;
            if if is_end { received != cl } else { received > cl } {
                self.stream_send_error(id, Reason::PROTOCOL_ERROR);
                self.reset_stream(key);
                return;
            }
        }

        if !self.streams[key].blocked_by_server {
            self.set_blocked_by_server(key, true);
        }

        if self.reset_stream_if_disregarded(key) {
            return;
        }

        let was_elected = self.streams[key].streaming_elected;

        if is_end {
            if self.streams[key].state < StreamState::ReqPending {
                self.set_stream_state(key, StreamState::ReqPending);
                if self.streams[key].process_dispatched {
                    self.set_stream_state(key, StreamState::SendHeaders);
                }
            }
            if self.streams[key].streamed {
                self.streams[key].set_req_body_state(ReqBodyState::CloseQueued);
            } else {
                // Body completed before streaming dispatch; fall back to the
                // buffered path.
                self.streams[key].streaming_elected = false;
                mark_close_delivered(&mut self.counts, &mut self.streams[key]);
            }
        }

        self.streams[key].req_body.extend_from_slice(&payload);

        // In streaming mode: hand over the chunk unless one is already in
        // flight, and we are done here.
        if self.streams[key].streamed {
            if self.streams[key].chunk_in_flight.is_none() {
                self.write_streaming_body(key);
            }
            return;
        }

        // When receiving the first DATA frame...
        if is_first && !is_end && !was_elected {
            // ...trigger request streaming mode if the application wants it...
            if (self.config.request_streaming)(self.streams[key].head.as_ref().expect("head")) {
                self.streams[key].streaming_elected = true;
                self.execute_or_enqueue_request_core(key);
                return;
            }
            // ...or grow the window for the buffered read.
            let delta = self
                .config
                .active_stream_window_size
                .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
            if delta > 0 {
                self.update_stream_input_window(key, delta as usize);
            }
        }

        // Run or queue the request now that all input is here. A stream
        // whose election lapsed above re-enters admission as a plain
        // buffered request.
        if is_end && !self.streams[key].streamed {
            self.execute_or_enqueue_request(key);
        }
    }

    fn write_streaming_body(&mut self, key: Key) {
        debug_assert!(self.streams[key].streamed);
        debug_assert!(self.streams[key].chunk_in_flight.is_none());

        let is_end = match self.streams[key].req_body_state {
            ReqBodyState::Open => {
                debug_assert!(!self.streams[key].req_body.is_empty());
                false
            }
            ReqBodyState::CloseQueued => true,
            state => {
                debug_assert!(false, "unexpected req body state {:?}", state);
                return;
            }
        };

        let id = self.streams[key].id;
        let chunk = self.streams[key].req_body.split().freeze();
        self.streams[key].chunk_in_flight = Some(chunk.len());

        if is_end {
            mark_close_delivered(&mut self.counts, &mut self.streams[key]);
        }

        self.events.push_back(Event::RequestBody {
            id,
            data: chunk,
            is_end,
        });

        if is_end {
            self.maybe_close_stream(key);
        }
    }

    // ===== flow control =====

    fn update_stream_input_window(&mut self, key: Key, delta: usize) {
        let (id, incr) = {
            let stream = &mut self.streams[key];
            stream.bytes_unnotified += delta as u32;

            if (stream.bytes_unnotified as i64) < stream.input_window.avail() {
                return;
            }
            let incr = stream.bytes_unnotified;
            stream.bytes_unnotified = 0;
            let _ = stream.input_window.update(incr as i64);
            (stream.id, incr)
        };
        self.framed_write.buffer(WindowUpdate::new(id, incr).into());
    }

    fn update_stream_output_window(&mut self, key: Key, delta: i64) -> Result<(), ()> {
        let cur = self.streams[key].output_window.avail();
        self.streams[key].output_window.update(delta).map_err(|_| ())?;

        if cur <= 0
            && self.streams[key].output_window.is_positive()
            && self.streams[key].has_send_work()
        {
            if let Some(node) = self.streams[key].sched {
                self.scheduler.activate(node);
            }
        }
        Ok(())
    }

    // ===== prioritization =====

    fn set_priority(&mut self, key: Key, priority: StreamDependency, scheduler_is_open: bool) {
        let mut priority = priority;
        let mut parent_sched = self.scheduler.root();

        if !priority.dependency.is_zero() {
            if let Some(ring_node) = self.scheduler.ring_find(priority.dependency) {
                // The parent closed recently (or had its node preserved);
                // its spot in the tree is still meaningful.
                parent_sched = ring_node;

                if cfg!(feature = "chromium-tree") && self.is_chromium_dependency_tree {
                    let orig_weight = self.scheduler.weight(ring_node);
                    if orig_weight < priority.weight || !priority.exclusive {
                        // The client's dependency tree does not look like
                        // Chromium's after all.
                        self.is_chromium_dependency_tree = false;
                    } else if let Some(cur_key) = self.streams.find(priority.dependency) {
                        if let Some(cur_node) = self.streams[cur_key].sched {
                            if orig_weight > self.scheduler.weight(cur_node) && priority.exclusive
                            {
                                // The named parent was demoted since the
                                // client last saw it; re-seat the new stream
                                // by weight from the root instead.
                                let mut found =
                                    self.scheduler.find_parent_by_weight(priority.weight);
                                if Some(found) == self.streams[key].sched {
                                    found = cur_node;
                                }
                                parent_sched = found;
                            }
                        }
                    }
                }
            } else if let Some(parent_key) = self.streams.find(priority.dependency) {
                parent_sched = self.streams[parent_key]
                    .sched
                    .expect("open stream without scheduler node");
            } else {
                // A dependency on a stream that is not in the tree is given
                // the default priority (RFC 7540 sections 5.3.1, 5.3.4).
                parent_sched = self.scheduler.root();
                priority = StreamDependency::default_priority();
            }
        }

        if cfg!(feature = "chromium-tree") {
            if priority.exclusive && self.is_chromium_dependency_tree {
                let parent_weight = if self.scheduler.is_root(parent_sched) {
                    256
                } else {
                    self.scheduler.weight(parent_sched)
                };
                if parent_weight < priority.weight {
                    // A child heavier than its parent is not Chromium.
                    self.is_chromium_dependency_tree = false;
                }
            } else if !priority.exclusive {
                self.is_chromium_dependency_tree = false;
            }
        }

        let id = self.streams[key].id;
        if !scheduler_is_open {
            let node = self
                .scheduler
                .open(parent_sched, priority.weight, priority.exclusive, id);
            self.streams[key].sched = Some(node);
        } else {
            let node = self.streams[key]
                .sched
                .expect("rebinding a stream without scheduler node");
            self.scheduler
                .rebind(node, parent_sched, priority.weight, priority.exclusive);
        }
    }

    // ===== the writer =====

    fn do_emit_writereq(&mut self) {
        debug_assert!(!self.framed_write.is_in_flight());

        if self.state < State::IsClosing && self.output_window.is_positive() {
            let Connection {
                ref mut scheduler,
                ref mut streams,
                ref mut framed_write,
                ref mut output_window,
                ref mut counts,
                ref mut streams_to_proceed,
                ref config,
                ..
            } = *self;

            scheduler.run(|id| {
                let key = match streams.find(id) {
                    Some(key) => key,
                    None => return (false, true),
                };

                let still_active =
                    emit_stream_data(&mut streams[key], framed_write, output_window, counts);

                if !streams[key].has_send_work() {
                    streams_to_proceed.push(&mut streams[key]);
                }

                let keep_going = output_window.is_positive()
                    && framed_write.bytes_in_buf() < config.soft_max_output_size;
                (still_active, keep_going)
            });
        }

        self.maybe_finalize();
    }

    fn register_for_send(&mut self, key: Key) {
        if self.streams[key].has_send_work() {
            if self.streams[key].output_window.is_positive() {
                if let Some(node) = self.streams[key].sched {
                    self.scheduler.activate(node);
                }
            }
        } else {
            self.streams_to_proceed.push(&mut self.streams[key]);
        }
    }

    fn send_push_promise(&mut self, key: Key) {
        let promise = {
            let stream = &mut self.streams[key];
            debug_assert!(!stream.promise_sent);
            stream.promise_sent = true;

            let parent = stream.push_parent.expect("push stream without parent");
            let head = stream.head.as_ref().expect("push stream without request");

            let pseudo = frame::Pseudo::request(
                head.method.clone(),
                head.scheme.clone(),
                head.authority.clone(),
                head.path.clone(),
            );
            frame::PushPromise::new(parent, stream.id, pseudo, head.headers.clone())
        };
        self.framed_write.buffer(promise.into());
    }

    // ===== teardown =====

    fn enqueue_goaway(&mut self, reason: Reason, desc: &'static str) {
        if self.state < State::IsClosing {
            // The spec allows sending GOAWAY more than once (e.g. for errors
            // arising after the graceful-shutdown one).
            let frame = GoAway::with_debug_data(
                self.counts.pull_ids.max_open,
                reason,
                Bytes::from_static(desc.as_bytes()),
            );
            self.framed_write.buffer(frame.into());
            self.state = State::HalfClosed;
        }
    }

    fn close_connection(&mut self) {
        self.state = State::IsClosing;
        if self.framed_write.is_in_flight() || self.framed_write.has_pending() {
            // There is a pending write; teardown happens once it drains.
        } else {
            self.close_connection_now();
        }
    }

    fn close_connection_now(&mut self) {
        self.state = State::IsClosing;

        for key in self.streams.keys() {
            self.close_stream(key);
        }

        debug_assert_eq!(self.counts.num.pull.open, 0);
        debug_assert_eq!(self.counts.num.push.open, 0);
        debug_assert_eq!(self.counts.num.priority_open, 0);
        debug_assert_eq!(self.counts.num.blocked_by_server, 0);
        debug_assert_eq!(self.counts.num.req_streaming_in_progress, 0);
        debug_assert_eq!(self.counts.num.tunnel, 0);

        self.timers = Timers::new();
        self.closed = true;
    }

    fn maybe_finalize(&mut self) {
        if self.closed {
            return;
        }
        if self.state == State::HalfClosed && self.counts.open_streams() == 0 {
            self.state = State::IsClosing;
        }
        if self.state == State::IsClosing
            && !self.framed_write.is_in_flight()
            && !self.framed_write.has_pending()
        {
            self.close_connection_now();
        }
    }

    fn stream_send_error(&mut self, id: StreamId, reason: Reason) {
        debug_assert!(!id.is_zero());
        if self.state < State::IsClosing {
            self.framed_write.buffer(frame::Reset::new(id, reason).into());
        }
    }

    /// Tear down one stream locally: cancel its send side and destroy it.
    fn reset_stream(&mut self, key: Key) {
        {
            let stream = &mut self.streams[key];
            stream.pending_send.clear();
            stream.trailers = None;
            stream.chunk_in_flight = None;
        }
        if let Some(node) = self.streams[key].sched {
            self.scheduler.deactivate(node);
        }
        self.close_stream(key);
    }

    fn close_stream(&mut self, key: Key) {
        let mut stream = self.streams.remove(key);

        if let Some(node) = stream.sched.take() {
            self.scheduler.retire(node, stream.id);
        }

        if stream.req_body_in_progress() {
            mark_close_delivered(&mut self.counts, &mut stream);
        }

        if stream.blocked_by_server {
            stream.blocked_by_server = false;
            self.counts.num.blocked_by_server -= 1;
        }

        if stream.state == StreamState::Idle {
            self.counts.num.priority_open -= 1;
        } else if stream.state != StreamState::EndStream {
            self.counts
                .transition(stream.id, stream.state, StreamState::EndStream);
        }

        if !self.closed && self.state < State::IsClosing {
            self.run_pending_requests();
            self.update_idle_timeout();
        }
    }

    fn maybe_close_stream(&mut self, key: Key) {
        let stream = &self.streams[key];
        let recv_done = !stream.req_body_in_progress();
        let send_done = stream.send_done_flattened && !stream.has_send_work();

        if recv_done && send_done {
            if self.streams[key].state != StreamState::EndStream {
                self.set_stream_state(key, StreamState::EndStream);
            }
            self.close_stream(key);
        }
    }

    // ===== small helpers =====

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed || self.state == State::IsClosing {
            return Err(Error::Closing);
        }
        Ok(())
    }

    fn is_idle_stream_id(&self, id: StreamId) -> bool {
        let max_open = if id.is_push() {
            self.counts.push_ids.max_open
        } else {
            self.counts.pull_ids.max_open
        };
        max_open < id
    }

    fn open_stream(&mut self, id: StreamId) -> Key {
        let stream = Stream::new(id, self.peer_settings.initial_window_size);
        self.streams.insert(id, stream)
    }

    fn set_stream_state(&mut self, key: Key, new: StreamState) {
        let stream = &mut self.streams[key];
        let old = stream.state;
        if old == new {
            return;
        }
        trace!("stream {:?}; state {:?} -> {:?}", stream.id, old, new);
        stream.state = new;
        self.counts.transition(stream.id, old, new);
    }

    fn set_blocked_by_server(&mut self, key: Key, value: bool) {
        let stream = &mut self.streams[key];
        debug_assert_ne!(stream.blocked_by_server, value);
        stream.blocked_by_server = value;
        if value {
            self.counts.num.blocked_by_server += 1;
        } else {
            self.counts.num.blocked_by_server -= 1;
        }
    }

    fn update_idle_timeout(&mut self) {
        // Leave everything alone while a write is in progress; the write
        // timeout covers that span.
        if self.framed_write.is_in_flight() {
            return;
        }

        self.timers.cancel(Timer::Idle);

        if self.closed {
            return;
        }
        // No timeout while the application is holding requests, except
        // during TLS early data.
        if !self.early_data && self.counts.num.blocked_by_server > 0 {
            return;
        }

        self.timers
            .set(Timer::Idle, self.last_now + self.config.idle_timeout);
    }

    fn queue_server_preface(&mut self) {
        let mut settings = Settings::default();
        settings.set_max_concurrent_streams(Some(LOCAL_MAX_CONCURRENT_STREAMS));
        self.framed_write.buffer(settings.into());

        let incr = CONNECTION_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE;
        self.framed_write
            .buffer(WindowUpdate::new(StreamId::ZERO, incr).into());
        let _ = self.input_window.update(incr as i64);

        if let Some(ref origins) = self.config.origin_frame {
            let origin = frame::Origin::new(origins.clone());
            self.framed_write.buffer_origin(&origin);
        }

        if self.settings_sent_at.is_none() {
            self.settings_sent_at = Some(self.last_now);
        }
    }
}

/// Connection-level counters exposed for observability.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub pull_open: u32,
    pub push_open: u32,
    pub priority_open: u32,
    pub streaming: u32,
    pub tunnels: u32,
    pub max_pull_open: StreamId,
    pub max_pull_processed: StreamId,
    pub max_push_open: StreamId,
}

fn mark_close_delivered(counts: &mut Counts, stream: &mut Stream) {
    stream.set_req_body_state(ReqBodyState::CloseDelivered);
    if stream.streamed {
        counts.num.req_streaming_in_progress -= 1;
        if stream.is_tunnel {
            counts.num.tunnel -= 1;
        }
    }
}

/// Flatten as much of the stream's queued response as both windows permit.
/// Returns whether the stream stays in the scheduler rotation.
fn emit_stream_data(
    stream: &mut Stream,
    framed_write: &mut FramedWrite,
    conn_window: &mut Window,
    counts: &mut Counts,
) -> bool {
    let max_frame = framed_write.max_frame_size();

    loop {
        if !stream.has_send_work() {
            break;
        }

        if stream.pending_send.is_empty() {
            // Only the end-of-stream marker remains; it costs no window.
            if let Some(trailers) = stream.trailers.take() {
                framed_write.buffer(frame::Headers::trailers(stream.id, trailers).into());
            } else {
                let mut data = frame::Data::new(stream.id, Bytes::new());
                data.set_end_stream();
                framed_write.buffer(data.into());
            }
            stream.send_done_flattened = true;
            break;
        }

        if !conn_window.is_positive() || !stream.output_window.is_positive() {
            break;
        }

        let budget = conn_window
            .avail()
            .min(stream.output_window.avail())
            .min(max_frame as i64) as usize;

        let front = stream.pending_send.front_mut().expect("checked non-empty");
        let take = budget.min(front.len());
        let chunk = front.split_to(take);
        if front.is_empty() {
            stream.pending_send.pop_front();
        }

        let is_last =
            stream.pending_send.is_empty() && stream.is_final_queued && stream.trailers.is_none();

        let mut data = frame::Data::new(stream.id, chunk);
        if is_last {
            data.set_end_stream();
            stream.send_done_flattened = true;
        }
        framed_write.buffer(data.into());

        conn_window.consume(take);
        stream.output_window.consume(take);

        if is_last {
            break;
        }
    }

    if stream.send_done_flattened && stream.state == StreamState::SendBodyIsFinal {
        counts.transition(stream.id, StreamState::SendBodyIsFinal, StreamState::EndStream);
        stream.state = StreamState::EndStream;
    }

    stream.has_send_work() && stream.output_window.is_positive()
}

/// Headers from the parent request that may affect a pushed response.
fn copy_push_headers(src: &http::HeaderMap) -> http::HeaderMap {
    let mut dst = http::HeaderMap::new();
    for name in &[
        http::header::ACCEPT_ENCODING,
        http::header::ACCEPT_LANGUAGE,
        http::header::USER_AGENT,
    ] {
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
    dst
}
