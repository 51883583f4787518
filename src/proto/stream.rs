use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;

use crate::frame::{StreamDependency, StreamId};
use crate::proto::scheduler::NodeKey;
use crate::proto::store::QueueKind;
use crate::proto::window::Window;
use crate::proto::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::server::RequestHead;

/// Stream lifecycle. Ordering is meaningful: states only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Idle,
    RecvHeaders,
    RecvBody,
    ReqPending,
    SendHeaders,
    SendBody,
    SendBodyIsFinal,
    EndStream,
}

/// Request-body sub-state; strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReqBodyState {
    None,
    OpenBeforeFirstFrame,
    Open,
    CloseQueued,
    CloseDelivered,
}

#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,

    /// Window limiting what the peer may send us on this stream, plus the
    /// replenishment accumulator: updates are batched until they reach the
    /// remaining window, then flushed as a single WINDOW_UPDATE.
    pub input_window: Window,
    pub bytes_unnotified: u32,

    /// Window limiting what we may send the peer on this stream.
    pub output_window: Window,

    // ===== request (recv) side =====
    pub req_body: BytesMut,
    pub req_body_state: ReqBodyState,

    /// Streaming was elected for this request (chunks are handed to the
    /// application before the body completes).
    pub streaming_elected: bool,

    /// Streaming bookkeeping has been performed at dispatch.
    pub streamed: bool,

    /// Size of the body chunk handed to the application and not yet
    /// acknowledged through `proceed_request`.
    pub chunk_in_flight: Option<usize>,

    pub is_tunnel: bool,
    pub blocked_by_server: bool,

    pub head: Option<RequestHead>,
    pub content_length: Option<u64>,
    pub body_bytes_received: u64,

    /// The request has been dispatched to the application.
    pub process_dispatched: bool,

    // ===== response (send) side =====
    pub pending_send: VecDeque<Bytes>,
    pub send_headers_queued: bool,
    pub is_final_queued: bool,
    pub send_done_flattened: bool,
    pub trailers: Option<HeaderMap>,

    // ===== scheduler =====
    pub sched: Option<NodeKey>,
    pub received_priority: StreamDependency,

    // ===== push =====
    pub push_parent: Option<StreamId>,
    pub promise_sent: bool,

    // ===== queue membership flags =====
    pub q_pending: bool,
    pub q_proceed: bool,
    pub q_early: bool,
}

impl Stream {
    pub fn new(id: StreamId, send_window: u32) -> Stream {
        Stream {
            id,
            state: StreamState::Idle,
            input_window: Window::new(DEFAULT_INITIAL_WINDOW_SIZE),
            bytes_unnotified: 0,
            output_window: Window::new(send_window),
            req_body: BytesMut::new(),
            req_body_state: ReqBodyState::None,
            streaming_elected: false,
            streamed: false,
            chunk_in_flight: None,
            is_tunnel: false,
            blocked_by_server: false,
            head: None,
            content_length: None,
            body_bytes_received: 0,
            process_dispatched: false,
            pending_send: VecDeque::new(),
            send_headers_queued: false,
            is_final_queued: false,
            send_done_flattened: false,
            trailers: None,
            sched: None,
            received_priority: StreamDependency::default_priority(),
            push_parent: None,
            promise_sent: false,
            q_pending: false,
            q_proceed: false,
            q_early: false,
        }
    }

    /// Advance the body sub-state. The machine only moves forward; moving
    /// backwards or standing still is a logic error.
    pub fn set_req_body_state(&mut self, new: ReqBodyState) {
        debug_assert!(
            self.req_body_state < new,
            "req body state must advance: {:?} -> {:?}",
            self.req_body_state,
            new
        );
        self.req_body_state = new;
    }

    /// True while the request side still owes the application something.
    pub fn req_body_in_progress(&self) -> bool {
        self.req_body_state != ReqBodyState::None
            && self.req_body_state < ReqBodyState::CloseDelivered
    }

    /// The stream has something left for the writer: body bytes, or an
    /// unflushed end-of-stream marker (possibly trailers).
    pub fn has_send_work(&self) -> bool {
        if !self.pending_send.is_empty() {
            return true;
        }
        self.is_final_queued && !self.send_done_flattened
    }
}

// Queue kinds: pending requests, post-write proceed hooks, early-data parking.

#[derive(Debug)]
pub enum Pending {}

#[derive(Debug)]
pub enum Proceed {}

#[derive(Debug)]
pub enum EarlyData {}

impl QueueKind for Pending {
    fn is_queued(stream: &Stream) -> bool {
        stream.q_pending
    }
    fn set_queued(stream: &mut Stream, val: bool) {
        stream.q_pending = val;
    }
}

impl QueueKind for Proceed {
    fn is_queued(stream: &Stream) -> bool {
        stream.q_proceed
    }
    fn set_queued(stream: &mut Stream, val: bool) {
        stream.q_proceed = val;
    }
}

impl QueueKind for EarlyData {
    fn is_queued(stream: &Stream) -> bool {
        stream.q_early
    }
    fn set_queued(stream: &mut Stream, val: bool) {
        stream.q_early = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn req_body_state_cannot_move_backwards() {
        let mut stream = Stream::new(StreamId::from(1), 65_535);
        stream.set_req_body_state(ReqBodyState::Open);
        stream.set_req_body_state(ReqBodyState::OpenBeforeFirstFrame);
    }

    #[test]
    fn send_work_tracks_unflushed_final() {
        let mut stream = Stream::new(StreamId::from(1), 65_535);
        assert!(!stream.has_send_work());

        stream.is_final_queued = true;
        assert!(stream.has_send_work());

        stream.send_done_flattened = true;
        assert!(!stream.has_send_work());
    }
}
