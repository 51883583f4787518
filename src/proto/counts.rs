use crate::frame::StreamId;
use crate::proto::stream::StreamState;

/// Per-direction stream counters.
///
/// `open` covers every stream past RECV_HEADERS that has not reached
/// END_STREAM; `half_closed` those whose request has been handed to the
/// application (the admission gate is `pull.half_closed + push.half_closed`
/// against the configured concurrency); `send_body` those currently emitting
/// a response body.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerKind {
    pub open: u32,
    pub half_closed: u32,
    pub send_body: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NumStreams {
    pub pull: PerKind,
    pub push: PerKind,
    /// Streams opened by a PRIORITY frame alone (still IDLE).
    pub priority_open: u32,
    pub blocked_by_server: u32,
    pub req_streaming_in_progress: u32,
    pub tunnel: u32,
}

/// Stream-id watermarks, one set per direction.
///
/// `max_open` is monotonically non-decreasing and freezes once the
/// connection leaves the OPEN state, which is what makes late streams
/// detectable after a GOAWAY.
#[derive(Debug, Clone, Copy)]
pub struct StreamIds {
    pub max_open: StreamId,
    pub max_processed: StreamId,
}

#[derive(Debug)]
pub struct Counts {
    pub num: NumStreams,
    pub pull_ids: StreamIds,
    pub push_ids: StreamIds,
}

impl Default for StreamIds {
    fn default() -> StreamIds {
        StreamIds {
            max_open: StreamId::ZERO,
            max_processed: StreamId::ZERO,
        }
    }
}

impl StreamIds {
    pub fn note_open(&mut self, id: StreamId) {
        debug_assert!(id >= self.max_open);
        self.max_open = id;
    }
}

impl Counts {
    pub fn new() -> Counts {
        Counts {
            num: NumStreams::default(),
            pull_ids: StreamIds::default(),
            push_ids: StreamIds::default(),
        }
    }

    pub fn can_run_requests(&self, max_concurrent_requests: u32) -> bool {
        self.num.pull.half_closed + self.num.push.half_closed < max_concurrent_requests
    }

    /// Streams counting against the connection's lifetime: once this hits
    /// zero in the HALF_CLOSED state the connection winds down.
    pub fn open_streams(&self) -> u32 {
        self.num.pull.open + self.num.push.open
    }

    /// Apply the counter deltas of a lifecycle transition.
    pub fn transition(&mut self, id: StreamId, old: StreamState, new: StreamState) {
        debug_assert!(new > old, "stream state must advance: {:?} -> {:?}", old, new);

        let per = if id.is_push() {
            &mut self.num.push
        } else {
            &mut self.num.pull
        };

        if new == StreamState::EndStream {
            if old >= StreamState::RecvHeaders {
                per.open -= 1;
            }
            if old >= StreamState::SendHeaders {
                per.half_closed -= 1;
            }
            if old >= StreamState::SendBody {
                per.send_body -= 1;
            }
            return;
        }

        if old < StreamState::RecvHeaders && new >= StreamState::RecvHeaders {
            per.open += 1;
        }
        if old < StreamState::SendHeaders && new >= StreamState::SendHeaders {
            per.half_closed += 1;
        }
        if old < StreamState::SendBody && new >= StreamState::SendBody {
            per.send_body += 1;
        }
    }
}
