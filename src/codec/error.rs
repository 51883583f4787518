use crate::frame::{Reason, StreamId};

/// Errors caused by the peer's bytes.
///
/// The two scopes behave very differently: a connection error tears the whole
/// connection down behind a GOAWAY, while a stream error resets one stream
/// and lets the connection carry on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    Connection {
        reason: Reason,
        /// Human-readable description carried as GOAWAY debug data.
        desc: &'static str,
    },
    Stream {
        id: StreamId,
        reason: Reason,
    },
}

impl RecvError {
    pub fn connection(reason: Reason, desc: &'static str) -> RecvError {
        RecvError::Connection { reason, desc }
    }

    pub fn stream(id: StreamId, reason: Reason) -> RecvError {
        RecvError::Stream { id, reason }
    }
}
