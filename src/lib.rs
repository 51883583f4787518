//! A server-side HTTP/2 connection engine.
//!
//! `h2core` owns the per-connection state of the multiplexed protocol:
//! ingesting framed bytes, HPACK-decoding header blocks, admitting new
//! streams, enforcing flow control in both directions, running the weighted
//! priority scheduler that decides which stream emits DATA next, and
//! performing orderly or abrupt teardown.
//!
//! The crate does no I/O and spawns no tasks. A [`Connection`] is a plain
//! state object driven from an external reactor:
//!
//! - socket bytes go in through [`Connection::recv`];
//! - gathered writes come out of [`Connection::start_write`], acknowledged
//!   with [`Connection::on_write_complete`];
//! - deadlines are read from [`Connection::next_timeout`] and fired with
//!   [`Connection::handle_timeout`];
//! - completed requests and body chunks are pulled as [`server::Event`]s,
//!   and the application responds through the `send_*` methods.
//!
//! ```no_run
//! use std::time::Instant;
//! use h2core::server::{Builder, Event};
//!
//! let mut conn = Builder::new().handshake(Instant::now());
//!
//! // reactor loop (sketch)
//! loop {
//!     # let socket_bytes: &[u8] = &[];
//!     conn.recv(socket_bytes, Instant::now());
//!
//!     while let Some(event) = conn.poll_event() {
//!         if let Event::Request { id, .. } = event {
//!             conn.send_response(id, http::StatusCode::OK, Default::default(), false).unwrap();
//!             conn.send_data(id, "hello".into(), true).unwrap();
//!         }
//!     }
//!
//!     while let Some(buf) = conn.start_write(Instant::now()) {
//!         // write `buf` to the socket...
//!         conn.on_write_complete(Instant::now());
//!     }
//!     # break;
//! }
//! ```

mod frame;

mod codec;
mod error;
mod proto;

pub mod server;

pub use crate::error::Error;
pub use crate::frame::{Reason, StreamId};
pub use crate::proto::{Connection, Stats};
