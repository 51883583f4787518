pub(crate) mod connection;
pub(crate) mod counts;
pub(crate) mod scheduler;
pub(crate) mod store;
pub(crate) mod stream;
pub(crate) mod timers;
pub(crate) mod window;

pub use self::connection::{Connection, Stats};

pub type WindowSize = u32;

// Constants
pub const DEFAULT_INITIAL_WINDOW_SIZE: WindowSize = 65_535;
pub const MAX_WINDOW_SIZE: WindowSize = (1 << 31) - 1;

/// Target for the connection-level receive window; the preface raises the
/// peer's view of it from the default 65,535 with one WINDOW_UPDATE.
pub const CONNECTION_WINDOW_SIZE: WindowSize = 16 * 1024 * 1024;

/// MAX_CONCURRENT_STREAMS advertised in the server preface.
pub const LOCAL_MAX_CONCURRENT_STREAMS: u32 = 100;

/// The fixed 24 bytes every HTTP/2 client must send first.
pub(crate) const PREFACE: [u8; 24] = *b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
