//! TCP sessions
//!
//! Protocol detection, the SOCKS5 and HTTP handshakes, and the relay that
//! runs once a session has a target.

mod handler;
pub mod http;
mod relay;

pub use handler::{handle_connection, Session, SessionContext};
pub use relay::{pump, read_chunk, relay, ReadOutcome, RelayStats, TerminationSignal};
