//! SOCKS5 wire format for Mixproxy
//!
//! Constants, types, the address/header codec shared by TCP requests and
//! UDP datagrams, and the reply builder. The session state machine that
//! drives these lives in [`crate::session`].

pub mod codec;
mod consts;
pub mod reply;
mod types;

pub use codec::{decode_datagram, encode_address, encode_datagram_header, parse_request};
pub use codec::{Datagram, SocksRequest};
pub use consts::*;
pub use types::{ProxyCommand, SocksCommand, TargetAddr};
