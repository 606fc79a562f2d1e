//! SOCKS5 UDP relay
//!
//! One shared UDP socket serves every UDP ASSOCIATE client. The
//! [`UdpSessionManager`] owns it along with the table of forwarding flows.

mod flow;
mod manager;

pub use flow::{Flow, FlowTable};
pub use manager::UdpSessionManager;
