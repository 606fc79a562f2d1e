//! # Mixproxy - SOCKS5, HTTP and HTTPS proxy on one port
//!
//! Mixproxy is a local forward proxy. A single TCP port accepts SOCKS5
//! (CONNECT and UDP ASSOCIATE), plain HTTP forwarding and HTTP CONNECT
//! tunnels; the protocol is detected from the first bytes a client sends.
//! A UDP socket on the same port relays SOCKS5 UDP datagrams.
//!
//! ## Features
//!
//! - **Protocol sniffing**: SOCKS5 and HTTP clients share one listener
//! - **UDP ASSOCIATE**: per-client forwarding flows with idle eviction
//! - **Upstream chaining**: outbound traffic can go through a SOCKS5 or HTTP proxy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mixproxy::config::{load_config, Settings};
//! use mixproxy::server::run_server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let settings = Settings::resolve(&config).await?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_server(settings, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> TCP listener -> Session -> Connector -> Target
//!        -> UDP socket  -> UdpSessionManager -> Flow -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod server;
pub mod session;
pub mod socks;
pub mod transport;
pub mod udp;

// Re-export commonly used items
pub use config::{load_config, Config, Settings};
pub use error::{DecodeError, ProxyError};
pub use server::{run_server, Server};

/// Version of the Mixproxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "mixproxy");
    }
}
