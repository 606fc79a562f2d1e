//! Outbound transport for Mixproxy
//!
//! Every outbound dial made by a session or a UDP flow goes through a
//! [`Connector`]. The core does not know whether the connector talks to
//! the destination directly or chains through an upstream proxy.

mod direct;
mod http;
mod socks5;

pub use direct::DirectConnector;
pub use http::HttpConnector;
pub use socks5::Socks5Connector;

use crate::config::{Settings, UpstreamKind};
use crate::socks::TargetAddr;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> StreamDyn for T {}

/// A datagram socket bound for a single destination
#[async_trait]
pub trait OutboundDatagram: Debug + Send + Sync {
    /// Send one payload to the destination
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;

    /// Receive one payload from the destination
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens outbound TCP streams and UDP sockets
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    /// Open a TCP stream to the target
    async fn connect(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>>;

    /// Open a datagram socket that sends to the target
    async fn bind_datagram(&self, target: &TargetAddr) -> Result<Box<dyn OutboundDatagram>>;
}

/// Create the connector the settings call for
pub fn create_connector(settings: &Settings) -> Arc<dyn Connector> {
    match &settings.upstream {
        None => Arc::new(DirectConnector::with_defaults()),
        Some(upstream) => match upstream.kind {
            UpstreamKind::Socks5 => Arc::new(Socks5Connector::new(upstream.clone())),
            UpstreamKind::Http => Arc::new(HttpConnector::new(upstream.clone())),
        },
    }
}
