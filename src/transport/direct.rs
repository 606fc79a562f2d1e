//! Direct outbound connections
//!
//! Dials destinations without any upstream proxy. A dial is bounded only
//! by the operating system's connect timeout.

use super::{Connector, OutboundDatagram, SocketOpts, StreamDyn};
use crate::socks::TargetAddr;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};

/// Connector that dials destinations directly
#[derive(Debug, Clone)]
pub struct DirectConnector {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
}

impl DirectConnector {
    /// Create a new direct connector with default options
    pub fn with_defaults() -> Self {
        DirectConnector {
            socket_opts: SocketOpts::default(),
        }
    }

    /// Open a plain TCP stream to the target
    ///
    /// Every resolved address is tried in order until one connects. The
    /// error of the last attempt is returned if none does.
    pub async fn connect_tcp(&self, target: &TargetAddr) -> Result<TcpStream> {
        let addrs = target.resolve_all().await?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = self.socket_opts.apply(&stream) {
                        tracing::warn!("Failed to apply socket options: {}", e);
                    }
                    tracing::debug!("TCP connection established to {} ({})", target, addr);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!("Connect to {} ({}) failed: {}", target, addr, e);
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to"));
        Err(error).with_context(|| format!("Failed to connect to {}", target))
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect_tcp(target).await?;
        Ok(Box::new(stream))
    }

    async fn bind_datagram(&self, target: &TargetAddr) -> Result<Box<dyn OutboundDatagram>> {
        let resolved = target.resolve().await?;
        let socket = DirectDatagram::bind(resolved).await?;
        Ok(Box::new(socket))
    }
}

/// UDP socket connected to a single destination
#[derive(Debug)]
pub struct DirectDatagram {
    socket: UdpSocket,
}

impl DirectDatagram {
    /// Bind an ephemeral socket of the right family and connect it
    pub async fn bind(destination: SocketAddr) -> Result<Self> {
        let local = match destination {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| "Failed to bind UDP socket")?;
        socket
            .connect(destination)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", destination))?;
        Ok(DirectDatagram { socket })
    }
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}
