//! SOCKS5 upstream chaining
//!
//! TCP dials become a CONNECT through the upstream proxy. UDP flows open
//! their own UDP ASSOCIATE; the association lives as long as the flow.

use super::{Connector, DirectConnector, OutboundDatagram, StreamDyn};
use crate::config::UpstreamProxy;
use crate::socks::TargetAddr;
use anyhow::{Context, Result};
use async_socks5::{AddrKind, Auth, SocksDatagram};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};

/// Connector that chains every dial through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5Connector {
    upstream: UpstreamProxy,
    direct: DirectConnector,
}

impl Socks5Connector {
    /// Create a connector for the given upstream
    pub fn new(upstream: UpstreamProxy) -> Self {
        Socks5Connector {
            upstream,
            direct: DirectConnector::with_defaults(),
        }
    }

    fn auth(&self) -> Option<Auth> {
        self.upstream.auth.as_ref().map(|auth| Auth {
            username: auth.username.clone(),
            password: auth.password.clone(),
        })
    }

    async fn dial_upstream(&self) -> Result<TcpStream> {
        let proxy = TargetAddr::from_host(&self.upstream.host, self.upstream.port);
        self.direct
            .connect_tcp(&proxy)
            .await
            .with_context(|| format!("Failed to reach upstream {}", self.upstream.endpoint()))
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let mut stream = self.dial_upstream().await?;

        async_socks5::connect(&mut stream, AddrKind::from(target.clone()), self.auth())
            .await
            .with_context(|| {
                format!(
                    "Upstream {} refused CONNECT to {}",
                    self.upstream.endpoint(),
                    target
                )
            })?;

        tracing::debug!("Chained to {} via {}", target, self.upstream.endpoint());
        Ok(Box::new(stream))
    }

    async fn bind_datagram(&self, target: &TargetAddr) -> Result<Box<dyn OutboundDatagram>> {
        let stream = self.dial_upstream().await?;
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .with_context(|| "Failed to bind UDP socket")?;

        let datagram = SocksDatagram::associate(stream, socket, self.auth(), None::<SocketAddr>)
            .await
            .with_context(|| {
                format!(
                    "Upstream {} refused UDP ASSOCIATE",
                    self.upstream.endpoint()
                )
            })?;

        tracing::debug!(
            "UDP association for {} via {}",
            target,
            self.upstream.endpoint()
        );
        Ok(Box::new(ChainedDatagram {
            inner: datagram,
            destination: target.clone(),
        }))
    }
}

/// UDP association through the upstream proxy, fixed to one destination
pub struct ChainedDatagram {
    inner: SocksDatagram<TcpStream>,
    destination: TargetAddr,
}

impl std::fmt::Debug for ChainedDatagram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedDatagram")
            .field("destination", &self.destination)
            .finish()
    }
}

#[async_trait]
impl OutboundDatagram for ChainedDatagram {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.inner
            .send_to(payload, AddrKind::from(self.destination.clone()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, _from) = self
            .inner
            .recv_from(buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(len)
    }
}
