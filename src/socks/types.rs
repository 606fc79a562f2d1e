//! SOCKS5 type definitions
//!
//! Defines the core types used in SOCKS5 protocol handling, plus the
//! proxy command kind negotiated for every session.

use super::consts::*;
use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a TCP connection to target
    Connect,
    /// TCP BIND - wait for incoming connection (not implemented)
    Bind,
    /// UDP ASSOCIATE - establish UDP relay
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte into SocksCommand
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// What a session ended up doing once its handshake completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    /// SOCKS5 CONNECT
    SocksConnect,
    /// SOCKS5 BIND (rejected)
    SocksBind,
    /// SOCKS5 UDP ASSOCIATE
    SocksUdp,
    /// Plain HTTP forwarding
    Http,
    /// HTTP CONNECT tunnel
    Https,
}

impl From<SocksCommand> for ProxyCommand {
    fn from(cmd: SocksCommand) -> Self {
        match cmd {
            SocksCommand::Connect => ProxyCommand::SocksConnect,
            SocksCommand::Bind => ProxyCommand::SocksBind,
            SocksCommand::UdpAssociate => ProxyCommand::SocksUdp,
        }
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyCommand::SocksConnect => "SOCKS_CONNECT",
            ProxyCommand::SocksBind => "SOCKS_BIND",
            ProxyCommand::SocksUdp => "SOCKS_UDP",
            ProxyCommand::Http => "HTTP",
            ProxyCommand::Https => "HTTPS",
        };
        f.write_str(name)
    }
}

/// Target address for proxy requests
///
/// Represents the destination of a SOCKS5 request, a SOCKS5 UDP datagram
/// or an HTTP request. Can be an IP address (v4 or v6) or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create a new TargetAddr from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create a new TargetAddr from a domain name and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(domain.into(), port)
    }

    /// Build a TargetAddr from a host string, keeping IP literals as IPs
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// Get the host part as a string
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Get the address type byte for SOCKS5 protocol
    pub fn addr_type(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => SOCKS5_ADDR_TYPE_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => SOCKS5_ADDR_TYPE_IPV6,
            TargetAddr::Domain(_, _) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Resolve the address to every SocketAddr it names
    ///
    /// For IP addresses, this returns immediately.
    /// For domain names, this performs DNS resolution and keeps the
    /// resolver's order.
    pub async fn resolve_all(&self) -> Result<Vec<SocketAddr>> {
        match self {
            TargetAddr::Ip(addr) => Ok(vec![*addr]),
            TargetAddr::Domain(domain, port) => {
                let resolved: Vec<SocketAddr> = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to resolve domain: {}", domain))?
                    .collect();
                if resolved.is_empty() {
                    anyhow::bail!("No addresses found for domain: {}", domain);
                }
                Ok(resolved)
            }
        }
    }

    /// Resolve the address to its first SocketAddr
    pub async fn resolve(&self) -> Result<SocketAddr> {
        self.resolve_all()
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("No addresses found for {}", self))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl From<TargetAddr> for async_socks5::AddrKind {
    fn from(addr: TargetAddr) -> Self {
        match addr {
            TargetAddr::Ip(addr) => async_socks5::AddrKind::Ip(addr),
            TargetAddr::Domain(domain, port) => async_socks5::AddrKind::Domain(domain, port),
        }
    }
}

impl Default for TargetAddr {
    fn default() -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}
