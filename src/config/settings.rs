//! Runtime settings
//!
//! [`Settings`] is the resolved, immutable form of [`Config`] that every
//! component receives through its constructor.

use super::{Config, UpstreamProxy};
use crate::error::ProxyError;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Immutable runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Host the listeners bind to
    pub host: String,
    /// Port the listeners bind to
    pub port: u16,
    /// IPv4 address advertised in SOCKS5 replies
    pub proxy_addr: Ipv4Addr,
    /// Port advertised in SOCKS5 replies, `None` means the bound UDP port
    pub proxy_port: Option<u16>,
    /// Idle time after which a UDP flow is released
    pub udp_keep_alive_timeout: Duration,
    /// Upstream proxy all outbound traffic is chained through
    pub upstream: Option<UpstreamProxy>,
    /// Open-file soft limit requested at startup
    pub soft_limit: Option<u64>,
}

impl Settings {
    /// Resolve a [`Config`] into settings
    ///
    /// A hostname in `proxy_addr` is resolved once, here, and the first
    /// IPv4 result is kept.
    pub async fn resolve(config: &Config) -> Result<Self> {
        config.server.validate().map_err(ProxyError::Config)?;

        let proxy_addr = resolve_ipv4(&config.server.proxy_addr)
            .await
            .with_context(|| format!("Failed to resolve proxy_addr {}", config.server.proxy_addr))?;

        let upstream = match &config.upstream.url {
            Some(url) => Some(UpstreamProxy::parse(url)?),
            None if config.upstream.enable_system_proxy => UpstreamProxy::from_env()?,
            None => None,
        };

        Ok(Settings {
            host: config.server.host.clone(),
            port: config.server.port,
            proxy_addr,
            proxy_port: config.server.proxy_port,
            udp_keep_alive_timeout: Duration::from_secs(config.server.udp_keep_alive_timeout),
            upstream,
            soft_limit: config.server.soft_limit,
        })
    }

    /// Settings for a loopback proxy on an ephemeral port
    pub fn local(udp_keep_alive_timeout: Duration) -> Self {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            proxy_addr: Ipv4Addr::LOCALHOST,
            proxy_port: None,
            udp_keep_alive_timeout,
            upstream: None,
            soft_limit: None,
        }
    }

    /// `host:port` the listeners bind to
    pub fn bind_addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("No IPv4 address found for {}", host))
}
