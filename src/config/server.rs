//! Server configuration types
//!
//! Defines the configuration structures as they appear in the TOML file.

use serde::{Deserialize, Serialize};

/// Default bind host
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default bind port, shared by the TCP and UDP listeners
fn default_port() -> u16 {
    7999
}

/// Default address advertised in SOCKS5 replies
fn default_proxy_addr() -> String {
    "127.0.0.1".to_string()
}

/// Default UDP keep-alive timeout in seconds
fn default_udp_keep_alive_timeout() -> u64 {
    60
}

/// Default open-file soft limit
fn default_soft_limit() -> Option<u64> {
    Some(65535)
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream proxy configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Host to bind the TCP and UDP listeners on
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind the TCP and UDP listeners on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address advertised to SOCKS5 clients for UDP traffic
    ///
    /// Hostnames are resolved once at startup to an IPv4 literal.
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: String,

    /// Port advertised to SOCKS5 clients; defaults to the bound UDP port
    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// Seconds a UDP flow may stay idle before it is released
    #[serde(default = "default_udp_keep_alive_timeout")]
    pub udp_keep_alive_timeout: u64,

    /// Open-file soft limit to request at startup
    #[serde(default = "default_soft_limit")]
    pub soft_limit: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            proxy_addr: default_proxy_addr(),
            proxy_port: None,
            udp_keep_alive_timeout: default_udp_keep_alive_timeout(),
            soft_limit: default_soft_limit(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("server.host must not be empty".to_string());
        }
        if self.proxy_addr.is_empty() {
            return Err("server.proxy_addr must not be empty".to_string());
        }
        if self.udp_keep_alive_timeout == 0 {
            return Err("server.udp_keep_alive_timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// Upstream proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UpstreamConfig {
    /// Chain through the proxy named by `ALL_PROXY` / `all_proxy`
    #[serde(default)]
    pub enable_system_proxy: bool,

    /// Explicit upstream proxy URL, e.g. `socks5://127.0.0.1:1080`
    #[serde(default)]
    pub url: Option<String>,
}
