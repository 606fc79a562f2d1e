//! Configuration module for Mixproxy
//!
//! This module provides configuration types and parsing for the proxy.

mod server;
mod settings;
mod upstream;

pub use server::{Config, ServerConfig, UpstreamConfig};
pub use settings::Settings;
pub use upstream::{UpstreamAuth, UpstreamKind, UpstreamProxy, SYSTEM_PROXY_ENV_VARS};

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
