//! Mixproxy - SOCKS5, HTTP and HTTPS proxy on one port
//!
//! This is the main entry point for the Mixproxy application.

use anyhow::Result;
use clap::Parser;
use mixproxy::config::{load_config, Config, Settings};
use mixproxy::helper::set_open_file_limit;
use mixproxy::server::run_server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Mixproxy - local SOCKS5, HTTP and HTTPS CONNECT proxy
#[derive(Parser, Debug)]
#[command(name = "mixproxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "MIXPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind the TCP and UDP listeners to
    #[arg(long, env = "MIXPROXY_HOST")]
    host: Option<String>,

    /// Port to bind the TCP and UDP listeners to
    #[arg(short, long, env = "MIXPROXY_PORT")]
    port: Option<u16>,

    /// Address advertised to SOCKS5 UDP clients
    #[arg(long, env = "MIXPROXY_PROXY_ADDR")]
    proxy_addr: Option<String>,

    /// Port advertised to SOCKS5 UDP clients (defaults to the UDP port)
    #[arg(long, env = "MIXPROXY_PROXY_PORT")]
    proxy_port: Option<u16>,

    /// Seconds an idle UDP flow is kept
    #[arg(long, env = "MIXPROXY_UDP_KEEP_ALIVE_TIMEOUT")]
    udp_keep_alive_timeout: Option<u64>,

    /// Open-file soft limit to request at startup
    #[arg(long, env = "MIXPROXY_SOFT_LIMIT")]
    soft_limit: Option<u64>,

    /// Chain outbound traffic through the proxy in ALL_PROXY
    #[arg(long, env = "MIXPROXY_ENABLE_SYSTEM_PROXY")]
    enable_system_proxy: bool,

    /// Upstream proxy URL (socks5://, socks5h://, http://)
    #[arg(long, env = "MIXPROXY_UPSTREAM")]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "MIXPROXY_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MIXPROXY_JSON_LOG")]
    json_log: bool,
}

impl Args {
    /// Overlay command line values on the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(proxy_addr) = &self.proxy_addr {
            config.server.proxy_addr = proxy_addr.clone();
        }
        if let Some(proxy_port) = self.proxy_port {
            config.server.proxy_port = Some(proxy_port);
        }
        if let Some(timeout) = self.udp_keep_alive_timeout {
            config.server.udp_keep_alive_timeout = timeout;
        }
        if let Some(soft_limit) = self.soft_limit {
            config.server.soft_limit = Some(soft_limit);
        }
        if self.enable_system_proxy {
            config.upstream.enable_system_proxy = true;
        }
        if let Some(url) = &self.upstream {
            config.upstream.url = Some(url.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => Config::default(),
    };
    args.apply(&mut config);

    let settings = Settings::resolve(&config).await?;

    info!("Mixproxy v{}", mixproxy::VERSION);
    match set_open_file_limit(settings.soft_limit) {
        Ok(Some(limit)) => info!("Open file soft limit: {}", limit),
        Ok(None) => {}
        Err(e) => warn!("Failed to set open file soft limit: {}", e),
    }

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_clone.send(true);
    });

    run_server(settings, shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to setup SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    // On Windows, only handle Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
