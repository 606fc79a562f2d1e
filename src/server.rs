//! Listener setup and accept loop
//!
//! One TCP listener serves SOCKS5, HTTP and HTTPS CONNECT clients. A UDP
//! socket on the same host and port serves SOCKS5 UDP ASSOCIATE traffic.

use crate::config::Settings;
use crate::helper::UDP_SWEEP_INTERVAL;
use crate::session::{handle_connection, SessionContext};
use crate::transport::create_connector;
use crate::udp::UdpSessionManager;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Listen backlog of the TCP socket
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// A bound proxy server
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    udp: Arc<UdpSessionManager>,
    ctx: Arc<SessionContext>,
}

impl Server {
    /// Bind the TCP listener and the UDP socket
    pub async fn bind(settings: Arc<Settings>) -> Result<Self> {
        Self::bind_with_sweep_interval(settings, UDP_SWEEP_INTERVAL).await
    }

    /// Bind, sweeping idle UDP flows at the given interval
    pub async fn bind_with_sweep_interval(
        settings: Arc<Settings>,
        sweep_interval: Duration,
    ) -> Result<Self> {
        let bind_addr = settings.bind_addr();
        let addr = tokio::net::lookup_host(&bind_addr)
            .await
            .with_context(|| format!("Failed to resolve listen address {}", bind_addr))?
            .next()
            .with_context(|| format!("No address found for {}", bind_addr))?;

        let listener = bind_tcp_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let connector = create_connector(&settings);
        let udp = UdpSessionManager::bind(
            &local_addr.to_string(),
            connector.clone(),
            settings.udp_keep_alive_timeout,
        )
        .await?
        .with_sweep_interval(sweep_interval);
        let udp_port = udp.local_addr()?.port();

        let advertised =
            SocketAddrV4::new(settings.proxy_addr, settings.proxy_port.unwrap_or(udp_port));

        info!("Listening on {} (tcp, udp)", local_addr);
        info!("Advertising {} to SOCKS5 clients", advertised);
        if let Some(upstream) = &settings.upstream {
            info!("Chaining outbound traffic through {}", upstream.endpoint());
        }

        let udp = Arc::new(udp);
        Ok(Server {
            listener,
            ctx: Arc::new(SessionContext {
                connector,
                udp: udp.clone(),
                advertised,
            }),
            udp,
        })
    }

    /// Address of the TCP listener
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the UDP socket
    pub fn udp_local_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Endpoint advertised in SOCKS5 replies
    pub fn advertised(&self) -> SocketAddrV4 {
        self.ctx.advertised
    }

    /// UDP session manager of this server
    pub fn udp(&self) -> Arc<UdpSessionManager> {
        self.udp.clone()
    }

    /// Accept connections until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let udp_task = tokio::spawn(self.udp.clone().run(shutdown_rx.resubscribe()));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            tokio::spawn(handle_connection(stream, peer, self.ctx.clone()));
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server");
                    break;
                }
            }
        }

        let _ = udp_task.await;
        Ok(())
    }
}

/// Bind and run a server until shutdown
pub async fn run_server(settings: Settings, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let server = Server::bind(Arc::new(settings)).await?;
    server.run(shutdown_rx).await
}

fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .with_context(|| "Failed to create TCP socket")?;
    socket
        .set_reuse_address(true)
        .with_context(|| "Failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .with_context(|| "Failed to set SO_REUSEPORT")?;
    socket
        .set_nonblocking(true)
        .with_context(|| "Failed to set non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TCP listener to {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("Failed to listen on {}", addr))?;

    TcpListener::from_std(socket.into()).with_context(|| "Failed to create TcpListener")
}
