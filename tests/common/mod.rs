//! Test utilities for Mixproxy
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use mixproxy::config::Settings;
use mixproxy::server::Server;
use mixproxy::udp::UdpSessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

/// Timeout applied to every network wait in the tests
pub const WAIT: Duration = Duration::from_secs(5);

/// A proxy running on loopback for the duration of a test
pub struct TestProxy {
    /// TCP listener address
    pub addr: SocketAddr,
    /// UDP socket address
    pub udp_addr: SocketAddr,
    /// UDP manager, for inspecting the flow table
    pub udp: Arc<UdpSessionManager>,
    shutdown_tx: broadcast::Sender<bool>,
}

impl TestProxy {
    /// Start a proxy with a 60 second UDP keep-alive
    pub async fn start() -> Self {
        Self::start_with(Settings::local(Duration::from_secs(60)), Duration::from_secs(1)).await
    }

    /// Start a proxy with the given settings and sweep interval
    pub async fn start_with(settings: Settings, sweep_interval: Duration) -> Self {
        let server = Server::bind_with_sweep_interval(Arc::new(settings), sweep_interval)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let udp_addr = server.udp_local_addr().unwrap();
        let udp = server.udp();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(server.run(shutdown_rx));

        TestProxy {
            addr,
            udp_addr,
            udp,
            shutdown_tx,
        }
    }

    /// Stop the proxy
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a TCP server that echoes everything back
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Start a UDP server that echoes every datagram back
pub async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    addr
}

/// Read exactly `len` bytes, failing the test on timeout
pub async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Open a SOCKS5 CONNECT through the proxy and return the reply
pub async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    let method = read_exact_timeout(&mut stream, 2).await;
    assert_eq!(method, vec![0x05, 0x00]);

    stream
        .write_all(&socks5_mock::create_request(0x01, target))
        .await
        .unwrap();
    let reply = read_exact_timeout(&mut stream, 10).await;
    (stream, reply)
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use mixproxy::socks::*;
    use std::net::SocketAddr;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a request for any command to an IP address
    pub fn create_request(command: u8, addr: SocketAddr) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, command, SOCKS5_RESERVED];
        cmd.extend(encode_address(&TargetAddr::from(addr)));
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, SOCKS5_RESERVED];
        cmd.extend(encode_address(&TargetAddr::domain(domain, port)));
        cmd
    }

    /// Wrap a payload in a SOCKS5 UDP header
    pub fn create_datagram(destination: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut datagram = encode_datagram_header(0, &TargetAddr::from(destination)).to_vec();
        datagram.extend_from_slice(payload);
        datagram
    }
}
