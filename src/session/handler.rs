//! Per-connection state machine
//!
//! Every accepted TCP connection becomes a [`Session`]. The first read
//! decides the protocol: anything containing `HTTP` is handled as an HTTP
//! proxy request, everything else must be an anonymous SOCKS5 greeting.
//!
//! ```text
//! Accept -> SocksHandshake | HttpSniff -> Dialing -> Relaying -> Closing
//! ```
//!
//! Whatever fails along the way, the session always ends in
//! [`Session::close`].

use super::http::{self, RequestHead, CONNECT_RESPONSE};
use super::relay::{read_chunk, relay, ReadOutcome};
use crate::error::{ProxyError, Socks5ReplyCode};
use crate::helper::READ_LIMIT;
use crate::socks::{self, reply, ProxyCommand, SocksCommand, TargetAddr};
use crate::transport::{Connector, StreamDyn};
use crate::udp::UdpSessionManager;
use anyhow::{Context, Result};
use std::fmt::Debug;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Everything a session needs from the server
#[derive(Debug)]
pub struct SessionContext {
    /// Dials targets for CONNECT and HTTP sessions
    pub connector: Arc<dyn Connector>,
    /// UDP manager whose flows are released when a UDP session ends
    pub udp: Arc<UdpSessionManager>,
    /// Endpoint advertised in SOCKS5 success replies
    pub advertised: SocketAddrV4,
}

/// Serve one accepted connection to completion
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static,
{
    debug!("Accepted connection from {}", peer);
    let mut session = Session::new(stream, peer);
    if let Err(e) = session.run(&ctx).await {
        warn!("Session from {} failed: {:#}", peer, e);
    }
    session.close().await;
}

/// A single client connection
#[derive(Debug)]
pub struct Session<S> {
    peer: SocketAddr,
    client: Option<S>,
    target: Option<Box<dyn StreamDyn>>,
    command: Option<ProxyCommand>,
    destination: Option<TargetAddr>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static,
{
    /// Wrap an accepted client stream
    pub fn new(client: S, peer: SocketAddr) -> Self {
        Session {
            peer,
            client: Some(client),
            target: None,
            command: None,
            destination: None,
        }
    }

    /// Command negotiated by the handshake
    pub fn command(&self) -> Option<ProxyCommand> {
        self.command
    }

    /// Destination negotiated by the handshake
    pub fn destination(&self) -> Option<&TargetAddr> {
        self.destination.as_ref()
    }

    /// Run the handshake and then relay until either side is done
    pub async fn run(&mut self, ctx: &SessionContext) -> Result<()> {
        let first = self.accept().await?;

        if http::is_http(&first) {
            self.http_handshake(&first, ctx).await?;
        } else {
            self.socks_handshake(&first, ctx).await?;
        }

        debug!(
            "cmd: {:?}, dst: {:?}, peer: {}",
            self.command, self.destination, self.peer
        );
        self.forward(ctx).await
    }

    /// Close both streams. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            let _ = client.shutdown().await;
        }
        if let Some(mut target) = self.target.take() {
            let _ = target.shutdown().await;
        }
    }

    fn client_mut(&mut self) -> Result<&mut S, ProxyError> {
        self.client
            .as_mut()
            .ok_or_else(|| ProxyError::connect("client stream already closed"))
    }

    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let client = self.client_mut()?;
        let mut buf = vec![0u8; READ_LIMIT];
        match read_chunk(client, &mut buf).await {
            ReadOutcome::Data(n) => {
                buf.truncate(n);
                trace!("[Input] < {:?}", buf);
                Ok(buf)
            }
            ReadOutcome::Closed => Err(ProxyError::connect("client closed the connection").into()),
            ReadOutcome::Failed(e) => Err(e).context("Failed to read from client"),
        }
    }

    async fn accept(&mut self) -> Result<Vec<u8>> {
        self.read_message()
            .await
            .context("No request received")
    }

    async fn dial(&mut self, ctx: &SessionContext, destination: &TargetAddr) -> Result<()> {
        let target = ctx
            .connector
            .connect(destination)
            .await
            .with_context(|| format!("Failed to open connection to {}", destination))?;
        debug!("open connection to {} success", destination);
        self.target = Some(target);
        Ok(())
    }

    async fn http_handshake(&mut self, data: &[u8], ctx: &SessionContext) -> Result<()> {
        if http::is_connect(data) {
            self.command = Some(ProxyCommand::Https);
            let destination = http::parse_connect_target(data)?;
            self.destination = Some(destination.clone());
            self.dial(ctx, &destination).await?;

            let client = self.client_mut()?;
            client.write_all(CONNECT_RESPONSE).await?;
            client.flush().await?;
            trace!("[Output] > {:?}", CONNECT_RESPONSE);

            // A client may start its TLS handshake in the same write as the head
            let early_data = http::after_head(data);
            if !early_data.is_empty() {
                if let Some(target) = self.target.as_mut() {
                    target.write_all(early_data).await?;
                    target.flush().await?;
                }
            }
            return Ok(());
        }

        self.command = Some(ProxyCommand::Http);
        let head = RequestHead::parse(data)?;
        let destination = head.destination()?;
        debug!("{} {} {} -> {}", head.method, head.target, head.version, destination);
        self.destination = Some(destination.clone());
        self.dial(ctx, &destination).await?;

        if let Some(target) = self.target.as_mut() {
            target.write_all(data).await?;
            target.flush().await?;
        }
        Ok(())
    }

    async fn socks_handshake(&mut self, greeting: &[u8], ctx: &SessionContext) -> Result<()> {
        if greeting.len() < 2 || greeting[0] != socks::SOCKS5_VERSION {
            return Err(ProxyError::connect(format!(
                "unsupported protocol, first bytes {:02x?}",
                &greeting[..greeting.len().min(2)]
            ))
            .into());
        }
        if greeting[1] != socks::SOCKS5_ANONYMOUS_METHOD_COUNT {
            return Err(ProxyError::connect("only anonymous auth accepted").into());
        }

        reply::send_method_selection(self.client_mut()?).await?;

        // A client may send its request without waiting for the method reply.
        let greeting_len = 2 + usize::from(greeting[1]);
        let request = if greeting.len() > greeting_len {
            greeting[greeting_len..].to_vec()
        } else {
            self.read_message()
                .await
                .context("No SOCKS5 request received")?
        };

        let parsed = socks::parse_request(&request)?;
        let destination = parsed.destination;
        let early_data = &request[parsed.header_len..];
        self.destination = Some(destination.clone());

        let command = SocksCommand::from_byte(parsed.command);
        self.command = command.map(ProxyCommand::from);
        match command {
            Some(SocksCommand::Connect) => {
                if let Err(e) = self.dial(ctx, &destination).await {
                    let code = Socks5ReplyCode::from(&e);
                    let _ = reply::send_failure(self.client_mut()?, code).await;
                    return Err(e);
                }
            }
            Some(SocksCommand::Bind) => {
                let _ = reply::send_failure(self.client_mut()?, Socks5ReplyCode::CommandNotSupported)
                    .await;
                return Err(ProxyError::connect("bind not supported").into());
            }
            Some(SocksCommand::UdpAssociate) => {}
            None => {
                let _ = reply::send_failure(self.client_mut()?, Socks5ReplyCode::CommandNotSupported)
                    .await;
                return Err(ProxyError::connect(format!(
                    "unknown command {:#04x}",
                    parsed.command
                ))
                .into());
            }
        }

        reply::send_success(self.client_mut()?, ctx.advertised).await?;

        if !early_data.is_empty() {
            if let Some(target) = self.target.as_mut() {
                target.write_all(early_data).await?;
                target.flush().await?;
            }
        }
        Ok(())
    }

    async fn forward(&mut self, ctx: &SessionContext) -> Result<()> {
        if self.command == Some(ProxyCommand::SocksUdp) {
            return self.watch_udp_control(ctx).await;
        }

        let client = self
            .client
            .take()
            .ok_or_else(|| ProxyError::connect("client stream already closed"))?;
        let target = self
            .target
            .take()
            .ok_or_else(|| ProxyError::connect("no target connection to relay to"))?;

        info!(
            "{} tunnel {} <-> {}",
            self.command.map(|c| c.to_string()).unwrap_or_default(),
            self.peer,
            self.destination
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        );
        relay(client, target).await;
        Ok(())
    }

    /// Hold the UDP association open until the control connection ends
    async fn watch_udp_control(&mut self, ctx: &SessionContext) -> Result<()> {
        let requested = self.destination.clone().unwrap_or_default();
        let source = udp_source(self.peer, &requested);
        ctx.udp.associate(source.ip()).await;

        let client = self.client_mut()?;
        let mut buf = vec![0u8; READ_LIMIT];
        loop {
            match read_chunk(client, &mut buf).await {
                ReadOutcome::Data(n) => trace!("Ignoring {} bytes on UDP control connection", n),
                ReadOutcome::Closed => break,
                ReadOutcome::Failed(e) => {
                    debug!("UDP control connection error: {}", e);
                    break;
                }
            }
        }

        let released = release_udp_flows(&ctx.udp, source).await;
        debug!(
            "UDP association from {} ended, released {} flows",
            self.peer, released
        );
        Ok(())
    }
}

/// Client UDP source address named by a UDP ASSOCIATE request
///
/// An unspecified IP stands for the control connection's own IP. Port 0
/// means the client did not say which port it will send from.
fn udp_source(peer: SocketAddr, requested: &TargetAddr) -> SocketAddr {
    match requested {
        TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
            SocketAddr::new(peer.ip(), addr.port())
        }
        TargetAddr::Ip(addr) => *addr,
        TargetAddr::Domain(_, port) => SocketAddr::new(peer.ip(), *port),
    }
}

/// Release the flows an ended UDP association was covering
///
/// A known source port releases exactly that client's flow. Without one,
/// the flows from that IP are only released once no other association
/// from the same IP is still open; until then idle expiry reclaims them.
async fn release_udp_flows(udp: &UdpSessionManager, source: SocketAddr) -> usize {
    let remaining = udp.dissociate(source.ip()).await;
    if source.port() != 0 {
        usize::from(udp.release(&source).await)
    } else if remaining == 0 {
        udp.release_host(source.ip()).await
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DirectConnector;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    async fn context() -> Arc<SessionContext> {
        let connector: Arc<dyn Connector> = Arc::new(DirectConnector::with_defaults());
        let udp = UdpSessionManager::bind("127.0.0.1:0", connector.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        Arc::new(SessionContext {
            connector,
            udp: Arc::new(udp),
            advertised: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7999),
        })
    }

    /// Wait until the UDP manager holds `count` open flows
    async fn wait_for_flows(udp: &UdpSessionManager, count: usize) -> bool {
        for _ in 0..100 {
            if udp.flow_count().await == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    async fn echo_server() -> SocketAddr {
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

    fn connect_request(addr: SocketAddr) -> Vec<u8> {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend(socks::encode_address(&TargetAddr::from(addr)));
        request
    }

    #[tokio::test]
    async fn test_empty_first_read_fails() {
        let ctx = context().await;
        let (client, server) = duplex(1024);
        drop(client);

        let mut session = Session::new(server, peer());
        assert!(session.run(&ctx).await.is_err());
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_non_anonymous_greeting_rejected() {
        let ctx = context().await;
        let (mut client, server) = duplex(1024);
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

        let mut session = Session::new(server, peer());
        let err = session.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("anonymous"));
        session.close().await;

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_socks_connect_relays() {
        let ctx = context().await;
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(server, peer(), ctx));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(&connect_request(echo)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x3f]);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_socks_pipelined_request() {
        let ctx = context().await;
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(handle_connection(server, peer(), ctx));

        let mut message = vec![0x05, 0x01, 0x00];
        message.extend(connect_request(echo));
        message.extend_from_slice(b"early");
        client.write_all(&message).await.unwrap();

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[3], 0x00);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_socks_connect_refused_sends_failure() {
        let ctx = context().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(server, peer(), ctx));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&connect_request(closed)).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::ConnectionRefused));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_socks_bind_not_supported() {
        let ctx = context().await;
        let (mut client, server) = duplex(4096);
        let mut session = Session::new(server, peer());

        let mut message = vec![0x05, 0x01, 0x00, 0x05, 0x02, 0x00];
        message.extend(socks::encode_address(&TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 80)));
        client.write_all(&message).await.unwrap();

        let err = session.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("bind not supported"));
        assert_eq!(session.command(), Some(ProxyCommand::SocksBind));
        session.close().await;

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x05, 0x00]);
        assert_eq!(buf[3], u8::from(Socks5ReplyCode::CommandNotSupported));
    }

    #[tokio::test]
    async fn test_http_connect_tunnel() {
        let ctx = context().await;
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(handle_connection(server, peer(), ctx));

        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: x\r\n\r\n", echo.port());
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = vec![0u8; CONNECT_RESPONSE.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, CONNECT_RESPONSE);

        client.write_all(b"tunnel").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");
    }

    #[tokio::test]
    async fn test_http_forward_sends_request_verbatim() {
        let ctx = context().await;
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(handle_connection(server, peer(), ctx));

        let request = format!(
            "GET http://127.0.0.1:{}/path HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
            echo.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; request.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, request.as_bytes());
    }

    #[tokio::test]
    async fn test_udp_associate_releases_on_close() {
        let ctx = context().await;
        let udp_client = SocketAddr::from(([127, 0, 0, 1], 40100));
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(server, peer(), ctx.clone()));

        let mut message = vec![0x05, 0x01, 0x00, 0x05, 0x03, 0x00];
        message.extend(socks::encode_address(&TargetAddr::from(udp_client)));
        client.write_all(&message).await.unwrap();
        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[2..], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x3f]);

        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = socks::encode_datagram_header(0, &TargetAddr::from(echo.local_addr().unwrap())).to_vec();
        datagram.extend_from_slice(b"x");
        ctx.udp.handle_datagram(&datagram, udp_client).await.unwrap();
        assert!(wait_for_flows(&ctx.udp, 1).await);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.udp.flow_count().await, 0);
    }

    #[test]
    fn test_udp_source() {
        let requested = TargetAddr::default();
        assert_eq!(udp_source(peer(), &requested), SocketAddr::from(([127, 0, 0, 1], 0)));

        let requested = TargetAddr::from(SocketAddr::from(([0, 0, 0, 0], 40300)));
        assert_eq!(udp_source(peer(), &requested), SocketAddr::from(([127, 0, 0, 1], 40300)));

        let requested = TargetAddr::from(SocketAddr::from(([10, 0, 0, 2], 40300)));
        assert_eq!(udp_source(peer(), &requested), SocketAddr::from(([10, 0, 0, 2], 40300)));
    }

    #[tokio::test]
    async fn test_unspecified_release_spares_other_associations() {
        let ctx = context().await;
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = socks::encode_datagram_header(0, &TargetAddr::from(echo.local_addr().unwrap())).to_vec();
        datagram.extend_from_slice(b"x");

        // Two clients on the same host, each with a 0.0.0.0:0 association
        let source = udp_source(peer(), &TargetAddr::default());
        ctx.udp.associate(source.ip()).await;
        ctx.udp.associate(source.ip()).await;
        for port in [40200, 40201] {
            let client = SocketAddr::from(([127, 0, 0, 1], port));
            ctx.udp.handle_datagram(&datagram, client).await.unwrap();
        }
        assert!(wait_for_flows(&ctx.udp, 2).await);

        assert_eq!(release_udp_flows(&ctx.udp, source).await, 0);
        assert_eq!(ctx.udp.flow_count().await, 2);

        assert_eq!(release_udp_flows(&ctx.udp, source).await, 2);
        assert_eq!(ctx.udp.flow_count().await, 0);
    }

    #[tokio::test]
    async fn test_closing_one_association_keeps_another_clients_flow() {
        let ctx = context().await;
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = socks::encode_datagram_header(0, &TargetAddr::from(echo.local_addr().unwrap())).to_vec();
        datagram.extend_from_slice(b"x");

        let mut associate = vec![0x05, 0x01, 0x00, 0x05, 0x03, 0x00];
        associate.extend(socks::encode_address(&TargetAddr::default()));

        let (mut first, server) = duplex(4096);
        tokio::spawn(handle_connection(server, peer(), ctx.clone()));
        first.write_all(&associate).await.unwrap();
        let mut replies = [0u8; 12];
        first.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[3], 0x00);

        let (mut second, server) = duplex(4096);
        let second_handle = tokio::spawn(handle_connection(server, peer(), ctx.clone()));
        second.write_all(&associate).await.unwrap();
        second.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[3], 0x00);

        let active = SocketAddr::from(([127, 0, 0, 1], 40210));
        ctx.udp.handle_datagram(&datagram, active).await.unwrap();
        assert!(wait_for_flows(&ctx.udp, 1).await);

        drop(second);
        tokio::time::timeout(Duration::from_secs(2), second_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.udp.flow_count().await, 1);
        assert!(ctx.udp.flow_destination(&active).await.is_some());
        drop(first);
    }

    #[tokio::test]
    async fn test_http_connect_forwards_early_data() {
        let ctx = context().await;
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(handle_connection(server, peer(), ctx));

        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: x\r\n\r\nhello", echo.port());
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = vec![0u8; CONNECT_RESPONSE.len() + 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..CONNECT_RESPONSE.len()], CONNECT_RESPONSE);
        assert_eq!(&response[CONNECT_RESPONSE.len()..], b"hello");
    }
}
