//! SOCKS5 reply builder
//!
//! Constructs the method-selection message and the command reply.
//! Replies always carry an IPv4 bound address: the advertised proxy
//! endpoint that UDP clients must send their datagrams to.

use crate::error::Socks5ReplyCode;
use crate::socks::consts::*;
use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Build the reply bytes for a command
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' | X'01'|    4     |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn build_reply(code: Socks5ReplyCode, bind_addr: SocketAddrV4) -> [u8; 10] {
    let mut reply = [0u8; 10];
    reply[0] = SOCKS5_VERSION;
    reply[1] = code.into();
    reply[2] = SOCKS5_RESERVED;
    reply[3] = SOCKS5_ADDR_TYPE_IPV4;
    reply[4..8].copy_from_slice(&bind_addr.ip().octets());
    reply[8..10].copy_from_slice(&bind_addr.port().to_be_bytes());
    reply
}

/// Send the "no authentication" method selection
pub async fn send_method_selection<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Send a success reply pointing at the advertised proxy endpoint
pub async fn send_success<S>(stream: &mut S, advertised: SocketAddrV4) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, Socks5ReplyCode::Succeeded, advertised).await
}

/// Send a failure reply with an empty bound address
pub async fn send_failure<S>(stream: &mut S, code: Socks5ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, code, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await
}

async fn send_reply<S>(stream: &mut S, code: Socks5ReplyCode, addr: SocketAddrV4) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = build_reply(code, addr);
    tracing::trace!("[Output] > {:?}", reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
