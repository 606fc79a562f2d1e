//! SOCKS5 address and header codec
//!
//! The TCP request and the UDP datagram share the same layout up to the
//! destination port, so one parser serves both.
//!
//! ```text
//! TCP request:  |VER|CMD|RSV|ATYP|DST.ADDR|DST.PORT|
//! UDP datagram: |RSV  RSV|FRAG|ATYP|DST.ADDR|DST.PORT|DATA|
//! ```
//!
//! UDP headers are captured verbatim and replayed on return traffic
//! instead of being regenerated.

use crate::error::DecodeError;
use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A decoded SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Raw command byte
    pub command: u8,
    /// Requested destination
    pub destination: TargetAddr,
    /// Number of bytes the header occupied
    pub header_len: usize,
}

/// A decoded SOCKS5 UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination the payload is addressed to
    pub destination: TargetAddr,
    /// Header bytes exactly as received
    pub header: Bytes,
    /// Payload with the header stripped
    pub payload: Bytes,
}

/// Parse a SOCKS5 request from the bytes of one client message
pub fn parse_request(data: &[u8]) -> Result<SocksRequest, DecodeError> {
    let (destination, header_len) = parse_address(data)?;
    Ok(SocksRequest {
        command: data[1],
        destination,
        header_len,
    })
}

/// Split a SOCKS5 UDP datagram into destination, header and payload
pub fn decode_datagram(data: &[u8]) -> Result<Datagram, DecodeError> {
    let (destination, header_len) = parse_address(data)?;
    Ok(Datagram {
        destination,
        header: Bytes::copy_from_slice(&data[..header_len]),
        payload: Bytes::copy_from_slice(&data[header_len..]),
    })
}

/// Encode ATYP + address + port for a destination
pub fn encode_address(addr: &TargetAddr) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_address(&mut buf, addr);
    buf.to_vec()
}

/// Encode a UDP datagram header (`RSV RSV FRAG ATYP ADDR PORT`)
pub fn encode_datagram_header(frag: u8, addr: &TargetAddr) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(0);
    buf.put_u8(frag);
    put_address(&mut buf, addr);
    buf.freeze()
}

fn put_address(buf: &mut BytesMut, addr: &TargetAddr) {
    buf.put_u8(addr.addr_type());
    match addr {
        TargetAddr::Ip(std::net::SocketAddr::V4(v4)) => {
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        TargetAddr::Ip(std::net::SocketAddr::V6(v6)) => {
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        TargetAddr::Domain(domain, port) => {
            let name = &domain.as_bytes()[..domain.len().min(MAX_DOMAIN_LEN)];
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
            buf.put_u16(*port);
        }
    }
}

/// Parse the destination starting at the ATYP byte; returns it with the
/// total header length counted from offset 0.
fn parse_address(data: &[u8]) -> Result<(TargetAddr, usize), DecodeError> {
    let atyp = *data
        .get(SOCKS5_ATYP_OFFSET)
        .ok_or(DecodeError::Truncated {
            needed: SOCKS5_ATYP_OFFSET + 1,
            got: data.len(),
        })?;
    let body = &data[SOCKS5_ATYP_OFFSET + 1..];

    match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            ensure_len(data, SOCKS5_IPV4_HEADER_LEN)?;
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            Ok((TargetAddr::ipv4(ip, port), SOCKS5_IPV4_HEADER_LEN))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            ensure_len(data, SOCKS5_IPV6_HEADER_LEN)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[16], body[17]]);
            Ok((
                TargetAddr::ipv6(Ipv6Addr::from(octets), port),
                SOCKS5_IPV6_HEADER_LEN,
            ))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            ensure_len(data, SOCKS5_ATYP_OFFSET + 2)?;
            let len = body[0] as usize;
            let header_len = SOCKS5_DOMAIN_HEADER_BASE_LEN + len;
            ensure_len(data, header_len)?;
            let domain = std::str::from_utf8(&body[1..1 + len])
                .map_err(|_| DecodeError::InvalidDomain)?;
            let port = u16::from_be_bytes([body[1 + len], body[2 + len]]);
            Ok((TargetAddr::domain(domain, port), header_len))
        }

        other => Err(DecodeError::UnknownAddressType(other)),
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            got: data.len(),
        });
    }
    Ok(())
}
