//! SOCKS5 protocol constants
//!
//! Defines all constants used in the SOCKS5 protocol implementation.

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

/// Number of methods an anonymous-only greeting must offer
pub const SOCKS5_ANONYMOUS_METHOD_COUNT: u8 = 0x01;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
/// TCP BIND command (not implemented)
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
/// UDP ASSOCIATE command
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

// Header lengths, counted from offset 0
/// Offset of the ATYP byte in requests and UDP datagrams
pub const SOCKS5_ATYP_OFFSET: usize = 3;
/// Header length for an IPv4 destination
pub const SOCKS5_IPV4_HEADER_LEN: usize = 10;
/// Header length for an IPv6 destination
pub const SOCKS5_IPV6_HEADER_LEN: usize = 22;
/// Header length for a domain destination, excluding the domain bytes
pub const SOCKS5_DOMAIN_HEADER_BASE_LEN: usize = 7;

/// Maximum domain name length
pub const MAX_DOMAIN_LEN: usize = 255;
