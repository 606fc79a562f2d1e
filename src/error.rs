//! Error types for Mixproxy
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Mixproxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake or protocol violation on a client connection
    #[error("Connect error: {0}")]
    Connect(String),

    /// Unparsable SOCKS5 address header
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Upstream proxy error
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ProxyError {
    /// Shorthand for a [`ProxyError::Connect`]
    pub fn connect(msg: impl Into<String>) -> Self {
        ProxyError::Connect(msg.into())
    }
}

/// SOCKS5 address header decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended before the header did
    #[error("truncated header: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required to finish the header
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Unknown ATYP byte
    #[error("unknown address type: {0}")]
    UnknownAddressType(u8),

    /// Domain name is not valid UTF-8
    #[error("invalid domain name")]
    InvalidDomain,
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&anyhow::Error> for Socks5ReplyCode {
    fn from(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .map(Socks5ReplyCode::from)
            .unwrap_or(Socks5ReplyCode::GeneralFailure)
    }
}
