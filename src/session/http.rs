//! HTTP proxy request parsing
//!
//! Only enough of a request is parsed to find where it should go. The
//! request bytes themselves are forwarded untouched.

use crate::error::ProxyError;
use crate::socks::TargetAddr;
use url::{Host, Url};

/// Response written once an HTTP CONNECT tunnel is up
pub const CONNECT_RESPONSE: &[u8] =
    b"HTTP/1.0 200 Connection Established\r\nConnection: close\r\n\r\n";

/// Port used when a request does not name one
pub const DEFAULT_HTTP_PORT: u16 = 80;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Whether a first read looks like an HTTP request
pub fn is_http(data: &[u8]) -> bool {
    data.windows(4).any(|window| window == b"HTTP")
}

/// Whether the request is an HTTP CONNECT
pub fn is_connect(data: &[u8]) -> bool {
    data.starts_with(b"CONNECT")
}

/// Bytes that follow the request head in the same read
pub fn after_head(data: &[u8]) -> &[u8] {
    match data
        .windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
    {
        Some(pos) => &data[pos + HEADER_END.len()..],
        None => &[],
    }
}

/// Request line and headers of an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method
    pub method: String,
    /// Request target as written
    pub target: String,
    /// HTTP version
    pub version: String,
    /// Header fields in order
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse the head of a request
    pub fn parse(data: &[u8]) -> Result<Self, ProxyError> {
        let head_len = data
            .windows(HEADER_END.len())
            .position(|window| window == HEADER_END)
            .unwrap_or(data.len());
        let head = std::str::from_utf8(&data[..head_len])
            .map_err(|_| ProxyError::connect("request head is not valid UTF-8"))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version), None) if !method.is_empty() => {
                (method, target, version)
            }
            _ => {
                return Err(ProxyError::connect(format!(
                    "malformed request line: {:?}",
                    request_line
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::connect(format!("malformed header: {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Where a plain HTTP request should be sent
    ///
    /// Absolute-form targets name the host themselves; anything else
    /// falls back to the `Host` header.
    pub fn destination(&self) -> Result<TargetAddr, ProxyError> {
        if let Ok(url) = Url::parse(&self.target) {
            if let Some(host) = url.host() {
                let port = url.port().unwrap_or(DEFAULT_HTTP_PORT);
                return Ok(match host {
                    Host::Domain(domain) => TargetAddr::domain(domain, port),
                    Host::Ipv4(ip) => TargetAddr::ipv4(ip, port),
                    Host::Ipv6(ip) => TargetAddr::ipv6(ip, port),
                });
            }
        }

        let host = self
            .header("Host")
            .ok_or_else(|| ProxyError::connect(format!("no host in request for {}", self.target)))?;
        split_host_port(host, DEFAULT_HTTP_PORT)
    }
}

/// Destination of an HTTP CONNECT request
///
/// The authority is split on its first `:`; bracketed IPv6 literals are
/// not understood.
pub fn parse_connect_target(data: &[u8]) -> Result<TargetAddr, ProxyError> {
    let line_end = data
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(data.len());
    let line = std::str::from_utf8(&data[..line_end])
        .map_err(|_| ProxyError::connect("CONNECT line is not valid UTF-8"))?;
    let authority = line
        .split(' ')
        .nth(1)
        .ok_or_else(|| ProxyError::connect(format!("malformed CONNECT line: {:?}", line)))?;

    let (host, port) = authority
        .split_once(':')
        .ok_or_else(|| ProxyError::connect(format!("CONNECT target has no port: {}", authority)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::connect(format!("invalid CONNECT port: {}", port)))?;
    if host.is_empty() {
        return Err(ProxyError::connect("CONNECT target has no host"));
    }
    Ok(TargetAddr::from_host(host, port))
}

fn split_host_port(authority: &str, default_port: u16) -> Result<TargetAddr, ProxyError> {
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::connect(format!("invalid port in {}", authority)))?;
            Ok(TargetAddr::from_host(host.trim_matches(|c| c == '[' || c == ']'), port))
        }
        _ => Ok(TargetAddr::from_host(
            authority.trim_matches(|c| c == '[' || c == ']'),
            default_port,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_is_http() {
        assert!(is_http(b"GET http://example.com/ HTTP/1.1\r\n\r\n"));
        assert!(is_http(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"));
        assert!(!is_http(&[0x05, 0x01, 0x00]));
        assert!(!is_http(b"HTT"));
    }

    #[test]
    fn test_parse_connect_target() {
        let target = parse_connect_target(b"CONNECT example.com:443 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(target, TargetAddr::domain("example.com", 443));

        let target = parse_connect_target(b"CONNECT 127.0.0.1:8443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(target, TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 8443));
    }

    #[test]
    fn test_after_head() {
        assert_eq!(after_head(b"CONNECT a:443 HTTP/1.1\r\n\r\n\x16\x03\x01"), b"\x16\x03\x01");
        assert!(after_head(b"CONNECT a:443 HTTP/1.1\r\nHost: a\r\n\r\n").is_empty());
        assert!(after_head(b"CONNECT a:443 HTTP/1.1\r\n").is_empty());
    }

    #[test]
    fn test_parse_connect_target_invalid() {
        assert!(parse_connect_target(b"CONNECT example.com HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_connect_target(b"CONNECT example.com:http HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_connect_target(b"CONNECT\r\n\r\n").is_err());
        assert!(parse_connect_target(b"CONNECT :80 HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_request_head_parse() {
        let head = RequestHead::parse(
            b"GET http://example.com:8080/path HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\nbody",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com:8080/path");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.header("host"), Some("example.com:8080"));
        assert_eq!(head.header("ACCEPT"), Some("*/*"));
    }

    #[test]
    fn test_request_head_malformed() {
        assert!(RequestHead::parse(b"GARBAGE HTTP\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn test_destination_absolute_form() {
        let head = RequestHead::parse(b"GET http://example.com/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.destination().unwrap(), TargetAddr::domain("example.com", 80));

        let head = RequestHead::parse(b"GET http://127.0.0.1:8080/a HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            head.destination().unwrap(),
            TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 8080)
        );
    }

    #[test]
    fn test_destination_host_header_fallback() {
        let head = RequestHead::parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(head.destination().unwrap(), TargetAddr::domain("example.com", 80));

        let head =
            RequestHead::parse(b"GET / HTTP/1.1\r\nhost: 127.0.0.1:9000\r\n\r\n").unwrap();
        assert_eq!(
            head.destination().unwrap(),
            TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 9000)
        );

        let head = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.destination().is_err());
    }
}
