//! HTTP upstream chaining
//!
//! TCP dials become an HTTP CONNECT through the upstream proxy. HTTP
//! proxies cannot carry UDP, so datagram sockets are opened directly.

use super::{Connector, DirectConnector, OutboundDatagram, StreamDyn};
use crate::config::UpstreamProxy;
use crate::socks::TargetAddr;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Connector that tunnels TCP dials through an HTTP proxy
#[derive(Debug, Clone)]
pub struct HttpConnector {
    upstream: UpstreamProxy,
    direct: DirectConnector,
}

impl HttpConnector {
    /// Create a connector for the given upstream
    pub fn new(upstream: UpstreamProxy) -> Self {
        HttpConnector {
            upstream,
            direct: DirectConnector::with_defaults(),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let proxy = TargetAddr::from_host(&self.upstream.host, self.upstream.port);
        let mut stream = self
            .direct
            .connect_tcp(&proxy)
            .await
            .with_context(|| format!("Failed to reach upstream {}", self.upstream.endpoint()))?;

        let host = target.host();
        let port = target.port();
        match &self.upstream.auth {
            Some(auth) => {
                async_http_proxy::http_connect_tokio_with_basic_auth(
                    &mut stream,
                    &host,
                    port,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => async_http_proxy::http_connect_tokio(&mut stream, &host, port).await,
        }
        .with_context(|| {
            format!(
                "Upstream {} refused CONNECT to {}",
                self.upstream.endpoint(),
                target
            )
        })?;

        tracing::debug!("Chained to {} via {}", target, self.upstream.endpoint());
        Ok(Box::new(stream))
    }

    async fn bind_datagram(&self, target: &TargetAddr) -> Result<Box<dyn OutboundDatagram>> {
        tracing::debug!(
            "HTTP upstream {} cannot relay UDP, sending to {} directly",
            self.upstream.endpoint(),
            target
        );
        self.direct.bind_datagram(target).await
    }
}
