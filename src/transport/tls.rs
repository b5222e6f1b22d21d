use super::{ProxyStream, ProxyTransport};
use crate::config::ProxyScheme;
use crate::error::{AgentError, Result};
use crate::pool::ProxyPool;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// TLS 传输（代理本身走 TLS 的 https 代理）
pub struct TlsTransport {
    proxy_host: String,
    pool: Arc<ProxyPool>,
    connector: TlsConnector,
}

impl TlsTransport {
    pub fn new(proxy_host: String, pool: Arc<ProxyPool>, connector: TlsConnector) -> Self {
        Self {
            proxy_host,
            pool,
            connector,
        }
    }
}

#[async_trait]
impl ProxyTransport for TlsTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        let tcp_stream = self.pool.get().await?;

        let server_name = ServerName::try_from(self.proxy_host.clone())
            .map_err(|_| AgentError::config_error(format!("Invalid proxy host: {}", self.proxy_host)))?;

        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| AgentError::tls_handshake(&self.proxy_host, e))?;

        debug!("Proxy transport ready (tls) to {}", self.pool.address());
        Ok(ProxyStream::Tls(Box::new(tls_stream)))
    }

    fn scheme(&self) -> ProxyScheme {
        ProxyScheme::Https
    }
}
