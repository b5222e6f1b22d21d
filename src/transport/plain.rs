use super::{ProxyStream, ProxyTransport};
use crate::config::ProxyScheme;
use crate::error::Result;
use crate::pool::ProxyPool;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// 明文 TCP 传输（http 代理）
pub struct PlainTransport {
    pool: Arc<ProxyPool>,
}

impl PlainTransport {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProxyTransport for PlainTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        let stream = self.pool.get().await?;
        debug!("Proxy transport ready (plain) to {}", self.pool.address());
        Ok(ProxyStream::Plain(stream))
    }

    fn scheme(&self) -> ProxyScheme {
        ProxyScheme::Http
    }
}
