mod plain;
mod tls;

pub use plain::PlainTransport;
pub use tls::TlsTransport;

use crate::config::{ProxyOptions, ProxyScheme};
use crate::error::Result;
use crate::pool::ProxyPool;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// 到上游代理的字节流
///
/// 隧道建立后源站 TLS 会话直接叠在它上面；`tcp()` 暴露底层 socket，
/// 供 keep-alive 等 socket 级配置在 TLS 层叠加之后仍然可达
#[derive(Debug)]
pub enum ProxyStream {
    /// 明文 TCP（http 代理）
    Plain(TcpStream),
    /// 代理自身走 TLS（https 代理）
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ProxyStream {
    /// 底层 TCP socket
    pub fn tcp(&self) -> &TcpStream {
        match self {
            ProxyStream::Plain(stream) => stream,
            ProxyStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// 代理侧传输接口
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// 建立一条到代理的连接
    async fn connect(&self) -> Result<ProxyStream>;

    /// 代理协议
    fn scheme(&self) -> ProxyScheme;
}

/// 根据代理配置创建传输层客户端
pub fn create_proxy_transport(
    options: &ProxyOptions,
    pool: Arc<ProxyPool>,
) -> Result<Arc<dyn ProxyTransport>> {
    let transport: Arc<dyn ProxyTransport> = match options.scheme {
        ProxyScheme::Http => Arc::new(PlainTransport::new(pool)),
        ProxyScheme::Https => {
            let tls_config =
                crate::tls::load_client_config(options.ca_cert_path.as_deref(), options.skip_verify)?;
            let connector = TlsConnector::from(tls_config);
            Arc::new(TlsTransport::new(options.host.clone(), pool, connector))
        }
    };

    Ok(transport)
}
