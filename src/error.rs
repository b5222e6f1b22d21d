/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 上层 HTTPS 客户端依赖这些类型决定是否重试或放弃
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道代理的主要错误类型
#[derive(Error, Debug)]
pub enum AgentError {
    /// 无法连接到上游代理
    #[error("Failed to connect to proxy {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 代理拒绝了 CONNECT 请求（非 200 响应）
    ///
    /// Display 输出即代理返回的 reason phrase，状态码通过 `code()` 获取
    #[error("{reason}")]
    ProxyRefused { code: u16, reason: String },

    /// CONNECT 响应头之后跟随了多余的数据（代理行为越界）
    #[error("Unexpected {0} byte(s) after CONNECT response")]
    UnexpectedData(usize),

    /// 代理返回的响应头无法解析
    #[error("Malformed CONNECT response: {0}")]
    MalformedResponse(String),

    /// CONNECT 交换被调用方中止
    #[error("socket hang up")]
    Aborted,

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// TLS 握手失败
    #[error("TLS handshake with {server} failed: {source}")]
    TlsHandshake {
        server: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// 创建代理连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建代理拒绝错误
    pub fn proxy_refused(code: u16, reason: impl Into<String>) -> Self {
        Self::ProxyRefused {
            code,
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建 TLS 握手失败错误
    pub fn tls_handshake(server: impl Into<String>, source: io::Error) -> Self {
        Self::TlsHandshake {
            server: server.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 代理返回的状态码（仅 ProxyRefused 有值）
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::ProxyRefused { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 检查是否为代理拒绝错误
    pub fn is_proxy_refused(&self) -> bool {
        matches!(self, Self::ProxyRefused { .. })
    }

    /// 检查是否为调用方中止
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_refused_display_is_reason_phrase() {
        let err = AgentError::proxy_refused(500, "Connection Error");
        assert!(err.is_proxy_refused());
        assert_eq!(err.to_string(), "Connection Error");
        assert_eq!(err.code(), Some(500));
    }

    #[test]
    fn test_aborted_message() {
        let err = AgentError::Aborted;
        assert!(err.is_aborted());
        assert!(err.to_string().contains("socket hang up"));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_timeout_error() {
        let err = AgentError::timeout(Duration::from_millis(20));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = AgentError::connection_failed("127.0.0.1:3128", io_err);
        assert!(err.to_string().contains("Failed to connect to proxy"));
        assert!(err.to_string().contains("127.0.0.1:3128"));
    }

    #[test]
    fn test_error_is_checks() {
        let refused = AgentError::proxy_refused(407, "Proxy Authentication Required");
        let config = AgentError::config_error("bad port");
        let timeout = AgentError::timeout(Duration::from_secs(1));

        assert!(refused.is_proxy_refused());
        assert!(!refused.is_timeout());
        assert!(!refused.is_config_error());

        assert!(config.is_config_error());
        assert!(!config.is_proxy_refused());

        assert!(timeout.is_timeout());
        assert!(!timeout.is_aborted());
    }
}
