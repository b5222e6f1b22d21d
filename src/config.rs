// 配置类型 - 两组选项：转交给外层 HTTPS 客户端的部分，以及描述上游代理的部分

use crate::session::CachedSession;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// HTTPS 默认端口（请求未指定 port 时生效）
pub const DEFAULT_ORIGIN_PORT: u16 = 443;

/// 上游代理自身的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// 明文 HTTP 代理
    #[default]
    Http,
    /// TLS 加密的代理（代理本身走 TLS）
    Https,
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyScheme::Http => write!(f, "http"),
            ProxyScheme::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for ProxyScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" | "tls" => Ok(Self::Https),
            _ => anyhow::bail!("Unknown proxy scheme: {}", s),
        }
    }
}

/// 代理侧连接池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// 预热的空闲连接数
    pub min_idle: usize,
    /// 最大连接数
    pub max_size: usize,
    /// 连接最大空闲时间
    pub max_idle_time: Duration,
    /// 连接建立超时
    pub connect_timeout: Duration,
    /// Keepalive 首次探测时间
    pub keepalive_time: Option<Duration>,
    /// Keepalive 探测间隔
    pub keepalive_interval: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_size: 64,
            max_idle_time: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(5000),
            keepalive_time: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(10)),
        }
    }
}

/// 上游代理配置（每个 agent 实例构造一次，之后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// 代理协议
    #[serde(default)]
    pub scheme: ProxyScheme,
    /// 代理主机
    pub host: String,
    /// 代理端口
    pub port: u16,
    /// CONNECT 交换的默认超时（从发出请求到收到状态行）
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// 同时存活的隧道数量上限（未设置则不限制）
    #[serde(default)]
    pub max_tunnels: Option<usize>,
    /// 随 CONNECT 请求原样发送的额外头部（不解析、不生成）
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// 代理自身为 https 时使用的 CA 证书
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 跳过代理证书校验（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 代理侧连接池参数
    #[serde(default)]
    pub pool: PoolOptions,
}

impl ProxyOptions {
    /// 创建指向明文 HTTP 代理的配置
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: ProxyScheme::Http,
            host: host.into(),
            port,
            timeout: None,
            max_tunnels: None,
            headers: Vec::new(),
            ca_cert_path: None,
            skip_verify: false,
            pool: PoolOptions::default(),
        }
    }

    /// 代理地址（host:port）
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 代理侧的池键（scheme:host:port），用于和源站池键拼接
    pub fn pool_key(&self) -> String {
        format!("{}:{}:{}", self.scheme, self.host, self.port)
    }
}

/// 转交给外层 HTTPS 客户端的选项（agent 自身只读不改）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    /// 是否保持连接复用
    #[serde(default)]
    pub keep_alive: bool,
    /// 外层连接池的 socket 上限
    #[serde(default)]
    pub max_sockets: Option<usize>,
    /// keep-alive 空闲回收时间
    #[serde(default)]
    pub keep_alive_timeout: Option<Duration>,
}

/// 单次连接请求的 TLS 参数（原样转交给 TLS 层）
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// 自定义 CA 证书
    pub ca_cert_path: Option<PathBuf>,
    /// 跳过源站证书校验（仅用于测试）
    pub skip_verify: bool,
    /// SNI 覆盖（默认使用目标主机名）
    pub server_name: Option<String>,
    /// 预构建的 rustls 配置，设置后优先于以上字段
    pub client_config: Option<Arc<rustls::ClientConfig>>,
}

/// 单次连接请求
///
/// `hostname` 优先于 `host`：上层客户端的 `host` 可能已经携带端口，
/// 直接拼接会得到 host:port:port 形式的目标
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// 目标主机（可能含端口，仅在 hostname 缺失时使用）
    pub host: String,
    /// 目标主机名（优先）
    pub hostname: Option<String>,
    /// 目标端口
    pub port: Option<u16>,
    /// 本次 CONNECT 交换的超时，覆盖代理配置的默认值
    pub timeout: Option<Duration>,
    /// 源站身份键（外层池和会话缓存共用）
    pub origin_key: Option<String>,
    /// 预先提供的 TLS 恢复状态，设置后跳过会话缓存
    pub session: Option<CachedSession>,
    /// TLS 参数
    pub tls: TlsOptions,
}

impl ConnectOptions {
    /// 创建指向 host 的请求
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// 生效的目标主机名（hostname 优先）
    pub fn target_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.host)
    }

    /// 生效的目标端口
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_ORIGIN_PORT)
    }

    /// CONNECT 请求行中的目标（host:port）
    pub fn connect_target(&self) -> String {
        format!("{}:{}", self.target_host(), self.effective_port())
    }

    /// TLS 握手使用的服务器名
    pub fn server_name(&self) -> String {
        self.tls
            .server_name
            .clone()
            .unwrap_or_else(|| self.target_host().to_string())
    }

    /// 源站侧的池键（host:port）
    pub fn origin_pool_key(&self) -> String {
        self.connect_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_scheme_roundtrip() {
        assert_eq!("http".parse::<ProxyScheme>().unwrap(), ProxyScheme::Http);
        assert_eq!("https".parse::<ProxyScheme>().unwrap(), ProxyScheme::Https);
        assert_eq!("TLS".parse::<ProxyScheme>().unwrap(), ProxyScheme::Https);
        assert!("socks5".parse::<ProxyScheme>().is_err());
        assert_eq!(ProxyScheme::Https.to_string(), "https");
    }

    #[test]
    fn test_connect_target_default_port() {
        let opts = ConnectOptions::new("www.example.com");
        assert_eq!(opts.effective_port(), DEFAULT_ORIGIN_PORT);
        assert_eq!(opts.connect_target(), "www.example.com:443");
    }

    #[test]
    fn test_hostname_wins_over_host() {
        let opts = ConnectOptions {
            host: "www.example.com:1234".to_string(),
            hostname: Some("www.example.com".to_string()),
            port: Some(1234),
            ..Default::default()
        };
        // host 已带端口，直接使用会得到 host:port:port
        assert_eq!(opts.connect_target(), "www.example.com:1234");
        assert_eq!(opts.server_name(), "www.example.com");
    }

    #[test]
    fn test_server_name_override() {
        let opts = ConnectOptions {
            host: "10.0.0.8".to_string(),
            tls: TlsOptions {
                server_name: Some("internal.example.com".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(opts.server_name(), "internal.example.com");
    }

    #[test]
    fn test_proxy_pool_key_includes_scheme() {
        let mut proxy = ProxyOptions::new("proxy.local", 3128);
        assert_eq!(proxy.pool_key(), "http:proxy.local:3128");
        proxy.scheme = ProxyScheme::Https;
        assert_eq!(proxy.pool_key(), "https:proxy.local:3128");
    }
}
