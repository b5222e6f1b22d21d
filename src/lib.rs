/// Tunnel Agent 库入口
///
/// 经上游 HTTP 代理（CONNECT 隧道）访问源站的 HTTPS 连接工厂
pub mod admission;
pub mod agent;
pub mod config;
pub mod connect;
pub mod error;
pub mod factory;
pub mod io_util;
pub mod pool;
pub mod session;
pub mod surrogate;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use agent::TunnelAgent;
pub use config::{
    AgentOptions, ConnectOptions, PoolOptions, ProxyOptions, ProxyScheme, TlsOptions,
};
pub use error::{AgentError, Result};
pub use session::{CachedSession, SessionCache};
pub use surrogate::{SurrogateStream, TimeoutCallback, TunnelEvent};
