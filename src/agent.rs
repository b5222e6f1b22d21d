/// 代理外观
///
/// 外层 HTTPS 客户端看到的入口：构造时接收两份选项（一份原样转交给
/// 外层 agent，一份描述上游代理），之后通过 create_connection 获取
/// 连接、通过 get_name 获取池键
use crate::config::{AgentOptions, ConnectOptions, ProxyOptions};
use crate::connect::ProxyConnector;
use crate::error::Result;
use crate::factory::TunnelFactory;
use crate::pool::ProxyPool;
use crate::surrogate::SurrogateStream;
use crate::transport::create_proxy_transport;
use std::sync::Arc;
use tracing::info;

pub struct TunnelAgent {
    options: AgentOptions,
    proxy: ProxyOptions,
    pool: Arc<ProxyPool>,
    factory: Arc<TunnelFactory>,
}

impl TunnelAgent {
    /// 创建隧道代理
    ///
    /// 需要在 tokio 运行时内调用（连接池预热和隧道建立都依赖后台任务）
    pub fn new(options: AgentOptions, proxy: ProxyOptions) -> Result<Self> {
        let pool = Arc::new(ProxyPool::new(proxy.address(), proxy.pool.clone()));
        if proxy.pool.min_idle > 0 {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.warmup().await;
            });
        }

        let transport = create_proxy_transport(&proxy, pool.clone())?;
        let connector = ProxyConnector::new(transport, &proxy);
        let base_tls = crate::tls::load_client_config(None, false)?;
        let factory = TunnelFactory::new(connector, base_tls, proxy.max_tunnels);

        info!(
            "Tunnel agent ready, upstream proxy {}://{}",
            proxy.scheme,
            proxy.address()
        );

        Ok(Self {
            options,
            proxy,
            pool,
            factory,
        })
    }

    /// 同步创建一条到目标源站的连接
    pub fn create_connection(&self, options: ConnectOptions) -> SurrogateStream {
        self.factory.create_tunnel(options)
    }

    /// 计算连接在外层池中的键
    ///
    /// 源站键与代理键拼接：同一源站经不同代理的连接不会在共享池中混淆
    pub fn get_name(&self, options: &ConnectOptions) -> String {
        format!("{}:{}", options.origin_pool_key(), self.proxy.pool_key())
    }

    /// 转交给外层 HTTPS 客户端的选项
    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// 上游代理配置
    pub fn proxy_options(&self) -> &ProxyOptions {
        &self.proxy
    }

    /// 代理侧连接池
    pub fn proxy_pool(&self) -> &ProxyPool {
        &self.pool
    }

    /// 当前存活的隧道数
    pub fn active_tunnels(&self) -> usize {
        self.factory.active()
    }

    /// 当前排队的请求数
    pub fn queued_tunnels(&self) -> usize {
        self.factory.queued()
    }

    /// 会话缓存
    pub fn session_cache(&self) -> &crate::session::SessionCache {
        self.factory.session_cache()
    }
}
