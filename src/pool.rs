/// 代理侧连接预热池
///
/// 每个 agent 只面向一个上游代理端点。一次 CONNECT 交换会永久占用
/// 一条代理连接：成功后整条连接并入隧道，被拒绝则连同响应一起销毁。
/// 因此这里不做归还复用，只维护一批预拨的热连接：取用时做健康检查，
/// 过期的空闲连接定期淘汰
use crate::config::PoolOptions;
use crate::error::{AgentError, Result};
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 预热的空闲连接
struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, max_idle_time: Duration) -> bool {
        self.last_used.elapsed() > max_idle_time
    }
}

/// 面向单个代理端点的预热池
pub struct ProxyPool {
    address: String,
    options: PoolOptions,
    idle: Mutex<VecDeque<PooledConnection>>,
}

impl ProxyPool {
    /// 创建指向 address 的预热池
    pub fn new(address: String, options: PoolOptions) -> Self {
        Self {
            address,
            options,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// 代理端点地址
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 取出一条到代理的连接
    ///
    /// 优先消耗预热的热连接（取用前健康检查），用尽后现场拨号。
    /// 取出的连接不再回到池中
    pub async fn get(&self) -> Result<TcpStream> {
        self.cleanup_expired();

        while let Some(pooled) = self.pop_idle() {
            if is_connection_healthy(&pooled.stream) {
                debug!("Using warmed connection to proxy {}", self.address);
                return Ok(pooled.stream);
            }
            debug!("Dropping stale warmed connection to proxy {}", self.address);
        }

        self.dial().await
    }

    fn pop_idle(&self) -> Option<PooledConnection> {
        self.idle.lock().expect("proxy pool lock poisoned").pop_front()
    }

    /// 拨一条新连接并应用 keep-alive
    async fn dial(&self) -> Result<TcpStream> {
        debug!("Dialing proxy {}", self.address);
        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(&self.address),
        )
        .await
        .map_err(|_| AgentError::timeout(self.options.connect_timeout))?
        .map_err(|e| AgentError::connection_failed(&self.address, e))?;

        self.apply_keepalive(&stream);
        Ok(stream)
    }

    /// 当前空闲连接数
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("proxy pool lock poisoned").len()
    }

    /// 预热：把空闲连接补足到 min_idle（受 max_size 约束）
    pub async fn warmup(&self) {
        let goal = self.options.min_idle.min(self.options.max_size);

        while self.idle_count() < goal {
            match self.dial().await {
                Ok(stream) => {
                    let mut idle = self.idle.lock().expect("proxy pool lock poisoned");
                    idle.push_back(PooledConnection::new(stream));
                }
                Err(e) => {
                    warn!("Failed to warm up connection to proxy {}: {}", self.address, e);
                    break;
                }
            }
        }

        let warmed = self.idle_count();
        if warmed > 0 {
            debug!("Warmed {} connection(s) to proxy {}", warmed, self.address);
        }
    }

    /// 清理过期的空闲连接
    pub fn cleanup_expired(&self) {
        let mut idle = self.idle.lock().expect("proxy pool lock poisoned");
        let before = idle.len();
        idle.retain(|conn| !conn.is_expired(self.options.max_idle_time));
        let removed = before - idle.len();
        if removed > 0 {
            debug!(
                "Cleaned up {} expired connections to proxy {}",
                removed, self.address
            );
        }
    }

    fn apply_keepalive(&self, stream: &TcpStream) {
        if self.options.keepalive_time.is_none() && self.options.keepalive_interval.is_none() {
            return;
        }

        let mut keepalive = TcpKeepalive::new();
        if let Some(time) = self.options.keepalive_time {
            keepalive = keepalive.with_time(time);
        }
        if let Some(interval) = self.options.keepalive_interval {
            keepalive = keepalive.with_interval(interval);
        }

        let sock_ref = SockRef::from(stream);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on proxy connection: {}", e);
        }
    }
}

/// 检查连接是否健康（未被远端关闭、无错误）
fn is_connection_healthy(stream: &TcpStream) -> bool {
    // try_read 检查连接状态而不消耗数据
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => false, // EOF，连接已关闭
        Ok(_) => {
            // 预热的代理连接上不应该有数据
            warn!("Unexpected data on warmed proxy connection");
            false
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(e) => {
            debug!("Proxy connection health check failed: {}", e);
            false
        }
    }
}
