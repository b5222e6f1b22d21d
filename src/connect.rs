/// CONNECT 交换
///
/// 对上游代理发起一次 HTTP/1.1 CONNECT，成功后把底层字节流作为裸隧道
/// 交给调用方。每条隧道恰好一次 CONNECT；被拒绝的连接直接销毁不复用
use crate::config::ProxyOptions;
use crate::error::{AgentError, Result};
use crate::io_util::{read_http_head, write_vectored_all, DEFAULT_MAX_HEAD_SIZE};
use crate::surrogate::TimeoutCallback;
use crate::transport::{ProxyStream, ProxyTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一次 CONNECT 交换的请求句柄
///
/// 调用方通过它中止交换（destroy 场景）或订阅超时通知。
/// 超时只通知不中止：要不要放弃由调用方决定
#[derive(Clone, Default)]
pub struct ConnectHandle {
    cancel: CancellationToken,
    timeout_listeners: Arc<Mutex<Vec<TimeoutCallback>>>,
}

impl ConnectHandle {
    /// 创建新句柄
    pub fn new() -> Self {
        Self::default()
    }

    /// 中止进行中的 CONNECT 交换
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// 是否已被中止
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 注册超时通知回调
    pub fn on_timeout(&self, cb: TimeoutCallback) {
        self.timeout_listeners
            .lock()
            .expect("connect handle lock poisoned")
            .push(cb);
    }

    async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn notify_timeout(&self) {
        let listeners = self
            .timeout_listeners
            .lock()
            .expect("connect handle lock poisoned")
            .clone();
        for cb in listeners {
            cb();
        }
    }
}

/// 面向单个上游代理的 CONNECT 客户端
pub struct ProxyConnector {
    transport: Arc<dyn ProxyTransport>,
    default_timeout: Option<Duration>,
    headers: Vec<(String, String)>,
}

impl ProxyConnector {
    /// 创建连接器
    pub fn new(transport: Arc<dyn ProxyTransport>, options: &ProxyOptions) -> Self {
        Self {
            transport,
            default_timeout: options.timeout,
            headers: options.headers.clone(),
        }
    }

    /// 对 target（host:port）发起 CONNECT，返回裸隧道字节流
    ///
    /// timeout 覆盖从发出请求到收到状态行的区间；到期仅触发句柄上的
    /// 超时通知，交换本身继续等待
    pub async fn connect(
        &self,
        target: &str,
        timeout: Option<Duration>,
        handle: &ConnectHandle,
    ) -> Result<ProxyStream> {
        let mut stream = tokio::select! {
            result = self.transport.connect() => result?,
            _ = handle.cancelled() => return Err(AgentError::Aborted),
        };

        debug!("Sending CONNECT {} to upstream proxy", target);

        let request_line = format!("CONNECT {} HTTP/1.1\r\n", target);
        let host_header = format!("Host: {}\r\n", target);
        let mut extra_headers = String::new();
        for (name, value) in &self.headers {
            // 额外头部原样转发，不解析内容
            extra_headers.push_str(name);
            extra_headers.push_str(": ");
            extra_headers.push_str(value);
            extra_headers.push_str("\r\n");
        }

        let bufs = [
            request_line.as_bytes(),
            host_header.as_bytes(),
            extra_headers.as_bytes(),
            b"\r\n",
        ];
        tokio::select! {
            result = write_vectored_all(&mut stream, &bufs) => result?,
            _ = handle.cancelled() => return Err(AgentError::Aborted),
        }

        let effective_timeout = timeout.or(self.default_timeout);
        let (head, leftover) = {
            let read_fut = read_http_head(&mut stream, DEFAULT_MAX_HEAD_SIZE);
            tokio::pin!(read_fut);

            let overdue = async {
                match effective_timeout {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(overdue);

            let mut notified = false;
            loop {
                tokio::select! {
                    result = &mut read_fut => break result?,
                    _ = handle.cancelled() => return Err(AgentError::Aborted),
                    _ = &mut overdue, if !notified => {
                        notified = true;
                        warn!("CONNECT {} response overdue, notifying caller", target);
                        handle.notify_timeout();
                    }
                }
            }
        };

        let (code, reason) = parse_status_line(&head)?;
        if code != 200 {
            // 非 200 的响应连同底层连接一起丢弃
            debug!("Proxy refused CONNECT {}: {} {}", target, code, reason);
            return Err(AgentError::proxy_refused(code, reason));
        }

        // CONNECT 响应后不应再有预读数据（RFC 7230 §4.3.6）
        if !leftover.is_empty() {
            return Err(AgentError::UnexpectedData(leftover.len()));
        }

        debug!("Tunnel to {} established", target);
        Ok(stream)
    }
}

/// 解析 CONNECT 响应状态行，返回状态码和 reason phrase
fn parse_status_line(head: &[u8]) -> Result<(u16, String)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| AgentError::MalformedResponse("head is not valid UTF-8".to_string()))?;
    let line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| AgentError::MalformedResponse("missing status line".to_string()))?;

    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| AgentError::MalformedResponse("empty status line".to_string()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(AgentError::MalformedResponse(format!(
            "unexpected version: {}",
            version
        )));
    }

    let code: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AgentError::MalformedResponse(format!("bad status code in: {}", line)))?;

    // reason phrase 允许为空
    let reason = parts.next().unwrap_or("").to_string();

    Ok((code, reason))
}
