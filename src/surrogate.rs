/// 代役流（surrogate stream）
///
/// createConnection 必须同步返回一个可立即使用的双工流，而真正的
/// TLS 连接要等 CONNECT 和握手完成后才存在。代役流在 Pending 阶段
/// 缓冲配置调用、挂起读写，连接就绪后按记录顺序回放配置并原地切换
/// 到真实流；之后所有调用直接转发
use crate::error::AgentError;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 隧道生命周期事件
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// 隧道就绪（TLS 握手完成，配置已回放）
    Connect,
    /// 空闲超时或 CONNECT 响应超时
    Timeout,
    /// 连接建立失败（仅在就绪前出现，最多一次）
    Error(Arc<AgentError>),
    /// 底层流结束（恰好一次）
    Close { had_error: bool },
}

/// 超时事件监听回调（一次性，触发后移除）
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Pending 阶段 destroy 的析构回调（中止 CONNECT / 撤销排队）
pub type DestroyFn = Box<dyn FnOnce() + Send + 'static>;

/// close 钩子（参数为 had_error），工厂用来释放名额、驱逐会话
pub type CloseHook = Box<dyn Fn(bool) + Send + Sync + 'static>;

/// 真实隧道流需要实现的接口
///
/// TLS 层叠加后 socket 级配置（keep-alive）仍要可达，因此额外暴露
/// 底层 TCP socket
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// 底层 TCP socket（无法提供时返回 None，socket 级配置跳过）
    fn tcp_socket(&self) -> Option<&TcpStream> {
        None
    }
}

impl TunnelIo for tokio_rustls::client::TlsStream<crate::transport::ProxyStream> {
    fn tcp_socket(&self) -> Option<&TcpStream> {
        Some(self.get_ref().0.tcp())
    }
}

/// Pending 阶段缓冲的配置
#[derive(Default)]
struct PendingConfig {
    timeout: Option<Duration>,
    keepalive_enable: Option<bool>,
    keepalive_delay: Option<Duration>,
    referenced: bool,
}

struct ConnectedTunnel {
    io: Box<dyn TunnelIo>,
    referenced: bool,
}

enum Phase {
    Pending(PendingConfig),
    Connected(ConnectedTunnel),
    /// 就绪前失败（CONNECT 拒绝、握手失败、调用方 destroy）
    Failed,
    /// 底层流已结束
    Closed,
}

struct Inner {
    phase: Phase,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    subscribers: Vec<mpsc::UnboundedSender<TunnelEvent>>,
    timeout_listeners: Vec<TimeoutCallback>,
    error_emitted: bool,
    close_emitted: bool,
    writable: bool,
    had_error: bool,
    on_destroy: Option<DestroyFn>,
    on_close: Option<CloseHook>,
    // 空闲超时：最近活动时间之后 idle_timeout 内无数据则触发 timeout
    idle_timeout: Option<Duration>,
    last_activity: Instant,
    fired_at: Option<Instant>,
    watcher_epoch: u64,
}

type Shared = Arc<Mutex<Inner>>;

/// 返回给调用方的流对象
pub struct SurrogateStream {
    shared: Shared,
}

/// 工厂侧句柄（attach / fail / 超时转发）
#[derive(Clone)]
pub struct SurrogateHandle {
    shared: Shared,
}

/// 创建一对代役流与工厂句柄
pub fn surrogate_pair() -> (SurrogateStream, SurrogateHandle) {
    let inner = Inner {
        phase: Phase::Pending(PendingConfig {
            referenced: true,
            ..Default::default()
        }),
        read_waker: None,
        write_waker: None,
        subscribers: Vec::new(),
        timeout_listeners: Vec::new(),
        error_emitted: false,
        close_emitted: false,
        writable: true,
        had_error: false,
        on_destroy: None,
        on_close: None,
        idle_timeout: None,
        last_activity: Instant::now(),
        fired_at: None,
        watcher_epoch: 0,
    };
    let shared = Arc::new(Mutex::new(inner));
    (
        SurrogateStream {
            shared: shared.clone(),
        },
        SurrogateHandle { shared },
    )
}

/// 超时监听登记辅助（两个阶段共用）
///
/// timeout > 0 且带回调：登记为一次性监听；
/// timeout == 0 且带回调：仅移除该回调；
/// timeout == 0 不带回调：移除全部监听。
/// 上层客户端按请求登记一次性监听，不及时清除会随请求数线性泄漏
fn update_timeout_listeners(
    listeners: &mut Vec<TimeoutCallback>,
    timeout: Duration,
    cb: Option<&TimeoutCallback>,
) {
    if !timeout.is_zero() {
        if let Some(cb) = cb {
            listeners.push(cb.clone());
        }
    } else if let Some(cb) = cb {
        listeners.retain(|l| !Arc::ptr_eq(l, cb));
    } else {
        listeners.clear();
    }
}

/// 应用 TCP keep-alive（enable 与 delay 相互独立）
fn apply_keepalive(tcp: &TcpStream, enable: Option<bool>, delay: Option<Duration>) {
    let sock = SockRef::from(tcp);

    if let Some(enable) = enable {
        if let Err(e) = sock.set_keepalive(enable) {
            warn!("Failed to toggle TCP keepalive: {}", e);
        }
    }

    if let Some(delay) = delay {
        let keepalive = TcpKeepalive::new().with_time(delay);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive delay: {}", e);
        }
    }
}

fn emit_event(shared: &Shared, event: TunnelEvent) {
    let subscribers = {
        let inner = shared.lock().expect("surrogate lock poisoned");
        inner.subscribers.clone()
    };
    for tx in subscribers {
        let _ = tx.send(event.clone());
    }
}

/// 触发 timeout：事件广播 + 一次性监听排空
fn emit_timeout(shared: &Shared) {
    let (subscribers, listeners) = {
        let mut inner = shared.lock().expect("surrogate lock poisoned");
        let listeners = std::mem::take(&mut inner.timeout_listeners);
        (inner.subscribers.clone(), listeners)
    };
    for tx in subscribers {
        let _ = tx.send(TunnelEvent::Timeout);
    }
    for cb in listeners {
        cb();
    }
}

/// 就绪前的失败：最多一个 error 事件
fn emit_error(shared: &Shared, err: AgentError) {
    let subscribers = {
        let mut inner = shared.lock().expect("surrogate lock poisoned");
        if inner.error_emitted {
            return;
        }
        inner.error_emitted = true;
        inner.subscribers.clone()
    };
    let err = Arc::new(err);
    for tx in subscribers {
        let _ = tx.send(TunnelEvent::Error(err.clone()));
    }
}

/// 关闭路径：恰好执行一次
///
/// 顺序固定：先撤销可写性，再广播 close，最后调用工厂钩子
fn finish_close(shared: &Shared, had_error: bool) {
    let (dropped_io, subscribers, hook, had_error) = {
        let mut inner = shared.lock().expect("surrogate lock poisoned");
        if inner.close_emitted {
            return;
        }
        inner.close_emitted = true;
        inner.writable = false;
        inner.had_error = inner.had_error || had_error;

        // Connected 状态下释放真实流；Failed 保持原状态标记
        let dropped_io = match std::mem::replace(&mut inner.phase, Phase::Closed) {
            Phase::Connected(conn) => Some(conn.io),
            Phase::Failed => {
                inner.phase = Phase::Failed;
                None
            }
            _ => None,
        };

        inner.on_destroy = None;
        let hook = inner.on_close.take();
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
        (dropped_io, inner.subscribers.clone(), hook, inner.had_error)
    };

    drop(dropped_io);

    for tx in subscribers {
        let _ = tx.send(TunnelEvent::Close { had_error });
    }
    if let Some(hook) = hook {
        hook(had_error);
    }
}

/// 空闲超时看护任务
///
/// 自最近一次活动起 idle 满配置时长则触发 timeout 事件，之后等新的
/// 活动出现再重新计时。配置变更时 epoch 递增，旧任务自行退出
fn spawn_idle_watcher(shared: &Shared, epoch: u64) {
    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            let (deadline, duration) = {
                let inner = shared.lock().expect("surrogate lock poisoned");
                if inner.watcher_epoch != epoch || inner.close_emitted {
                    return;
                }
                if !matches!(inner.phase, Phase::Connected(_)) {
                    return;
                }
                let duration = match inner.idle_timeout {
                    Some(d) => d,
                    None => return,
                };
                (inner.last_activity + duration, duration)
            };

            let now = Instant::now();
            if now < deadline {
                tokio::time::sleep_until(deadline.into()).await;
                continue;
            }

            let should_fire = {
                let mut inner = shared.lock().expect("surrogate lock poisoned");
                if inner.watcher_epoch != epoch || inner.close_emitted {
                    return;
                }
                // 同一个空闲期只触发一次
                let fresh = inner.fired_at.map_or(true, |t| t < inner.last_activity);
                if fresh {
                    inner.fired_at = Some(now);
                }
                fresh
            };

            if should_fire {
                debug!("Tunnel idle for {:?}, emitting timeout", duration);
                emit_timeout(&shared);
            }
            tokio::time::sleep(duration).await;
        }
    });
}

impl SurrogateStream {
    /// 订阅生命周期事件
    pub fn events(&self) -> mpsc::UnboundedReceiver<TunnelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .lock()
            .expect("surrogate lock poisoned")
            .subscribers
            .push(tx);
        rx
    }

    /// 设置空闲超时并登记/清除超时监听
    ///
    /// Pending 阶段记录最新值，就绪时恰好应用一次；Connected 阶段
    /// 直接调整空闲计时。timeout 为零表示清除
    pub fn set_timeout(&self, timeout: Duration, cb: Option<TimeoutCallback>) {
        let spawn_epoch = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            update_timeout_listeners(&mut inner.timeout_listeners, timeout, cb.as_ref());

            let value = if timeout.is_zero() { None } else { Some(timeout) };
            match &mut inner.phase {
                Phase::Pending(cfg) => {
                    cfg.timeout = value;
                    None
                }
                Phase::Connected(_) => {
                    inner.idle_timeout = value;
                    inner.last_activity = Instant::now();
                    inner.fired_at = None;
                    inner.watcher_epoch += 1;
                    value.map(|_| inner.watcher_epoch)
                }
                _ => None,
            }
        };

        if let Some(epoch) = spawn_epoch {
            spawn_idle_watcher(&self.shared, epoch);
        }
    }

    /// 设置 TCP keep-alive（enable 调用约定）
    pub fn set_keep_alive(&self, enable: bool, delay: Option<Duration>) {
        let mut inner = self.shared.lock().expect("surrogate lock poisoned");
        match &mut inner.phase {
            Phase::Pending(cfg) => {
                cfg.keepalive_enable = Some(enable);
                if delay.is_some() {
                    cfg.keepalive_delay = delay;
                }
            }
            Phase::Connected(conn) => {
                if let Some(tcp) = conn.io.tcp_socket() {
                    apply_keepalive(tcp, Some(enable), delay);
                }
            }
            _ => {}
        }
    }

    /// 设置 TCP keep-alive（仅 delay 的调用约定）
    pub fn set_keep_alive_delay(&self, delay: Duration) {
        let mut inner = self.shared.lock().expect("surrogate lock poisoned");
        match &mut inner.phase {
            Phase::Pending(cfg) => {
                cfg.keepalive_delay = Some(delay);
            }
            Phase::Connected(conn) => {
                if let Some(tcp) = conn.io.tcp_socket() {
                    apply_keepalive(tcp, None, Some(delay));
                }
            }
            _ => {}
        }
    }

    /// 标记为被引用（默认状态）
    pub fn reference(&self) {
        let mut inner = self.shared.lock().expect("surrogate lock poisoned");
        match &mut inner.phase {
            Phase::Pending(cfg) => cfg.referenced = true,
            Phase::Connected(conn) => conn.referenced = true,
            _ => {}
        }
    }

    /// 取消引用标记（空闲回收时外层客户端参考）
    pub fn unreference(&self) {
        let mut inner = self.shared.lock().expect("surrogate lock poisoned");
        match &mut inner.phase {
            Phase::Pending(cfg) => cfg.referenced = false,
            Phase::Connected(conn) => conn.referenced = false,
            _ => {}
        }
    }

    /// 是否处于被引用状态
    pub fn is_referenced(&self) -> bool {
        let inner = self.shared.lock().expect("surrogate lock poisoned");
        match &inner.phase {
            Phase::Pending(cfg) => cfg.referenced,
            Phase::Connected(conn) => conn.referenced,
            _ => false,
        }
    }

    /// 销毁流
    ///
    /// Pending：中止在途 CONNECT（或撤销排队），错误以 "socket hang up"
    /// 形式浮出；Connected：丢弃真实流并走关闭路径
    pub fn destroy(&self) {
        let action = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            match inner.phase {
                Phase::Pending(_) => {
                    inner.phase = Phase::Failed;
                    inner.writable = false;
                    let destroy = inner.on_destroy.take();
                    if let Some(waker) = inner.read_waker.take() {
                        waker.wake();
                    }
                    if let Some(waker) = inner.write_waker.take() {
                        waker.wake();
                    }
                    Some(destroy)
                }
                Phase::Connected(_) => None,
                _ => return,
            }
        };

        match action {
            Some(destroy) => {
                if let Some(destroy) = destroy {
                    destroy();
                }
                emit_error(&self.shared, AgentError::Aborted);
                finish_close(&self.shared, true);
            }
            None => finish_close(&self.shared, false),
        }
    }

    /// 是否已就绪
    pub fn is_connected(&self) -> bool {
        matches!(
            self.shared.lock().expect("surrogate lock poisoned").phase,
            Phase::Connected(_)
        )
    }

    /// 是否仍在等待隧道建立
    pub fn is_pending(&self) -> bool {
        matches!(
            self.shared.lock().expect("surrogate lock poisoned").phase,
            Phase::Pending(_)
        )
    }

    /// 是否可写（close 事件广播前翻转为 false）
    pub fn is_writable(&self) -> bool {
        self.shared.lock().expect("surrogate lock poisoned").writable
    }

    /// 当前空闲超时配置
    pub fn idle_timeout(&self) -> Option<Duration> {
        let inner = self.shared.lock().expect("surrogate lock poisoned");
        match &inner.phase {
            Phase::Pending(cfg) => cfg.timeout,
            _ => inner.idle_timeout,
        }
    }

    /// 已登记的超时监听数量
    pub fn timeout_listener_count(&self) -> usize {
        self.shared
            .lock()
            .expect("surrogate lock poisoned")
            .timeout_listeners
            .len()
    }
}

impl Drop for SurrogateStream {
    fn drop(&mut self) {
        // 外层客户端丢弃连接等价于 destroy；所有路径幂等
        self.destroy();
    }
}

impl SurrogateHandle {
    /// 设置 Pending destroy 的析构回调
    pub fn set_on_destroy(&self, destroy: DestroyFn) {
        self.shared
            .lock()
            .expect("surrogate lock poisoned")
            .on_destroy = Some(destroy);
    }

    /// 设置 close 钩子
    pub fn set_on_close(&self, hook: CloseHook) {
        self.shared.lock().expect("surrogate lock poisoned").on_close = Some(hook);
    }

    /// 是否已被调用方销毁/失败
    pub fn is_destroyed(&self) -> bool {
        matches!(
            self.shared.lock().expect("surrogate lock poisoned").phase,
            Phase::Failed | Phase::Closed
        )
    }

    /// 转发 CONNECT 阶段的超时通知
    pub fn emit_timeout(&self) {
        emit_timeout(&self.shared);
    }

    /// 隧道建立失败：error 事件（至多一次）+ 关闭路径
    pub fn fail(&self, err: AgentError) {
        {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            if inner.close_emitted {
                return;
            }
            if matches!(inner.phase, Phase::Pending(_)) {
                inner.phase = Phase::Failed;
                inner.writable = false;
            }
            if let Some(waker) = inner.read_waker.take() {
                waker.wake();
            }
            if let Some(waker) = inner.write_waker.take() {
                waker.wake();
            }
        }
        emit_error(&self.shared, err);
        finish_close(&self.shared, true);
    }

    /// 隧道就绪：按记录顺序回放缓冲配置并切换到真实流
    ///
    /// 若调用方已在等待期间销毁流，真实流直接丢弃并走关闭路径
    pub fn attach(&self, io: Box<dyn TunnelIo>) {
        let mut io = Some(io);
        let outcome = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            let cfg = match &mut inner.phase {
                Phase::Pending(cfg) => Some(std::mem::take(cfg)),
                _ => None,
            };

            match (cfg, io.take()) {
                (Some(cfg), Some(io)) => {
                    // 1. 空闲超时
                    if let Some(timeout) = cfg.timeout {
                        inner.idle_timeout = Some(timeout);
                    }
                    // 2. keep-alive：enable 与 delay 各自独立应用
                    if let Some(tcp) = io.tcp_socket() {
                        if let Some(enable) = cfg.keepalive_enable {
                            apply_keepalive(tcp, Some(enable), None);
                        }
                        if let Some(delay) = cfg.keepalive_delay {
                            apply_keepalive(tcp, None, Some(delay));
                        }
                    }
                    // 3. 引用标记
                    inner.phase = Phase::Connected(ConnectedTunnel {
                        io,
                        referenced: cfg.referenced,
                    });

                    inner.last_activity = Instant::now();
                    inner.fired_at = None;
                    if let Some(waker) = inner.read_waker.take() {
                        waker.wake();
                    }
                    if let Some(waker) = inner.write_waker.take() {
                        waker.wake();
                    }

                    if inner.idle_timeout.is_some() {
                        inner.watcher_epoch += 1;
                        Some(Some(inner.watcher_epoch))
                    } else {
                        Some(None)
                    }
                }
                _ => None,
            }
        };

        match outcome {
            Some(spawn_epoch) => {
                emit_event(&self.shared, TunnelEvent::Connect);
                if let Some(epoch) = spawn_epoch {
                    spawn_idle_watcher(&self.shared, epoch);
                }
            }
            None => {
                // 等待期间流已被销毁，真实流直接丢弃
                debug!("Tunnel ready after destroy, discarding");
                drop(io);
                finish_close(&self.shared, false);
            }
        }
    }
}

enum ReadOutcome {
    Done(Poll<io::Result<()>>),
    Eof,
    Broken(io::Error),
}

impl AsyncRead for SurrogateStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let outcome = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            match &mut inner.phase {
                Phase::Pending(_) => {
                    inner.read_waker = Some(cx.waker().clone());
                    ReadOutcome::Done(Poll::Pending)
                }
                Phase::Failed => ReadOutcome::Done(Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "socket hang up",
                )))),
                Phase::Closed => ReadOutcome::Done(Poll::Ready(Ok(()))),
                Phase::Connected(conn) => {
                    let before = buf.filled().len();
                    match Pin::new(&mut conn.io).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            let read = buf.filled().len() - before;
                            if read == 0 {
                                // 底层 end 之后必须补出 close
                                ReadOutcome::Eof
                            } else {
                                inner.last_activity = Instant::now();
                                inner.fired_at = None;
                                ReadOutcome::Done(Poll::Ready(Ok(())))
                            }
                        }
                        Poll::Ready(Err(e)) => ReadOutcome::Broken(e),
                        Poll::Pending => ReadOutcome::Done(Poll::Pending),
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Done(poll) => poll,
            ReadOutcome::Eof => {
                finish_close(&self.shared, false);
                Poll::Ready(Ok(()))
            }
            ReadOutcome::Broken(e) => {
                finish_close(&self.shared, true);
                Poll::Ready(Err(e))
            }
        }
    }
}

enum WriteOutcome<T> {
    Done(Poll<io::Result<T>>),
    Broken(io::Error),
}

impl AsyncWrite for SurrogateStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let outcome = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            match &mut inner.phase {
                Phase::Pending(_) => {
                    inner.write_waker = Some(cx.waker().clone());
                    WriteOutcome::Done(Poll::Pending)
                }
                Phase::Failed | Phase::Closed => WriteOutcome::Done(Poll::Ready(Err(
                    io::Error::new(io::ErrorKind::BrokenPipe, "socket hang up"),
                ))),
                Phase::Connected(conn) => match Pin::new(&mut conn.io).poll_write(cx, buf) {
                    Poll::Ready(Ok(n)) => {
                        inner.last_activity = Instant::now();
                        inner.fired_at = None;
                        WriteOutcome::Done(Poll::Ready(Ok(n)))
                    }
                    Poll::Ready(Err(e)) => WriteOutcome::Broken(e),
                    Poll::Pending => WriteOutcome::Done(Poll::Pending),
                },
            }
        };

        match outcome {
            WriteOutcome::Done(poll) => poll,
            WriteOutcome::Broken(e) => {
                finish_close(&self.shared, true);
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let outcome = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            match &mut inner.phase {
                Phase::Pending(_) => {
                    inner.write_waker = Some(cx.waker().clone());
                    WriteOutcome::Done(Poll::Pending)
                }
                Phase::Failed | Phase::Closed => WriteOutcome::Done(Poll::Ready(Ok(()))),
                Phase::Connected(conn) => match Pin::new(&mut conn.io).poll_flush(cx) {
                    Poll::Ready(Err(e)) => WriteOutcome::Broken(e),
                    other => WriteOutcome::Done(other),
                },
            }
        };

        match outcome {
            WriteOutcome::Done(poll) => poll,
            WriteOutcome::Broken(e) => {
                finish_close(&self.shared, true);
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let outcome = {
            let mut inner = self.shared.lock().expect("surrogate lock poisoned");
            match &mut inner.phase {
                Phase::Pending(_) => {
                    inner.write_waker = Some(cx.waker().clone());
                    WriteOutcome::Done(Poll::Pending)
                }
                Phase::Failed | Phase::Closed => WriteOutcome::Done(Poll::Ready(Ok(()))),
                Phase::Connected(conn) => match Pin::new(&mut conn.io).poll_shutdown(cx) {
                    Poll::Ready(Err(e)) => WriteOutcome::Broken(e),
                    other => WriteOutcome::Done(other),
                },
            }
        };

        match outcome {
            WriteOutcome::Done(poll) => poll,
            WriteOutcome::Broken(e) => {
                finish_close(&self.shared, true);
                Poll::Ready(Err(e))
            }
        }
    }
}
