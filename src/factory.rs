/// 隧道工厂
///
/// createConnection 的同步外观背后的编排：准入（或排队）、发起 CONNECT、
/// 在裸隧道上完成源站 TLS 握手、把真实流接入代役流，并负责关闭路径上的
/// 名额释放与会话驱逐
use crate::admission::{AdmissionQueue, StartFn};
use crate::config::ConnectOptions;
use crate::connect::{ConnectHandle, ProxyConnector};
use crate::error::{AgentError, Result};
use crate::session::{CachedSession, KeyedSessionStore, SessionCache};
use crate::surrogate::{surrogate_pair, SurrogateHandle, SurrogateStream};
use crate::transport::ProxyStream;
use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub struct TunnelFactory {
    connector: ProxyConnector,
    admission: AdmissionQueue,
    sessions: SessionCache,
    base_tls: Arc<rustls::ClientConfig>,
    next_id: AtomicU64,
}

impl TunnelFactory {
    /// 创建工厂
    pub fn new(
        connector: ProxyConnector,
        base_tls: Arc<rustls::ClientConfig>,
        max_tunnels: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            admission: AdmissionQueue::new(max_tunnels),
            sessions: SessionCache::new(),
            base_tls,
            next_id: AtomicU64::new(0),
        })
    }

    /// 当前存活的隧道数
    pub fn active(&self) -> usize {
        self.admission.active()
    }

    /// 当前排队的请求数
    pub fn queued(&self) -> usize {
        self.admission.queued()
    }

    /// 会话缓存
    pub fn session_cache(&self) -> &SessionCache {
        &self.sessions
    }

    /// 同步创建一条隧道连接
    ///
    /// 返回的代役流立即可用；CONNECT 与 TLS 握手在后台任务中推进，
    /// 超过并发上限的请求排队等待名额
    pub fn create_tunnel(self: &Arc<Self>, options: ConnectOptions) -> SurrogateStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stream, surrogate) = surrogate_pair();
        let connect_handle = ConnectHandle::new();

        // admitted：start 是否执行过（名额是否被占用）
        // released：名额是否已归还，关闭钩子与启动任务间幂等
        let admitted = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));

        // 会话恢复状态：请求自带 > 缓存 > 全新
        let origin_key = options.origin_key.clone();
        let session = match (&options.session, &origin_key) {
            (Some(session), _) => session.clone(),
            (None, Some(key)) => self.sessions.get(key).unwrap_or_default(),
            (None, None) => CachedSession::new(),
        };

        // 关闭路径：带错误关闭则驱逐会话；归还名额并启动下一个排队请求
        {
            let factory = self.clone();
            let admitted = admitted.clone();
            let released = released.clone();
            let origin_key = origin_key.clone();
            surrogate.set_on_close(Box::new(move |had_error| {
                if had_error {
                    if let Some(key) = &origin_key {
                        factory.sessions.evict(key);
                    }
                }
                if admitted.load(Ordering::SeqCst) && !released.swap(true, Ordering::SeqCst) {
                    factory.admission.release();
                }
            }));
        }

        // Pending destroy：中止在途 CONNECT，撤销可能还在排队的请求
        {
            let factory = self.clone();
            let handle = connect_handle.clone();
            surrogate.set_on_destroy(Box::new(move || {
                handle.abort();
                factory.admission.cancel(id);
            }));
        }

        // CONNECT 阶段的超时通知转发为流上的 timeout 事件
        {
            let surrogate = surrogate.clone();
            connect_handle.on_timeout(Arc::new(move || {
                surrogate.emit_timeout();
            }));
        }

        let start: StartFn = {
            let factory = self.clone();
            let surrogate = surrogate.clone();
            let admitted = admitted.clone();
            let released = released.clone();
            Box::new(move || {
                admitted.store(true, Ordering::SeqCst);
                tokio::spawn(async move {
                    factory
                        .run_tunnel(id, options, session, surrogate, connect_handle, released)
                        .await;
                });
            })
        };
        self.admission.admit(id, start);

        stream
    }

    /// 推进一条隧道：CONNECT → 源站 TLS 握手 → 接入代役流
    async fn run_tunnel(
        self: Arc<Self>,
        id: u64,
        options: ConnectOptions,
        session: CachedSession,
        surrogate: SurrogateHandle,
        connect_handle: ConnectHandle,
        released: Arc<AtomicBool>,
    ) {
        // 排队期间被销毁又被放行的请求：名额已占用，原样归还
        if surrogate.is_destroyed() {
            debug!("Tunnel #{} destroyed before start", id);
            if !released.swap(true, Ordering::SeqCst) {
                self.admission.release();
            }
            return;
        }

        let target = options.connect_target();
        debug!("Tunnel #{} connecting to {}", id, target);

        let tunnel = match self
            .connector
            .connect(&target, options.timeout, &connect_handle)
            .await
        {
            Ok(tunnel) => tunnel,
            Err(err) => {
                warn!("Tunnel #{} CONNECT failed: {}", id, err);
                surrogate.fail(err);
                return;
            }
        };

        match self.handshake(&options, session.clone(), tunnel).await {
            Ok(tls_stream) => {
                // 新协商的恢复状态落入缓存（同键覆盖）
                if let Some(key) = &options.origin_key {
                    self.sessions.put(key, session);
                }
                debug!("Tunnel #{} ready", id);
                surrogate.attach(Box::new(tls_stream));
            }
            Err(err) => {
                warn!("Tunnel #{} TLS handshake failed: {}", id, err);
                surrogate.fail(err);
            }
        }
    }

    /// 在裸隧道上完成源站 TLS 握手，恢复状态绑定到本请求
    async fn handshake(
        &self,
        options: &ConnectOptions,
        session: CachedSession,
        tunnel: ProxyStream,
    ) -> Result<tokio_rustls::client::TlsStream<ProxyStream>> {
        let base = match &options.tls.client_config {
            Some(config) => config.clone(),
            None if options.tls.ca_cert_path.is_some() || options.tls.skip_verify => {
                crate::tls::load_client_config(
                    options.tls.ca_cert_path.as_deref(),
                    options.tls.skip_verify,
                )?
            }
            None => self.base_tls.clone(),
        };

        // 克隆基础配置，把会话存取绑到本请求的源站键上
        let mut config = (*base).clone();
        config.resumption = Resumption::store(Arc::new(KeyedSessionStore::new(session)));

        let server = options.server_name();
        let server_name = ServerName::try_from(server.clone())
            .map_err(|_| AgentError::config_error(format!("Invalid server name: {}", server)))?;

        let connector = TlsConnector::from(Arc::new(config));
        connector
            .connect(server_name, tunnel)
            .await
            .map_err(|e| AgentError::tls_handshake(server, e))
    }
}
