/// TLS 会话缓存
///
/// 以源站身份键索引 TLS 恢复状态，同一源站的后续隧道走简化握手。
/// rustls 通过 ClientSessionStore 回调读写恢复状态；KeyedSessionStore
/// 把一次握手绑定到一个键上，握手后的 ticket 写入即缓存更新
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// 单个源站保留的 TLS 1.3 ticket 数量上限
const MAX_TLS13_TICKETS: usize = 4;

#[derive(Default)]
struct SessionEntry {
    kx_hint: Option<NamedGroup>,
    tls12: Option<Tls12ClientSessionValue>,
    tls13: VecDeque<Tls13ClientSessionValue>,
}

/// 一个源站的 TLS 恢复状态句柄
///
/// 克隆共享同一份状态；请求方可以通过 `ConnectOptions::session`
/// 直接提供，跳过缓存查询
#[derive(Clone, Default)]
pub struct CachedSession {
    inner: Arc<Mutex<SessionEntry>>,
}

impl CachedSession {
    /// 创建空的恢复状态
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否尚无任何可恢复的状态
    pub fn is_empty(&self) -> bool {
        let entry = self.inner.lock().expect("session entry lock poisoned");
        entry.kx_hint.is_none() && entry.tls12.is_none() && entry.tls13.is_empty()
    }

    /// 是否持有可用的会话（TLS 1.2 会话或 TLS 1.3 ticket）
    pub fn has_ticket(&self) -> bool {
        let entry = self.inner.lock().expect("session entry lock poisoned");
        entry.tls12.is_some() || !entry.tls13.is_empty()
    }

    fn set_kx_hint(&self, group: NamedGroup) {
        self.inner.lock().expect("session entry lock poisoned").kx_hint = Some(group);
    }

    fn kx_hint(&self) -> Option<NamedGroup> {
        self.inner.lock().expect("session entry lock poisoned").kx_hint
    }

    fn set_tls12(&self, value: Tls12ClientSessionValue) {
        self.inner.lock().expect("session entry lock poisoned").tls12 = Some(value);
    }

    fn tls12(&self) -> Option<Tls12ClientSessionValue> {
        self.inner
            .lock()
            .expect("session entry lock poisoned")
            .tls12
            .clone()
    }

    fn remove_tls12(&self) {
        self.inner.lock().expect("session entry lock poisoned").tls12 = None;
    }

    fn push_tls13(&self, value: Tls13ClientSessionValue) {
        let mut entry = self.inner.lock().expect("session entry lock poisoned");
        if entry.tls13.len() >= MAX_TLS13_TICKETS {
            entry.tls13.pop_front();
        }
        entry.tls13.push_back(value);
    }

    fn take_tls13(&self) -> Option<Tls13ClientSessionValue> {
        self.inner
            .lock()
            .expect("session entry lock poisoned")
            .tls13
            .pop_front()
    }
}

impl fmt::Debug for CachedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = self.inner.lock().expect("session entry lock poisoned");
        f.debug_struct("CachedSession")
            .field("kx_hint", &entry.kx_hint)
            .field("has_tls12", &entry.tls12.is_some())
            .field("tls13_tickets", &entry.tls13.len())
            .finish()
    }
}

/// 以源站键索引的会话缓存
///
/// 同键覆盖写入；未知键静默返回 None；隧道带错误关闭时驱逐
#[derive(Default)]
pub struct SessionCache {
    entries: Mutex<HashMap<String, CachedSession>>,
}

impl SessionCache {
    /// 创建空缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询源站的恢复状态
    pub fn get(&self, origin_key: &str) -> Option<CachedSession> {
        self.entries
            .lock()
            .expect("session cache lock poisoned")
            .get(origin_key)
            .cloned()
    }

    /// 写入源站的恢复状态（同键覆盖）
    pub fn put(&self, origin_key: &str, session: CachedSession) {
        debug!("Caching TLS session state for '{}'", origin_key);
        self.entries
            .lock()
            .expect("session cache lock poisoned")
            .insert(origin_key.to_string(), session);
    }

    /// 驱逐源站的恢复状态
    pub fn evict(&self, origin_key: &str) {
        let removed = self
            .entries
            .lock()
            .expect("session cache lock poisoned")
            .remove(origin_key);
        if removed.is_some() {
            debug!("Evicted TLS session state for '{}'", origin_key);
        }
    }

    /// 缓存的源站数量
    pub fn len(&self) -> usize {
        self.entries.lock().expect("session cache lock poisoned").len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 绑定到单个源站键的 rustls 会话存储
///
/// rustls 按 SNI 调用存储接口，这里忽略 SNI、统一落到请求的源站键：
/// 握手前的查询即缓存读取，握手后的 ticket 写入即缓存更新
#[derive(Debug)]
pub struct KeyedSessionStore {
    session: CachedSession,
}

impl KeyedSessionStore {
    /// 用指定的恢复状态创建存储
    pub fn new(session: CachedSession) -> Self {
        Self { session }
    }
}

impl ClientSessionStore for KeyedSessionStore {
    fn set_kx_hint(&self, _server_name: ServerName<'static>, group: NamedGroup) {
        self.session.set_kx_hint(group);
    }

    fn kx_hint(&self, _server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.session.kx_hint()
    }

    fn set_tls12_session(&self, _server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.session.set_tls12(value);
    }

    fn tls12_session(&self, _server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.session.tls12()
    }

    fn remove_tls12_session(&self, _server_name: &ServerName<'_>) {
        self.session.remove_tls12();
    }

    fn insert_tls13_ticket(&self, _server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.session.push_tls13(value);
    }

    fn take_tls13_ticket(&self, _server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        self.session.take_tls13()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_returns_none() {
        let cache = SessionCache::new();
        assert!(cache.get("nobody:443").is_none());
        // 驱逐未知键不报错
        cache.evict("nobody:443");
    }

    #[test]
    fn test_put_get_evict() {
        let cache = SessionCache::new();
        let session = CachedSession::new();
        session.set_kx_hint(NamedGroup::X25519);

        cache.put("example.com:443", session);
        let found = cache.get("example.com:443").expect("entry present");
        assert!(!found.is_empty());
        assert_eq!(cache.len(), 1);

        cache.evict("example.com:443");
        assert!(cache.get("example.com:443").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = SessionCache::new();
        let first = CachedSession::new();
        first.set_kx_hint(NamedGroup::X25519);
        let second = CachedSession::new();
        second.set_kx_hint(NamedGroup::secp256r1);

        cache.put("example.com:443", first);
        cache.put("example.com:443", second);

        let found = cache.get("example.com:443").expect("entry present");
        assert_eq!(found.kx_hint(), Some(NamedGroup::secp256r1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shared_handle_sees_updates() {
        let cache = SessionCache::new();
        let session = CachedSession::new();
        cache.put("example.com:443", session.clone());

        // 握手后通过存储适配器写入的状态，缓存句柄立即可见
        session.set_kx_hint(NamedGroup::X25519);
        let found = cache.get("example.com:443").expect("entry present");
        assert!(!found.is_empty());
    }

    #[test]
    fn test_empty_session_reports_empty() {
        let session = CachedSession::new();
        assert!(session.is_empty());
        assert!(!session.has_ticket());
    }
}
