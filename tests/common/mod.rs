/// Common fixtures for integration tests: a mock CONNECT proxy and a
/// TLS origin server the proxy splices tunnels into.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Install a tracing subscriber once so RUST_LOG surfaces agent internals
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
    });
}

/// Build a TLS acceptor around a fresh in-memory self-signed certificate
pub fn self_signed_acceptor(hosts: &[&str]) -> TlsAcceptor {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let generated =
        rcgen::generate_simple_self_signed(names).expect("Failed to generate certificate");

    let cert = generated.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(generated.signing_key.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("Failed to build server TLS config");
    TlsAcceptor::from(Arc::new(config))
}

/// What the origin does with tunneled bytes
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OriginMode {
    /// Answer each HTTP/1.1 request with a fixed "Success" body (keep-alive)
    Http,
    /// Echo every byte back unchanged
    Echo,
}

/// TLS origin server behind the proxy
pub struct MockOrigin {
    pub addr: String,
    requests: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub async fn start(mode: OriginMode, response_delay: Option<Duration>) -> Self {
        init_tracing();
        let acceptor = self_signed_acceptor(&["localhost", "127.0.0.1", "www.example.com"]);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind origin server");
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(AtomicUsize::new(0));

        let requests_clone = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let requests = requests_clone.clone();
                tokio::spawn(async move {
                    let Ok(tls_stream) = acceptor.accept(socket).await else {
                        return;
                    };
                    match mode {
                        OriginMode::Http => {
                            serve_http(tls_stream, requests, response_delay).await;
                        }
                        OriginMode::Echo => {
                            serve_echo(tls_stream).await;
                        }
                    }
                });
            }
        });

        Self { addr, requests }
    }

    /// Number of tunneled HTTP requests observed
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn serve_http<S>(mut stream: S, requests: Arc<AtomicUsize>, response_delay: Option<Duration>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];
    let mut pending = Vec::new();
    loop {
        // Read one request head; requests carry no body
        loop {
            if pending.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }
        let head_end = pending
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .unwrap();
        pending.drain(..head_end);

        requests.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = response_delay {
            tokio::time::sleep(delay).await;
        }

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nSuccess";
        if stream.write_all(response).await.is_err() {
            return;
        }
        if stream.flush().await.is_err() {
            return;
        }
    }
}

async fn serve_echo<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if stream.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Mock proxy behaviour knobs
#[derive(Clone)]
pub struct ProxyBehavior {
    /// Status for CONNECT responses (non-200 refuses the tunnel)
    pub status: u16,
    pub reason: String,
    /// Delay before answering CONNECT
    pub response_delay: Option<Duration>,
    /// Never answer CONNECT at all
    pub hang: bool,
    /// Accept this many CONNECTs, refuse the rest with `status`/`reason`
    pub fail_after: Option<usize>,
}

impl Default for ProxyBehavior {
    fn default() -> Self {
        Self {
            status: 200,
            reason: "Connection established".to_string(),
            response_delay: None,
            hang: false,
            fail_after: None,
        }
    }
}

/// Mock CONNECT proxy splicing accepted tunnels into the origin
pub struct MockProxy {
    pub addr: String,
    targets: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicUsize>,
}

impl MockProxy {
    pub async fn start(origin_addr: String, behavior: ProxyBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock proxy");
        let addr = listener.local_addr().unwrap().to_string();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));

        let targets_clone = targets.clone();
        let connects_clone = connects.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let origin_addr = origin_addr.clone();
                let behavior = behavior.clone();
                let targets = targets_clone.clone();
                let connects = connects_clone.clone();
                tokio::spawn(async move {
                    handle_proxy_client(socket, origin_addr, behavior, targets, connects).await;
                });
            }
        });

        Self {
            addr,
            targets,
            connects,
        }
    }

    /// Proxy that itself speaks TLS to its clients (https proxy scheme)
    pub async fn start_tls(origin_addr: String, behavior: ProxyBehavior) -> Self {
        let acceptor = self_signed_acceptor(&["localhost", "127.0.0.1"]);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TLS proxy");
        let addr = listener.local_addr().unwrap().to_string();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));

        let targets_clone = targets.clone();
        let connects_clone = connects.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let origin_addr = origin_addr.clone();
                let behavior = behavior.clone();
                let targets = targets_clone.clone();
                let connects = connects_clone.clone();
                tokio::spawn(async move {
                    let Ok(tls_socket) = acceptor.accept(socket).await else {
                        return;
                    };
                    handle_proxy_client(tls_socket, origin_addr, behavior, targets, connects).await;
                });
            }
        });

        Self {
            addr,
            targets,
            connects,
        }
    }

    /// Number of CONNECT requests observed
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// CONNECT request-targets in arrival order
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }

    /// Proxy host and port for agent configuration
    pub fn host_port(&self) -> (String, u16) {
        let (host, port) = self.addr.rsplit_once(':').unwrap();
        (host.to_string(), port.parse().unwrap())
    }
}

async fn handle_proxy_client<S>(
    mut socket: S,
    origin_addr: String,
    behavior: ProxyBehavior,
    targets: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicUsize>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read the CONNECT head
    let mut head = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
                if head.len() > 16 * 1024 {
                    return;
                }
            }
        }
    }

    let head_text = String::from_utf8_lossy(&head);
    let request_line = head_text.lines().next().unwrap_or("");
    let target = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .to_string();

    let seen = connects.fetch_add(1, Ordering::SeqCst) + 1;
    targets.lock().unwrap().push(target);

    if behavior.hang {
        // Hold the connection open until the peer gives up
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    if let Some(delay) = behavior.response_delay {
        tokio::time::sleep(delay).await;
    }

    let accept = match behavior.fail_after {
        Some(limit) => seen <= limit,
        None => behavior.status == 200,
    };

    if !accept {
        let (status, reason) = if behavior.status != 200 {
            (behavior.status, behavior.reason.as_str())
        } else {
            (500, "Connection Error")
        };
        let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
        let _ = socket.write_all(response.as_bytes()).await;
        return;
    }

    if socket
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    let Ok(mut origin) = TcpStream::connect(&origin_addr).await else {
        return;
    };
    let _ = tokio::io::copy_bidirectional(&mut socket, &mut origin).await;
}

/// Write one HTTP/1.1 request over the tunnel and read the full response
pub async fn send_http_request<S>(stream: &mut S, host: &str) -> Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    stream
        .flush()
        .await
        .map_err(|e| format!("flush failed: {}", e))?;

    let result = timeout(Duration::from_secs(5), async {
        let mut response = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    if response.ends_with(b"Success") {
                        break;
                    }
                }
                Err(e) => return Err(format!("read failed: {}", e)),
            }
        }
        Ok(String::from_utf8_lossy(&response).into_owned())
    })
    .await
    .map_err(|_| "timeout waiting for response".to_string())?;

    result
}
