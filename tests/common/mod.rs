//! Canned-response TCP server for the end-to-end tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use h1wire::service::setup_local_tracing;
use h1wire::TransportConfig;
use parking_lot::Mutex;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tokio_rustls::TlsAcceptor;

/// What the server does after reading one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write these bytes in one go.
    Bytes(Vec<u8>),
    /// Write each fragment separately, pausing in between.
    Fragments(Vec<Vec<u8>>, Duration),
    /// Hold the connection open without answering.
    Silent,
    /// Close the connection without answering.
    Hangup,
}

impl Reply {
    pub fn text(raw: &str) -> Reply {
        Reply::Bytes(raw.as_bytes().to_vec())
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Answers requests with `replies` in order. With `keep_open` a
    /// connection keeps serving requests until the client closes it.
    pub async fn start(replies: Vec<Reply>, keep_open: bool) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (r, q, c) = (replies.clone(), requests.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(socket, r.clone(), q.clone(), keep_open));
            }
        });

        MockServer {
            addr,
            requests,
            connections,
        }
    }

    /// Same as [`MockServer::start`] behind TLS with a self-signed
    /// certificate for `localhost`.
    pub async fn start_tls(replies: Vec<Reply>) -> MockServer {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        let config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![certified.cert.der().clone()], key.into())
                .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (r, q, c) = (replies.clone(), requests.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                c.fetch_add(1, Ordering::SeqCst);
                let (acceptor, r, q) = (acceptor.clone(), r.clone(), q.clone());
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(socket).await {
                        serve_connection(tls, r, q, false).await;
                    }
                });
            }
        });

        MockServer {
            addr,
            requests,
            connections,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn tls_url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.addr.port(), path)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection<S>(
    mut socket: S,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<String>>>,
    keep_open: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(request) = read_request(&mut socket).await else {
            return;
        };
        requests.lock().push(request);
        let reply = replies.lock().pop_front();
        match reply {
            Some(Reply::Bytes(bytes)) => {
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Some(Reply::Fragments(fragments, pause)) => {
                for fragment in fragments {
                    if socket.write_all(&fragment).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    time::sleep(pause).await;
                }
            }
            Some(Reply::Silent) => {
                time::sleep(Duration::from_secs(30)).await;
                return;
            }
            Some(Reply::Hangup) | None => return,
        }
        if !keep_open {
            let _ = socket.shutdown().await;
            return;
        }
    }
}

/// Reads one request head plus a Content-Length body.
async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> Option<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break position + 4;
        }
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };
    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let body_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < head_end + body_length {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    Some(String::from_utf8_lossy(&buffer).to_string())
}

pub fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.timeouts.request_timeout_ms = 5_000;
    config.timeouts.read_timeout_ms = 1_000;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.body.zero_read_delay_ms = 5;
    config
}

pub fn init_tracing() {
    setup_local_tracing().expect("failed to setup tracing");
}
