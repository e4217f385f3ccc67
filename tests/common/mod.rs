//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxy_gateway::config::BackoffKind;
use proxy_gateway::{ProxyDirective, RequestContext};

/// What a mock backend answers with.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: format!("status {status}"),
            delay: Duration::ZERO,
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One request as received by a mock backend.
#[derive(Debug, Clone)]
pub struct Received {
    pub request_line: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Received {
    pub fn path(&self) -> &str {
        self.request_line.split(' ').nth(1).unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A raw-TCP HTTP/1.1 backend driven by a closure.
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicU32>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockBackend {
    /// Requests answered so far, health probes excluded.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn spec(&self) -> String {
        self.addr.to_string()
    }
}

/// Start a backend on an ephemeral port. `f` gets the zero-based index of
/// the (non-probe) request and the request itself. Requests for `/health`
/// are answered by `f` too but do not count as hits.
pub async fn start_programmable_backend<F>(f: F) -> MockBackend
where
    F: Fn(u32, &Received) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let (task_hits, task_received) = (hits.clone(), received.clone());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let (f, hits, received) = (f.clone(), task_hits.clone(), task_received.clone());
            tokio::spawn(async move {
                let _ = serve_one(socket, f, hits, received).await;
            });
        }
    });

    MockBackend { addr, hits, received }
}

pub async fn start_mock_backend(reply: Reply) -> MockBackend {
    start_programmable_backend(move |_, _| reply.clone()).await
}

async fn serve_one<F>(
    mut socket: TcpStream,
    f: Arc<F>,
    hits: Arc<AtomicU32>,
    received: Arc<Mutex<Vec<Received>>>,
) -> std::io::Result<()>
where
    F: Fn(u32, &Received) -> Reply + Send + Sync + 'static,
{
    let request = read_request(&mut socket).await?;
    let reply = if request.path().starts_with("/health") {
        f(u32::MAX, &request)
    } else {
        let index = hits.fetch_add(1, Ordering::SeqCst);
        received.lock().unwrap().push(request.clone());
        f(index, &request)
    };

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    let response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Received> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(Received {
        request_line,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Static directive with short delays so tests run fast.
pub fn directive(targets: &[String]) -> ProxyDirective {
    let mut directive = ProxyDirective::static_targets(targets.iter().cloned());
    directive.retry.attempts = 3;
    directive.retry.backoff = BackoffKind::Exponential;
    directive.retry.base_delay_ms = 10;
    directive.timeout_ms = 2_000;
    directive.deadline_ms = 5_000;
    directive
}

pub fn get(uri: &str) -> RequestContext {
    RequestContext::from_request(Request::builder().uri(uri).body(Body::empty()).unwrap())
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}
