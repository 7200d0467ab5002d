//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spool_proxy::config::ProxyConfig;
use spool_proxy::lifecycle::{self, Running};
use spool_proxy::net::Endpoint;
use spool_proxy::Shutdown;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;

/// A proxy running on its own engine threads.
pub struct Proxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub running: Running,
}

/// Start a proxy on an ephemeral port in front of `backend`.
pub fn start_proxy(backend: &str) -> Proxy {
    start_proxy_with(backend, |_| {})
}

pub fn start_proxy_with(backend: &str, tweak: impl FnOnce(&mut ProxyConfig)) -> Proxy {
    let mut config = ProxyConfig::default();
    config.listener.addresses = vec!["127.0.0.1:0".to_string()];
    config.engine.backends = vec![backend.to_string()];
    tweak(&mut config);

    let shutdown = Shutdown::new();
    let running = lifecycle::start(&config, &shutdown).unwrap();
    let addr = match &running.endpoints[0] {
        Endpoint::Tcp(addr) => *addr,
        other => panic!("unexpected listener endpoint {other}"),
    };
    Proxy {
        addr,
        shutdown,
        running,
    }
}

/// `HTTP/1.1 200 OK` with a declared-length body.
pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Start a mock backend that records every raw request it receives and
/// answers with `respond(request)`, then closes.
pub async fn start_backend<F>(respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>)
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, respond.clone(), tx.clone()));
        }
    });
    (addr, rx)
}

/// Start a simple mock backend that returns a fixed body.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    start_backend(move |_| ok_response(body)).await
}

/// Same as [`start_backend`], listening on a Unix-domain socket at `path`.
pub fn start_unix_backend<F>(path: &Path, respond: F) -> mpsc::UnboundedReceiver<Vec<u8>>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = UnixListener::bind(path).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, respond.clone(), tx.clone()));
        }
    });
    rx
}

async fn serve<S, F>(mut socket: S, respond: Arc<F>, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&[u8]) -> Vec<u8>,
{
    let request = read_request(&mut socket).await;
    let response = respond(&request);
    let _ = tx.send(request);
    let _ = socket.write_all(&response).await;
    let _ = socket.shutdown().await;
}

/// Reads one request: the head plus a `Content-Length` body.
pub async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(head_len) = head_len(&buf) {
            let total = head_len + content_length(&buf[..head_len]);
            if buf.len() >= total {
                buf.truncate(total);
                return buf;
            }
        }
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Length of the head including its blank line, once complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

/// Sends `request` on a fresh connection and reads until the proxy closes it.
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_to_close(&mut stream).await
}

pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    response
}

/// Receives the next request a backend recorded.
pub async fn recorded(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("backend saw no request")
        .expect("backend stopped")
}

/// Deterministic, non-repeating-looking payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
