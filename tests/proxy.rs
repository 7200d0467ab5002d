//! End-to-end proxy tests.
//!
//! Each test runs a real engine thread on an ephemeral port in front of a
//! tokio mock backend, and talks to it over raw sockets.

mod common;

use std::time::Duration;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn split_response(response: &[u8]) -> (String, &[u8]) {
    let len = head_len(response).expect("response has no complete head");
    (text(&response[..len]), &response[len..])
}

#[tokio::test]
async fn forwards_request_with_rewritten_headers() {
    let (backend, mut requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());

    let response = exchange(
        proxy.addr,
        b"GET /x HTTP/1.1\r\nHost: h\r\nConnection: close\r\nKeep-Alive: 5\r\n\r\n",
    )
    .await;

    assert_eq!(
        text(&response),
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nOK"
    );
    assert_eq!(
        text(&recorded(&mut requests).await),
        "GET /x HTTP/1.1\r\nConnection: close\r\nHost: h\r\nX-Forwarded-For: 127.0.0.1\r\n\r\n"
    );
}

#[tokio::test]
async fn appends_peer_to_forwarded_chain() {
    let (backend, mut requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());

    exchange(
        proxy.addr,
        b"GET / HTTP/1.0\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
    )
    .await;

    let request = text(&recorded(&mut requests).await);
    assert!(request.contains("X-Forwarded-For: 10.0.0.1,127.0.0.1\r\n"));
    assert_eq!(request.matches("X-Forwarded-For").count(), 1);
}

#[tokio::test]
async fn serves_pipelined_requests_on_one_connection() {
    let (backend, mut requests) = start_backend(|request| {
        let line = String::from_utf8_lossy(request);
        let path = line.split(' ').nth(1).unwrap_or("?").to_string();
        ok_response(&path)
    })
    .await;
    let proxy = start_proxy(&backend.to_string());

    let response = exchange(
        proxy.addr,
        b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(
        text(&response),
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\n/a\
         HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\n/b"
    );
    // One backend connection per request.
    assert!(text(&recorded(&mut requests).await).starts_with("GET /a "));
    assert!(text(&recorded(&mut requests).await).starts_with("GET /b "));
}

#[tokio::test]
async fn keepalive_connection_serves_sequential_requests() {
    let (backend, _requests) = start_mock_backend("hello").await;
    let proxy = start_proxy(&backend.to_string());
    let expected = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nhello";

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    for _ in 0..3 {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();
        let mut response = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, expected);
    }
}

#[tokio::test]
async fn response_without_length_closes_the_connection() {
    let (backend, _requests) =
        start_backend(|_| b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed".to_vec())
            .await;
    let proxy = start_proxy(&backend.to_string());

    // A keepalive request still ends in close: only EOF delimits this body.
    let response = exchange(proxy.addr, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;

    assert_eq!(
        text(&response),
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nstreamed"
    );
}

#[tokio::test]
async fn interim_response_is_relayed_before_the_final_head() {
    let (backend, _requests) = start_backend(|_| {
        b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\n\
          HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed"
            .to_vec()
    })
    .await;
    let proxy = start_proxy(&backend.to_string());

    // The final response is EOF-delimited, so the keepalive request closes.
    let response = exchange(proxy.addr, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;

    assert_eq!(
        text(&response),
        "HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\n\
         HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nstreamed"
    );
}

#[tokio::test]
async fn interim_response_is_withheld_from_http_10_clients() {
    let (backend, _requests) = start_backend(|_| {
        b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\n\
          HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
            .to_vec()
    })
    .await;
    let proxy = start_proxy(&backend.to_string());

    let response = exchange(proxy.addr, b"GET / HTTP/1.0\r\n\r\n").await;

    assert_eq!(
        text(&response),
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nOK"
    );
}

#[tokio::test]
async fn chunked_request_body_is_forwarded_with_length() {
    let (backend, mut requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());

    exchange(
        proxy.addr,
        b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nContent-Type: text/plain\r\n\
          Connection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;

    let request = recorded(&mut requests).await;
    let (head, body) = split_response(&request);
    assert!(!head.contains("Transfer-Encoding"));
    assert!(head.ends_with("Content-Length: 11\r\nContent-Type: text/plain\r\n\r\n"));
    assert_eq!(body, b"hello world");
}

#[tokio::test]
async fn answers_expect_continue_before_the_body() {
    let (backend, mut requests) = start_mock_backend("stored").await;
    let proxy = start_proxy(&backend.to_string());

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(
            b"PUT /f HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut interim = vec![0u8; 25];
    tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut interim))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"hello").await.unwrap();
    let response = read_to_close(&mut client).await;
    assert!(text(&response).ends_with("\r\n\r\nstored"));

    let request = text(&recorded(&mut requests).await);
    assert!(!request.contains("Expect"));
    assert!(request.ends_with("Content-Length: 5\r\n\r\nhello"));
}

#[tokio::test]
async fn large_request_body_is_spooled_to_disk() {
    const SIZE: usize = 300 * 1024;
    let (backend, mut requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());
    let payload = pattern(SIZE);

    let mut request =
        format!("POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: {SIZE}\r\nConnection: close\r\n\r\n")
            .into_bytes();
    request.extend_from_slice(&payload);
    let response = exchange(proxy.addr, &request).await;
    assert!(text(&response).starts_with("HTTP/1.1 200 OK\r\n"));

    let received = recorded(&mut requests).await;
    let (head, body) = split_response(&received);
    assert!(head.contains(&format!("Content-Length: {SIZE}\r\n")));
    assert_eq!(body, &payload[..]);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let (backend, _requests) = start_mock_backend("OK").await;
    let proxy = start_proxy_with(&backend.to_string(), |config| {
        config.engine.client_max_body_size = 16;
    });

    let response = exchange(
        proxy.addr,
        b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n",
    )
    .await;

    assert_eq!(text(&response), "HTTP/1.1 413 Request Entity Too Large\r\n\r\n");
}

#[tokio::test]
async fn refused_backend_gets_bad_gateway() {
    // Bind then drop to get a port nobody listens on.
    let unused = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let proxy = start_proxy(&unused.to_string());

    let response = exchange(proxy.addr, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;

    assert_eq!(text(&response), "HTTP/1.1 502 Bad Gateway\r\n\r\n");
}

#[tokio::test]
async fn backend_closing_before_head_gets_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            read_request(&mut socket).await;
            drop(socket);
        }
    });
    let proxy = start_proxy(&backend.to_string());

    let response = exchange(proxy.addr, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;

    assert_eq!(text(&response), "HTTP/1.1 502 Bad Gateway\r\n\r\n");
}

#[tokio::test]
async fn slow_client_does_not_hold_back_the_backend() {
    const SIZE: usize = 16 * 1024 * 1024;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {SIZE}\r\n\r\n");
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&pattern(SIZE)).await.unwrap();
        socket.shutdown().await.unwrap();
        let _ = done_tx.send(());
    });
    let proxy = start_proxy(&backend.to_string());

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET /big HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // Nothing is read until the backend wrote its whole response.
    tokio::time::timeout(Duration::from_secs(20), done_rx)
        .await
        .expect("backend blocked behind the client")
        .unwrap();

    let response = read_to_close(&mut client).await;
    let (head, body) = split_response(&response);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\nConnection: close\r\n"));
    assert_eq!(body.len(), SIZE);
    assert!(body == &pattern(SIZE)[..]);
}

#[tokio::test]
async fn simple_request_gets_body_only() {
    let (backend, mut requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());

    let response = exchange(proxy.addr, b"GET /old\r\n").await;

    assert_eq!(text(&response), "OK");
    assert_eq!(
        text(&recorded(&mut requests).await),
        "GET /old HTTP/1.0\r\nConnection: close\r\nX-Forwarded-For: 127.0.0.1\r\n\r\n"
    );
}

#[tokio::test]
async fn proxies_to_unix_socket_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backend.sock");
    let mut requests = start_unix_backend(&path, |_| ok_response("unix"));
    let proxy = start_proxy(&format!("unix:{}", path.display()));

    let response = exchange(
        proxy.addr,
        b"GET /sock HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(text(&response).ends_with("\r\n\r\nunix"));
    assert!(text(&recorded(&mut requests).await).starts_with("GET /sock HTTP/1.1\r\n"));
}

#[tokio::test]
async fn works_with_an_ordinary_http_client() {
    let (backend, _requests) = start_mock_backend("Hello from backend").await;
    let proxy = start_proxy(&backend.to_string());

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{}/hello", proxy.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello from backend");
}

#[tokio::test]
async fn shutdown_closes_idle_connections_and_stops_engines() {
    let (backend, _requests) = start_mock_backend("OK").await;
    let proxy = start_proxy(&backend.to_string());
    let expected = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nOK";

    let mut idle = TcpStream::connect(proxy.addr).await.unwrap();
    idle.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(10), idle.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, expected);

    proxy.shutdown.trigger();
    let running = proxy.running;
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || running.join()),
    )
    .await
    .expect("engines did not stop")
    .unwrap()
    .unwrap();

    // The idle keepalive connection was closed, not left hanging.
    assert!(read_to_close(&mut idle).await.is_empty());
    assert!(TcpStream::connect(proxy.addr).await.is_err());
}
